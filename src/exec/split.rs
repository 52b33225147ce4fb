// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Splits assigned to a task by the connector layer.

use bytes::Bytes;

use crate::common::ids::TaskId;
use crate::common::util::succinct_bytes;
use crate::novaexec_logging::info;

#[derive(Clone, Debug)]
pub struct Split {
    pub split_id: u64,
    /// Estimated input size reported by the connector, if it knows one.
    pub size_hint: Option<u64>,
    /// Serialized pages produced by the connector for this split.
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub struct TaskSource {
    pub plan_node_id: String,
    pub splits: Vec<Split>,
    pub no_more_splits: bool,
}

impl TaskSource {
    pub fn new(plan_node_id: impl Into<String>, splits: Vec<Split>) -> Self {
        Self {
            plan_node_id: plan_node_id.into(),
            splits,
            no_more_splits: true,
        }
    }
}

/// Sum of the size hints of every split, or `None` if any split has no hint.
pub fn total_split_size(sources: &[TaskSource]) -> Option<u64> {
    sources
        .iter()
        .flat_map(|s| s.splits.iter())
        .try_fold(0u64, |acc, split| {
            split.size_hint.map(|size| acc.saturating_add(size))
        })
}

pub fn log_split_summary(task_id: &TaskId, sources: &[TaskSource]) {
    let count: usize = sources.iter().map(|s| s.splits.len()).sum();
    match total_split_size(sources) {
        Some(size) => info!(
            "Received {} splits for task {}, total split size {}",
            count,
            task_id,
            succinct_bytes(size)
        ),
        None => info!(
            "Received {} splits for task {}, total split size unknown",
            count, task_id
        ),
    }
}
