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
//! Identifiers shared by the dispatcher and the task runtime.
//!
//! Ids render as dotted paths (`query.stage`, `query.stage.execution`,
//! `query.stage.execution.partition.attempt`), which is also the format accepted by
//! `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Globally unique query identifier.
///
/// Only lowercase ascii letters, digits and `_` are accepted so the id can be embedded in
/// file names and dotted task ids.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.is_empty() {
            return Err("query id is empty".to_string());
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
        {
            return Err(format!("invalid character {:?} in query id {}", c, id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StageId {
    pub query_id: QueryId,
    pub id: u32,
}

impl StageId {
    pub fn new(query_id: QueryId, id: u32) -> Self {
        Self { query_id, id }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query_id, self.id)
    }
}

/// Split `s` at its last `.` into the parent id text and a numeric component.
fn split_last<'a>(s: &'a str, kind: &str) -> Result<(&'a str, u32), String> {
    let (parent, last) = s
        .rsplit_once('.')
        .ok_or_else(|| format!("invalid {}: {}", kind, s))?;
    let number = last
        .parse::<u32>()
        .map_err(|_| format!("invalid {} component {:?} in {}", kind, last, s))?;
    Ok((parent, number))
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (query_id, id) = split_last(s, "stage id")?;
        Ok(Self::new(query_id.parse()?, id))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StageExecutionId {
    pub stage_id: StageId,
    pub id: u32,
}

impl StageExecutionId {
    pub fn new(stage_id: StageId, id: u32) -> Self {
        Self { stage_id, id }
    }
}

impl fmt::Display for StageExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage_id, self.id)
    }
}

impl FromStr for StageExecutionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stage_id, id) = split_last(s, "stage execution id")?;
        Ok(Self::new(stage_id.parse()?, id))
    }
}

/// Task identifier scoped to (query, stage execution, partition, attempt).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId {
    pub stage_execution_id: StageExecutionId,
    pub partition: u32,
    pub attempt_number: u32,
}

impl TaskId {
    pub fn new(stage_execution_id: StageExecutionId, partition: u32, attempt_number: u32) -> Self {
        Self {
            stage_execution_id,
            partition,
            attempt_number,
        }
    }

    /// Convenience constructor for the first stage execution of a stage.
    pub fn for_stage(query_id: &QueryId, stage: u32, partition: u32, attempt_number: u32) -> Self {
        let stage_id = StageId::new(query_id.clone(), stage);
        Self::new(StageExecutionId::new(stage_id, 0), partition, attempt_number)
    }

    pub fn query_id(&self) -> &QueryId {
        &self.stage_execution_id.stage_id.query_id
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.stage_execution_id, self.partition, self.attempt_number
        )
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, attempt_number) = split_last(s, "task id")?;
        let (execution_id, partition) = split_last(rest, "task id")?;
        Ok(Self::new(execution_id.parse()?, partition, attempt_number))
    }
}
