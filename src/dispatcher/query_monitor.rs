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
//! Query event hooks.

use crate::common::error::ExecutionFailureInfo;
use crate::novaexec_logging::warn;
use crate::runtime::query_state_machine::BasicQueryInfo;

pub trait QueryMonitor: Send + Sync {
    /// The query failed or was canceled before it reached execution.
    fn query_immediate_failure_event(&self, info: &BasicQueryInfo, failure: &ExecutionFailureInfo);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingQueryMonitor;

impl QueryMonitor for LoggingQueryMonitor {
    fn query_immediate_failure_event(&self, info: &BasicQueryInfo, failure: &ExecutionFailureInfo) {
        warn!(
            "query {} failed immediately in state {:?} after {:?}: {} ({})",
            info.query_id,
            info.state,
            info.elapsed_time,
            failure.message,
            failure.error_code.name()
        );
    }
}
