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
//! Dispatch progress reported to the client protocol layer.

use std::time::Duration;

use serde::Serialize;

use crate::common::error::ExecutionFailureInfo;

/// Where a dispatched query runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorLocation {
    pub uri: Option<String>,
}

impl CoordinatorLocation {
    /// The query runs on the coordinator that dispatched it.
    pub fn local() -> Self {
        Self { uri: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DispatchInfo {
    #[serde(rename_all = "camelCase")]
    Failed {
        failure_info: ExecutionFailureInfo,
        elapsed_time: Duration,
        waiting_for_prerequisites_time: Duration,
        queued_time: Duration,
    },
    #[serde(rename_all = "camelCase")]
    Dispatched {
        coordinator_location: CoordinatorLocation,
        elapsed_time: Duration,
        waiting_for_prerequisites_time: Duration,
        queued_time: Duration,
    },
    #[serde(rename_all = "camelCase")]
    Queued {
        elapsed_time: Duration,
        waiting_for_prerequisites_time: Duration,
        queued_time: Duration,
    },
    #[serde(rename_all = "camelCase")]
    WaitingForPrerequisites {
        elapsed_time: Duration,
        waiting_for_prerequisites_time: Duration,
    },
}

impl DispatchInfo {
    pub fn elapsed_time(&self) -> Duration {
        match self {
            DispatchInfo::Failed { elapsed_time, .. }
            | DispatchInfo::Dispatched { elapsed_time, .. }
            | DispatchInfo::Queued { elapsed_time, .. }
            | DispatchInfo::WaitingForPrerequisites { elapsed_time, .. } => *elapsed_time,
        }
    }

    pub fn waiting_for_prerequisites_time(&self) -> Duration {
        match self {
            DispatchInfo::Failed {
                waiting_for_prerequisites_time,
                ..
            }
            | DispatchInfo::Dispatched {
                waiting_for_prerequisites_time,
                ..
            }
            | DispatchInfo::Queued {
                waiting_for_prerequisites_time,
                ..
            }
            | DispatchInfo::WaitingForPrerequisites {
                waiting_for_prerequisites_time,
                ..
            } => *waiting_for_prerequisites_time,
        }
    }

    /// Zero while the query is still waiting for prerequisites.
    pub fn queued_time(&self) -> Duration {
        match self {
            DispatchInfo::Failed { queued_time, .. }
            | DispatchInfo::Dispatched { queued_time, .. }
            | DispatchInfo::Queued { queued_time, .. } => *queued_time,
            DispatchInfo::WaitingForPrerequisites { .. } => Duration::ZERO,
        }
    }

    pub fn failure_info(&self) -> Option<&ExecutionFailureInfo> {
        match self {
            DispatchInfo::Failed { failure_info, .. } => Some(failure_info),
            _ => None,
        }
    }

    pub fn coordinator_location(&self) -> Option<&CoordinatorLocation> {
        match self {
            DispatchInfo::Dispatched {
                coordinator_location,
                ..
            } => Some(coordinator_location),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::{ErrorCode, ExecutionError};

    #[test]
    fn test_failed_info_serializes_with_status_tag() {
        let info = DispatchInfo::Failed {
            failure_info: ExecutionError::user_canceled("Query was canceled").to_failure_info(),
            elapsed_time: Duration::from_millis(5),
            waiting_for_prerequisites_time: Duration::from_millis(1),
            queued_time: Duration::from_millis(2),
        };
        assert_eq!(
            info.failure_info().map(|f| f.error_code),
            Some(ErrorCode::UserCanceled)
        );
        assert_eq!(info.queued_time(), Duration::from_millis(2));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json["failureInfo"].is_object());
    }

    #[test]
    fn test_waiting_for_prerequisites_has_no_queued_time() {
        let info = DispatchInfo::WaitingForPrerequisites {
            elapsed_time: Duration::from_millis(3),
            waiting_for_prerequisites_time: Duration::from_millis(3),
        };
        assert_eq!(info.queued_time(), Duration::ZERO);
        assert!(info.coordinator_location().is_none());
    }
}
