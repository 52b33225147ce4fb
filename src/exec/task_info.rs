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
//! Task info reported to the coordinator once a task completes.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::{ExecResult, ExecutionError, ExecutionFailureInfo};
use crate::common::ids::TaskId;
use crate::exec::output_buffer::OutputBufferType;
use crate::runtime::task_state_machine::TaskState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBufferInfo {
    pub buffer_type: OutputBufferType,
    pub total_rows: u64,
    pub total_pages: u64,
    pub buffered_bytes: u64,
    pub peak_buffered_bytes: u64,
    pub max_buffer_size: u64,
    pub finished: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub failures: Vec<ExecutionFailureInfo>,
    pub memory_reservation_bytes: u64,
    pub system_memory_reservation_bytes: u64,
    pub peak_node_total_memory: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub create_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_time_ms: u64,
    pub total_cpu_time_ms: u64,
    pub user_memory_reservation_bytes: u64,
    pub revocable_memory_reservation_bytes: u64,
    pub system_memory_reservation_bytes: u64,
    pub peak_total_memory_bytes: u64,
    pub peak_user_memory_bytes: u64,
    // No managed heap; reported for coordinator compatibility.
    pub full_gc_count: u32,
    pub full_gc_time_ms: u64,
    pub total_drivers: usize,
    pub completed_drivers: usize,
    pub raw_input_rows: u64,
    pub raw_input_bytes: u64,
    pub output_rows: u64,
    pub output_bytes: u64,
    pub spilled_bytes: u64,
}

/// Rows, pages and bytes handed to the output consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShuffleStats {
    pub rows: u64,
    pub batches: u64,
    pub bytes: u64,
    /// Wall time of output retrieval excluding time spent waiting for the task.
    pub wall_time_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_status: TaskStatus,
    pub output_buffers: OutputBufferInfo,
    pub stats: TaskStats,
    pub shuffle_stats: ShuffleStats,
}

impl TaskInfo {
    pub fn task_id(&self) -> &TaskId {
        &self.task_status.task_id
    }

    pub fn to_json(&self) -> ExecResult<String> {
        serde_json::to_string(self)
            .map_err(|e| ExecutionError::internal(format!("serialize task info: {}", e)))
    }
}

/// Receives the final task info of each completed task.
pub trait TaskInfoCollector: Send + Sync {
    fn collect(&self, info: TaskInfo);
}

#[derive(Default)]
pub struct CollectingTaskInfoCollector {
    infos: Mutex<Vec<TaskInfo>>,
}

impl CollectingTaskInfoCollector {
    pub fn infos(&self) -> Vec<TaskInfo> {
        self.infos.lock().expect("task info collector lock").clone()
    }
}

impl TaskInfoCollector for CollectingTaskInfoCollector {
    fn collect(&self, info: TaskInfo) {
        self.infos
            .lock()
            .expect("task info collector lock")
            .push(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::QueryId;

    #[test]
    fn test_task_info_json_uses_coordinator_field_names() {
        let task_id = TaskId::for_stage(&QueryId::new("q1").unwrap(), 1, 2, 0);
        let info = TaskInfo {
            task_status: TaskStatus {
                task_id: task_id.clone(),
                state: TaskState::Finished,
                failures: Vec::new(),
                memory_reservation_bytes: 0,
                system_memory_reservation_bytes: 0,
                peak_node_total_memory: 10,
            },
            output_buffers: OutputBufferInfo {
                buffer_type: OutputBufferType::DiskPage,
                total_rows: 3,
                total_pages: 1,
                buffered_bytes: 0,
                peak_buffered_bytes: 12,
                max_buffer_size: 100,
                finished: true,
            },
            stats: TaskStats::default(),
            shuffle_stats: ShuffleStats::default(),
        };
        let json: serde_json::Value = serde_json::from_str(&info.to_json().unwrap()).unwrap();
        assert_eq!(json["outputBuffers"]["bufferType"], "DISK_PAGE");
        assert_eq!(json["taskStatus"]["peakNodeTotalMemory"], 10);
        assert_eq!(json["stats"]["fullGcCount"], 0);
        assert_eq!(info.task_id(), &task_id);
    }
}
