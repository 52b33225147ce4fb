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
//! Per-query execution context on this node.
//!
//! A `QueryContext` owns the query's limits, its account on the shared [`MemoryPool`], the
//! root of the memory tracker tree and every task context registered for the query. Task
//! contexts are added explicitly and live until the query context is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::common::error::{ExecResult, ExecutionError};
use crate::common::ids::{QueryId, TaskId};
use crate::common::query_options::MemoryLimits;
use crate::common::util::succinct_bytes;
use crate::novaexec_logging::{info, warn};
use crate::runtime::context_visitor::{ContextNode, ContextVisitor, traverse};
use crate::runtime::mem_tracker::{MemTracker, MemTrackerSnapshot};
use crate::runtime::memory_context::QueryMemory;
use crate::runtime::memory_pool::{MemoryPool, QueryReservation};
use crate::runtime::task_context::TaskContext;
use crate::runtime::task_state_machine::TaskStateMachine;

const TOP_CONSUMERS: usize = 3;

pub struct QueryContext {
    query_id: QueryId,
    limits: MemoryLimits,
    memory: Arc<QueryMemory>,
    tracker: Arc<MemTracker>,
    tasks: Mutex<Vec<Arc<TaskContext>>>,
    peak_node_total_memory: AtomicU64,
    failure: Mutex<Option<ExecutionError>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeapDump {
    query_id: String,
    pool_id: String,
    pool_max_bytes: u64,
    pool_reserved_bytes: u64,
    pool_reserved_revocable_bytes: u64,
    query_reservation: QueryReservation,
    peak_node_total_memory: u64,
    memory_contexts: MemTrackerSnapshot,
}

impl QueryContext {
    pub fn new(query_id: QueryId, pool: Arc<MemoryPool>, limits: MemoryLimits) -> Arc<Self> {
        let memory = QueryMemory::new(
            query_id.clone(),
            pool,
            limits.max_user_memory,
            limits.max_revocable_memory,
            limits.max_spill,
        );
        let tracker = MemTracker::new_root(format!("query {}", query_id));
        Arc::new(Self {
            query_id,
            limits,
            memory,
            tracker,
            tasks: Mutex::new(Vec::new()),
            peak_node_total_memory: AtomicU64::new(0),
            failure: Mutex::new(None),
        })
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    pub fn max_total_memory(&self) -> u64 {
        self.limits.max_total_memory
    }

    pub fn memory(&self) -> &Arc<QueryMemory> {
        &self.memory
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        self.memory.pool()
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    /// Register the context of a task. A task id may be registered only once.
    pub fn add_task_context(
        &self,
        state_machine: Arc<TaskStateMachine>,
    ) -> ExecResult<Arc<TaskContext>> {
        let task_id = state_machine.task_id().clone();
        if task_id.query_id() != &self.query_id {
            return Err(ExecutionError::internal(format!(
                "task {} does not belong to query {}",
                task_id, self.query_id
            )));
        }
        let mut tasks = self.tasks.lock().expect("query tasks lock");
        if tasks.iter().any(|t| t.task_id() == &task_id) {
            return Err(ExecutionError::internal(format!(
                "task context already exists for {}",
                task_id
            )));
        }
        let task = TaskContext::new(
            task_id,
            Arc::clone(&self.memory),
            state_machine,
            &self.tracker,
        );
        tasks.push(Arc::clone(&task));
        Ok(task)
    }

    pub fn task_contexts(&self) -> Vec<Arc<TaskContext>> {
        self.tasks.lock().expect("query tasks lock").clone()
    }

    pub fn get_task_context(&self, task_id: &TaskId) -> Option<Arc<TaskContext>> {
        self.tasks
            .lock()
            .expect("query tasks lock")
            .iter()
            .find(|t| t.task_id() == task_id)
            .cloned()
    }

    pub fn accept<V: ContextVisitor>(self: &Arc<Self>, visitor: &mut V) -> V::Output {
        traverse(&ContextNode::Query(Arc::clone(self)), visitor)
    }

    pub fn user_memory_reservation(&self) -> u64 {
        self.memory.user_bytes()
    }

    pub fn revocable_memory_reservation(&self) -> u64 {
        self.memory.revocable_bytes()
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.user_memory_reservation() + self.revocable_memory_reservation()
    }

    /// Raise the peak watermark; returns true if `bytes` is a new peak.
    pub fn update_peak_node_total_memory(&self, bytes: u64) -> bool {
        self.peak_node_total_memory.fetch_max(bytes, Ordering::AcqRel) < bytes
    }

    pub fn peak_node_total_memory(&self) -> u64 {
        self.peak_node_total_memory.load(Ordering::Acquire)
    }

    /// Fail every task of the query. Only the first failure is kept; later calls return
    /// false and leave the tasks alone.
    pub fn fail(&self, error: ExecutionError) -> bool {
        {
            let mut failure = self.failure.lock().expect("query failure lock");
            if failure.is_some() {
                return false;
            }
            *failure = Some(error.clone());
        }
        for task in self.task_contexts() {
            task.state_machine().failed(error.clone());
        }
        true
    }

    pub fn failure(&self) -> Option<ExecutionError> {
        self.failure.lock().expect("query failure lock").clone()
    }

    /// Extra detail prepended to an exceeded-limit message: the largest operators by
    /// reservation when `verbose` is set, otherwise nothing.
    pub fn additional_failure_info(self: &Arc<Self>, verbose: bool) -> String {
        if !verbose {
            return String::new();
        }
        let mut consumers: Vec<(String, u64)> = self
            .task_contexts()
            .iter()
            .flat_map(|task| task.operator_contexts())
            .map(|op| {
                (
                    format!("{}@{}", op.operator_type(), op.plan_node_id()),
                    op.total_memory_reservation(),
                )
            })
            .filter(|(_, bytes)| *bytes > 0)
            .collect();
        if consumers.is_empty() {
            return String::new();
        }
        consumers.sort_by(|a, b| b.1.cmp(&a.1));
        let top: Vec<String> = consumers
            .into_iter()
            .take(TOP_CONSUMERS)
            .map(|(name, bytes)| format!("{}={}", name, succinct_bytes(bytes)))
            .collect();
        format!("Top Consumers: {{{}}}, ", top.join(", "))
    }

    /// Write the pool and memory tracker state as JSON under `dir`.
    pub fn write_heap_dump(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let pool = self.pool();
        let dump = HeapDump {
            query_id: self.query_id.to_string(),
            pool_id: pool.id().to_string(),
            pool_max_bytes: pool.max_bytes(),
            pool_reserved_bytes: pool.reserved_bytes(),
            pool_reserved_revocable_bytes: pool.reserved_revocable_bytes(),
            query_reservation: pool.query_reservation(&self.query_id),
            peak_node_total_memory: self.peak_node_total_memory(),
            memory_contexts: self.tracker.snapshot(),
        };
        let path = dir.join(format!(
            "{}_{}.json",
            self.query_id,
            Utc::now().format("%Y%m%d%H%M%S%6f")
        ));
        let bytes = serde_json::to_vec_pretty(&dump).map_err(io::Error::other)?;
        fs::write(&path, bytes)?;
        info!("wrote heap dump for query {} to {}", self.query_id, path.display());
        Ok(path)
    }
}

impl Drop for QueryContext {
    fn drop(&mut self) {
        let leaked = self.total_memory_reservation();
        if leaked > 0 {
            warn!(
                "query context {} dropped with {} still reserved",
                self.query_id,
                succinct_bytes(leaked)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorCode;
    use crate::runtime::task_state_machine::TaskState;

    fn limits() -> MemoryLimits {
        MemoryLimits {
            max_user_memory: 1 << 20,
            max_total_memory: 1 << 20,
            max_revocable_memory: 1 << 20,
            max_broadcast_memory: 1 << 20,
            max_spill: 1 << 20,
        }
    }

    fn query_context() -> Arc<QueryContext> {
        let query_id = QueryId::new("q1").unwrap();
        QueryContext::new(query_id, MemoryPool::new("test", 1 << 20), limits())
    }

    fn task_machine(ctx: &QueryContext, partition: u32) -> Arc<TaskStateMachine> {
        TaskStateMachine::new(TaskId::for_stage(ctx.query_id(), 0, partition, 0))
    }

    #[test]
    fn test_rejects_duplicate_and_foreign_tasks() {
        let ctx = query_context();
        ctx.add_task_context(task_machine(&ctx, 0)).unwrap();
        assert!(ctx.add_task_context(task_machine(&ctx, 0)).is_err());
        let foreign = QueryId::new("q2").unwrap();
        let err = ctx
            .add_task_context(TaskStateMachine::new(TaskId::for_stage(&foreign, 0, 0, 0)))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::GenericInternalError);
        assert_eq!(ctx.task_contexts().len(), 1);
    }

    #[test]
    fn test_fail_is_first_wins() {
        let ctx = query_context();
        let t0 = ctx.add_task_context(task_machine(&ctx, 0)).unwrap();
        let t1 = ctx.add_task_context(task_machine(&ctx, 1)).unwrap();
        assert!(ctx.fail(ExecutionError::internal("first")));
        assert!(!ctx.fail(ExecutionError::internal("second")));
        assert_eq!(ctx.failure().unwrap().message(), "first");
        assert_eq!(t0.state_machine().state(), TaskState::Failed);
        assert_eq!(t1.state_machine().failure_causes().len(), 1);
    }

    #[test]
    fn test_peak_only_rises() {
        let ctx = query_context();
        assert!(ctx.update_peak_node_total_memory(100));
        assert!(!ctx.update_peak_node_total_memory(50));
        assert_eq!(ctx.peak_node_total_memory(), 100);
    }

    #[test]
    fn test_verbose_failure_info_lists_top_consumers() {
        let ctx = query_context();
        let task = ctx.add_task_context(task_machine(&ctx, 0)).unwrap();
        let driver = task.add_pipeline_context().add_driver_context();
        let agg = driver.add_operator_context(0, "7", "Aggregate");
        agg.user_memory().set_bytes(2048).unwrap();
        assert_eq!(ctx.additional_failure_info(false), "");
        let info = ctx.additional_failure_info(true);
        assert!(info.starts_with("Top Consumers: {Aggregate@7="));
        agg.close().unwrap();
    }

    #[test]
    fn test_heap_dump_written_as_json() {
        let ctx = query_context();
        let dir = tempfile::tempdir().unwrap();
        let path = ctx.write_heap_dump(dir.path()).unwrap();
        let body = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["queryId"], "q1");
        assert_eq!(value["poolMaxBytes"], 1 << 20);
    }
}
