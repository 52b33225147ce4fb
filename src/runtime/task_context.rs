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
//! Task, pipeline, driver and operator contexts.
//!
//! Each level owns a [`MemTracker`] child of its parent so memory statistics roll up to the
//! query. Operator contexts own the local memory contexts that reserve from the query
//! account and carry the revoke request flag that the driver loop polls.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::error::ExecResult;
use crate::common::ids::TaskId;
use crate::runtime::context_visitor::{
    ContextNode, ContextVisitor, OperatorCollector, RevokePendingVisitor, traverse,
};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::memory_context::{LocalMemoryContext, MemoryKind, QueryMemory};
use crate::runtime::task_state_machine::TaskStateMachine;

pub type RevocationRequestListener = Arc<dyn Fn() + Send + Sync>;

pub struct TaskContext {
    task_id: TaskId,
    memory: Arc<QueryMemory>,
    state_machine: Arc<TaskStateMachine>,
    tracker: Arc<MemTracker>,
    pipelines: Mutex<Vec<Arc<PipelineContext>>>,
    next_pipeline_id: AtomicU32,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        memory: Arc<QueryMemory>,
        state_machine: Arc<TaskStateMachine>,
        query_tracker: &Arc<MemTracker>,
    ) -> Arc<Self> {
        let tracker = MemTracker::new_child(format!("task {}", task_id), query_tracker);
        Arc::new(Self {
            task_id,
            memory,
            state_machine,
            tracker,
            pipelines: Mutex::new(Vec::new()),
            next_pipeline_id: AtomicU32::new(0),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        &self.state_machine
    }

    pub fn memory(&self) -> &Arc<QueryMemory> {
        &self.memory
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn add_pipeline_context(&self) -> Arc<PipelineContext> {
        let pipeline_id = self.next_pipeline_id.fetch_add(1, Ordering::AcqRel);
        let pipeline = Arc::new(PipelineContext {
            pipeline_id,
            memory: Arc::clone(&self.memory),
            tracker: MemTracker::new_child(format!("pipeline {}", pipeline_id), &self.tracker),
            drivers: Mutex::new(Vec::new()),
        });
        self.pipelines
            .lock()
            .expect("task pipelines lock")
            .push(Arc::clone(&pipeline));
        pipeline
    }

    pub fn pipelines(&self) -> Vec<Arc<PipelineContext>> {
        self.pipelines.lock().expect("task pipelines lock").clone()
    }

    pub fn accept<V: ContextVisitor>(self: &Arc<Self>, visitor: &mut V) -> V::Output {
        traverse(&ContextNode::Task(Arc::clone(self)), visitor)
    }

    pub fn operator_contexts(self: &Arc<Self>) -> Vec<Arc<OperatorContext>> {
        self.accept(&mut OperatorCollector)
    }

    /// Whether any operator accepted a revoke request that it has not finished yet.
    pub fn is_memory_revoking_pending(self: &Arc<Self>) -> bool {
        self.accept(&mut RevokePendingVisitor)
    }

    pub fn user_memory_reservation(self: &Arc<Self>) -> u64 {
        self.sum_operators(|op| op.user_memory().bytes())
    }

    pub fn revocable_memory_reservation(self: &Arc<Self>) -> u64 {
        self.sum_operators(|op| op.revocable_memory().bytes())
    }

    pub fn system_memory_reservation(self: &Arc<Self>) -> u64 {
        self.sum_operators(|op| op.system_memory().bytes())
    }

    pub fn total_cpu_time(&self) -> Duration {
        let nanos: u64 = self
            .pipelines()
            .iter()
            .flat_map(|p| p.drivers())
            .map(|d| d.cpu_time_nanos())
            .sum();
        Duration::from_nanos(nanos)
    }

    fn sum_operators(self: &Arc<Self>, f: impl Fn(&OperatorContext) -> u64) -> u64 {
        self.operator_contexts().iter().map(|op| f(op)).sum()
    }
}

pub struct PipelineContext {
    pipeline_id: u32,
    memory: Arc<QueryMemory>,
    tracker: Arc<MemTracker>,
    drivers: Mutex<Vec<Arc<DriverContext>>>,
}

impl PipelineContext {
    pub fn pipeline_id(&self) -> u32 {
        self.pipeline_id
    }

    pub fn add_driver_context(&self) -> Arc<DriverContext> {
        let mut drivers = self.drivers.lock().expect("pipeline drivers lock");
        let driver_id = drivers.len() as u32;
        let driver = Arc::new(DriverContext {
            pipeline_id: self.pipeline_id,
            driver_id,
            memory: Arc::clone(&self.memory),
            tracker: MemTracker::new_child(format!("driver {}", driver_id), &self.tracker),
            operators: Mutex::new(Vec::new()),
            cpu_time_nanos: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });
        drivers.push(Arc::clone(&driver));
        driver
    }

    pub fn drivers(&self) -> Vec<Arc<DriverContext>> {
        self.drivers.lock().expect("pipeline drivers lock").clone()
    }
}

pub struct DriverContext {
    pipeline_id: u32,
    driver_id: u32,
    memory: Arc<QueryMemory>,
    tracker: Arc<MemTracker>,
    operators: Mutex<Vec<Arc<OperatorContext>>>,
    cpu_time_nanos: AtomicU64,
    finished: AtomicBool,
}

impl DriverContext {
    pub fn pipeline_id(&self) -> u32 {
        self.pipeline_id
    }

    pub fn driver_id(&self) -> u32 {
        self.driver_id
    }

    pub fn add_operator_context(
        &self,
        operator_id: u32,
        plan_node_id: impl Into<String>,
        operator_type: impl Into<String>,
    ) -> Arc<OperatorContext> {
        let operator_type = operator_type.into();
        let tracker = MemTracker::new_child(
            format!("{}#{}", operator_type, operator_id),
            &self.tracker,
        );
        let operator = Arc::new(OperatorContext {
            operator_id,
            plan_node_id: plan_node_id.into(),
            operator_type,
            user: LocalMemoryContext::new(
                MemoryKind::User,
                Arc::clone(&self.memory),
                Arc::clone(&tracker),
            ),
            revocable: LocalMemoryContext::new(
                MemoryKind::Revocable,
                Arc::clone(&self.memory),
                Arc::clone(&tracker),
            ),
            system: LocalMemoryContext::new(
                MemoryKind::System,
                Arc::clone(&self.memory),
                Arc::clone(&tracker),
            ),
            tracker,
            revoking_requested: AtomicBool::new(false),
            revocation_listener: Mutex::new(None),
            stats: OperatorStatsCounters::default(),
        });
        self.operators
            .lock()
            .expect("driver operators lock")
            .push(Arc::clone(&operator));
        operator
    }

    pub fn operators(&self) -> Vec<Arc<OperatorContext>> {
        self.operators.lock().expect("driver operators lock").clone()
    }

    pub fn record_cpu_time(&self, cpu: Duration) {
        let nanos = u64::try_from(cpu.as_nanos()).unwrap_or(u64::MAX);
        self.cpu_time_nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    pub fn cpu_time_nanos(&self) -> u64 {
        self.cpu_time_nanos.load(Ordering::Acquire)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct OperatorStatsCounters {
    input_rows: AtomicU64,
    input_bytes: AtomicU64,
    output_rows: AtomicU64,
    output_bytes: AtomicU64,
    spilled_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatorStats {
    pub input_rows: u64,
    pub input_bytes: u64,
    pub output_rows: u64,
    pub output_bytes: u64,
    pub spilled_bytes: u64,
}

pub struct OperatorContext {
    operator_id: u32,
    plan_node_id: String,
    operator_type: String,
    user: LocalMemoryContext,
    revocable: LocalMemoryContext,
    system: LocalMemoryContext,
    tracker: Arc<MemTracker>,
    revoking_requested: AtomicBool,
    revocation_listener: Mutex<Option<RevocationRequestListener>>,
    stats: OperatorStatsCounters,
}

impl OperatorContext {
    pub fn operator_id(&self) -> u32 {
        self.operator_id
    }

    pub fn plan_node_id(&self) -> &str {
        &self.plan_node_id
    }

    pub fn operator_type(&self) -> &str {
        &self.operator_type
    }

    pub fn user_memory(&self) -> &LocalMemoryContext {
        &self.user
    }

    pub fn revocable_memory(&self) -> &LocalMemoryContext {
        &self.revocable
    }

    pub fn system_memory(&self) -> &LocalMemoryContext {
        &self.system
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn query_memory(&self) -> &Arc<QueryMemory> {
        self.user.query_memory()
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.user.bytes() + self.revocable.bytes() + self.system.bytes()
    }

    /// Ask the operator to spill. Returns the revocable bytes it held when the request was
    /// accepted, or zero if it holds no revocable memory or a request is already outstanding.
    pub fn request_memory_revoking(&self) -> u64 {
        if self.revocable.bytes() == 0 {
            return 0;
        }
        if self
            .revoking_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let revoked = self.revocable.bytes();
        let listener = self
            .revocation_listener
            .lock()
            .expect("operator revocation listener lock")
            .clone();
        if let Some(listener) = listener {
            listener();
        }
        revoked
    }

    pub fn is_memory_revoking_requested(&self) -> bool {
        self.revoking_requested.load(Ordering::Acquire)
    }

    /// Called by the driver once the operator has finished spilling.
    pub fn reset_memory_revoking_requested(&self) {
        self.revoking_requested.store(false, Ordering::Release);
    }

    /// Install the callback run when a revoke request is accepted. Runs immediately if a
    /// request is already outstanding.
    pub fn set_memory_revocation_request_listener(&self, listener: RevocationRequestListener) {
        *self
            .revocation_listener
            .lock()
            .expect("operator revocation listener lock") = Some(Arc::clone(&listener));
        if self.is_memory_revoking_requested() {
            listener();
        }
    }

    pub fn record_input(&self, rows: u64, bytes: u64) {
        self.stats.input_rows.fetch_add(rows, Ordering::Relaxed);
        self.stats.input_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_output(&self, rows: u64, bytes: u64) {
        self.stats.output_rows.fetch_add(rows, Ordering::Relaxed);
        self.stats.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_spill(&self, bytes: u64) {
        self.stats.spilled_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stats(&self) -> OperatorStats {
        OperatorStats {
            input_rows: self.stats.input_rows.load(Ordering::Relaxed),
            input_bytes: self.stats.input_bytes.load(Ordering::Relaxed),
            output_rows: self.stats.output_rows.load(Ordering::Relaxed),
            output_bytes: self.stats.output_bytes.load(Ordering::Relaxed),
            spilled_bytes: self.stats.spilled_bytes.load(Ordering::Relaxed),
        }
    }

    /// Release every reservation held by this operator.
    pub fn close(&self) -> ExecResult<()> {
        self.user.close()?;
        self.revocable.close()?;
        self.system.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::QueryId;
    use crate::runtime::memory_pool::MemoryPool;
    use std::sync::atomic::AtomicUsize;

    fn task_context() -> Arc<TaskContext> {
        let query_id = QueryId::new("q1").unwrap();
        let pool = MemoryPool::new("test", 1 << 20);
        let memory = QueryMemory::new(query_id.clone(), pool, 1 << 20, 1 << 20, 1 << 20);
        let root = MemTracker::new_root("query");
        let task_id = TaskId::for_stage(&query_id, 0, 0, 0);
        TaskContext::new(task_id.clone(), memory, TaskStateMachine::new(task_id), &root)
    }

    #[test]
    fn test_operator_contexts_in_plan_order() {
        let task = task_context();
        let p0 = task.add_pipeline_context();
        let p1 = task.add_pipeline_context();
        let d0 = p0.add_driver_context();
        d0.add_operator_context(0, "1", "Scan");
        d0.add_operator_context(1, "2", "Aggregate");
        let d1 = p1.add_driver_context();
        d1.add_operator_context(0, "3", "Output");
        let types: Vec<String> = task
            .operator_contexts()
            .iter()
            .map(|op| op.operator_type().to_string())
            .collect();
        assert_eq!(types, vec!["Scan", "Aggregate", "Output"]);
    }

    #[test]
    fn test_revoke_request_is_single_shot_until_reset() {
        let task = task_context();
        let driver = task.add_pipeline_context().add_driver_context();
        let op = driver.add_operator_context(0, "1", "HashBuild");
        op.revocable_memory().set_bytes(64).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        op.set_memory_revocation_request_listener(Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::AcqRel);
        }));

        assert!(!task.is_memory_revoking_pending());
        assert_eq!(op.request_memory_revoking(), 64);
        assert_eq!(op.request_memory_revoking(), 0);
        assert!(task.is_memory_revoking_pending());
        assert_eq!(calls.load(Ordering::Acquire), 1);

        op.reset_memory_revoking_requested();
        assert!(!task.is_memory_revoking_pending());
    }

    #[test]
    fn test_reservations_roll_up() {
        let task = task_context();
        let driver = task.add_pipeline_context().add_driver_context();
        let a = driver.add_operator_context(0, "1", "A");
        let b = driver.add_operator_context(1, "2", "B");
        a.user_memory().set_bytes(10).unwrap();
        b.revocable_memory().set_bytes(20).unwrap();
        b.system_memory().set_bytes(5).unwrap();
        assert_eq!(task.user_memory_reservation(), 10);
        assert_eq!(task.revocable_memory_reservation(), 20);
        assert_eq!(task.system_memory_reservation(), 5);
        assert_eq!(task.tracker().current(), 35);
        b.close().unwrap();
        assert_eq!(task.memory().revocable_bytes(), 0);
    }
}
