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
//! Builds the per-task execution stack.
//!
//! Responsibilities:
//! - Resolves the memory limits of the task, raising them on retry attempts when dynamic
//!   tuning is enabled.
//! - Creates the query memory pool, the query and task contexts, the memory revoking
//!   controller, the output buffer and the drivers, then starts the task.
//! - Returns the pull-based [`TaskOutputIterator`] that owns all of the above.
//!
//! Key exported interfaces:
//! - Types: `TaskExecutorFactory`, `TaskRequest`, `TaskPlan`, `TaskEnvironment`,
//!   `BufferedScanPlan`.
//! - Functions: `tuned_memory_limits`.

use std::sync::Arc;

use crate::common::config;
use crate::common::error::ExecResult;
use crate::common::ids::TaskId;
use crate::common::query_options::{DynamicTuning, MemoryLimits, QueryOptions};
use crate::common::util::{fraction_of, succinct_bytes};
use crate::exec::driver::Driver;
use crate::exec::operator::{
    Operator, SpillableBufferOperator, SplitSourceOperator, TaskOutputOperator,
};
use crate::exec::output_buffer::{OutputBuffer, OutputBufferType};
use crate::exec::split::{TaskSource, log_split_summary};
use crate::exec::task_execution::TaskExecution;
use crate::exec::task_info::TaskInfoCollector;
use crate::exec::task_output::{
    DiskPageOutputSupplier, OutputSupplier, PageOutputSupplier, RowOutputSupplier,
    TaskOutputIterator, TaskResources,
};
use crate::exec::temp_storage::{LocalTempStorage, TempStorage};
use crate::novaexec_logging::{debug, info};
use crate::runtime::executor::{Executor, memory_revoking_executor, task_executor};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::memory_pool::MemoryPool;
use crate::runtime::memory_revoking::MemoryRevokingController;
use crate::runtime::query_context::QueryContext;
use crate::runtime::system_info::physical_memory_bytes;
use crate::runtime::task_context::TaskContext;
use crate::runtime::task_state_machine::TaskStateMachine;

/// One task to run on this node.
#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub options: QueryOptions,
    pub sources: Vec<TaskSource>,
}

/// What a plan needs to build its drivers.
pub struct TaskEnvironment {
    pub output_buffer: Arc<OutputBuffer>,
    pub temp_storage: Arc<dyn TempStorage>,
    pub sources: Vec<TaskSource>,
}

/// Plan fragment of a task, lowered to drivers by the planner layer.
pub trait TaskPlan {
    fn create_drivers(
        &self,
        task: &Arc<TaskContext>,
        env: &TaskEnvironment,
    ) -> ExecResult<Vec<Driver>>;
}

/// One pipeline per source: split source, an optional spillable buffer, task output.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferedScanPlan {
    pub spill: bool,
}

impl TaskPlan for BufferedScanPlan {
    fn create_drivers(
        &self,
        task: &Arc<TaskContext>,
        env: &TaskEnvironment,
    ) -> ExecResult<Vec<Driver>> {
        let mut drivers = Vec::with_capacity(env.sources.len());
        for source in &env.sources {
            let pipeline = task.add_pipeline_context();
            let driver = pipeline.add_driver_context();
            let node = source.plan_node_id.as_str();

            let mut operators: Vec<Box<dyn Operator>> = Vec::with_capacity(3);
            operators.push(Box::new(SplitSourceOperator::new(
                driver.add_operator_context(0, node, "SplitSource"),
                source.splits.clone(),
            )));
            if self.spill {
                operators.push(Box::new(SpillableBufferOperator::new(
                    driver.add_operator_context(1, node, "SpillableBuffer"),
                    Arc::clone(&env.temp_storage),
                )));
            }
            let output_id = operators.len() as u32;
            operators.push(Box::new(TaskOutputOperator::new(
                driver.add_operator_context(output_id, node, "TaskOutput"),
                Arc::clone(&env.output_buffer),
            )));
            drivers.push(Driver::new(
                driver,
                operators,
                Arc::clone(task.state_machine()),
            )?);
        }
        Ok(drivers)
    }
}

/// Raise the user and total limits to `fraction` of the available memory on retry
/// attempts at or above the tuning threshold. Limits never go below their static value.
pub fn tuned_memory_limits(
    limits: MemoryLimits,
    tuning: DynamicTuning,
    attempt_number: u32,
    available_memory: Option<u64>,
) -> MemoryLimits {
    if !tuning.enabled || attempt_number < tuning.attempt_threshold {
        return limits;
    }
    let Some(available) = available_memory else {
        return limits;
    };
    let tuned = fraction_of(available, tuning.fraction);
    MemoryLimits {
        max_user_memory: limits.max_user_memory.max(tuned),
        max_total_memory: limits.max_total_memory.max(tuned),
        ..limits
    }
}

pub struct TaskExecutorFactory {
    temp_storage: Arc<dyn TempStorage>,
    revoking_executor: Arc<dyn Executor>,
    task_executor: Arc<dyn Executor>,
    info_collector: Arc<dyn TaskInfoCollector>,
}

impl TaskExecutorFactory {
    pub fn new(
        temp_storage: Arc<dyn TempStorage>,
        revoking_executor: Arc<dyn Executor>,
        task_executor: Arc<dyn Executor>,
        info_collector: Arc<dyn TaskInfoCollector>,
    ) -> Self {
        Self {
            temp_storage,
            revoking_executor,
            task_executor,
            info_collector,
        }
    }

    /// Factory over the configured temp storage directories and the process-wide pools.
    pub fn from_config(info_collector: Arc<dyn TaskInfoCollector>) -> ExecResult<Self> {
        Ok(Self::new(
            Arc::new(LocalTempStorage::from_config()?),
            memory_revoking_executor(),
            task_executor(),
            info_collector,
        ))
    }

    pub fn create(
        &self,
        request: TaskRequest,
        plan: &dyn TaskPlan,
    ) -> ExecResult<TaskOutputIterator> {
        let TaskRequest {
            task_id,
            options,
            sources,
        } = request;

        let limits = self.effective_limits(&task_id, &options);
        let spill = options.spill_settings()?;
        let diagnostics = options.diagnostics();
        let buffer_type: OutputBufferType = options.output_buffer_type().parse()?;

        let query_id = task_id.query_id().clone();
        let pool = MemoryPool::new(format!("query-{}", query_id), limits.max_total_memory);
        let query_context = QueryContext::new(query_id, pool, limits);
        let state_machine = TaskStateMachine::new(task_id.clone());
        let task_context = query_context.add_task_context(Arc::clone(&state_machine))?;

        let revoking = MemoryRevokingController::new(
            spill,
            diagnostics,
            Arc::clone(&query_context),
            Arc::clone(&self.revoking_executor),
        )?;
        revoking.register();

        log_split_summary(&task_id, &sources);

        let buffer_tracker =
            MemTracker::new_child(format!("output buffer {}", task_id), task_context.tracker());
        let output_buffer =
            OutputBuffer::new(buffer_type, options.sink_max_buffer_size(), buffer_tracker);
        let env = TaskEnvironment {
            output_buffer: Arc::clone(&output_buffer),
            temp_storage: Arc::clone(&self.temp_storage),
            sources,
        };
        let drivers = plan.create_drivers(&task_context, &env)?;
        debug!("task {} created {} drivers", task_id, drivers.len());

        let execution = TaskExecution::new(
            Arc::clone(&task_context),
            Arc::clone(&output_buffer),
            Arc::clone(&self.task_executor),
            config::task_time_slice(),
        );
        execution.start(drivers)?;

        let supplier: Box<dyn OutputSupplier> = match buffer_type {
            OutputBufferType::Row => Box::new(RowOutputSupplier::new(task_id.partition)),
            OutputBufferType::Page => Box::new(PageOutputSupplier),
            OutputBufferType::DiskPage => Box::new(DiskPageOutputSupplier::new(
                Arc::clone(&self.temp_storage),
                options.temp_storage_write_buffer_size(),
            )),
        };

        Ok(TaskOutputIterator::new(
            TaskResources {
                query_context,
                execution,
                revoking,
            },
            output_buffer,
            supplier,
            Arc::clone(&self.info_collector),
        ))
    }

    fn effective_limits(&self, task_id: &TaskId, options: &QueryOptions) -> MemoryLimits {
        let limits = options.memory_limits();
        let tuning = options.dynamic_tuning();
        let available =
            config::available_runtime_memory_override().or_else(physical_memory_bytes);
        let tuned = tuned_memory_limits(limits, tuning, task_id.attempt_number, available);
        if tuned != limits {
            info!(
                "Dynamic memory tuning for task {} (attempt {}): max user memory {} -> {}, max total memory {} -> {}",
                task_id,
                task_id.attempt_number,
                succinct_bytes(limits.max_user_memory),
                succinct_bytes(tuned.max_user_memory),
                succinct_bytes(limits.max_total_memory),
                succinct_bytes(tuned.max_total_memory)
            );
        }
        tuned
    }
}

impl std::fmt::Debug for TaskExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutorFactory").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_limits() -> MemoryLimits {
        MemoryLimits {
            max_user_memory: 100,
            max_total_memory: 200,
            max_revocable_memory: 50,
            max_broadcast_memory: 10,
            max_spill: 1000,
        }
    }

    fn tuning(enabled: bool) -> DynamicTuning {
        DynamicTuning {
            enabled,
            attempt_threshold: 1,
            fraction: 0.5,
        }
    }

    #[test]
    fn test_first_attempt_keeps_static_limits() {
        let limits = tuned_memory_limits(static_limits(), tuning(true), 0, Some(10_000));
        assert_eq!(limits, static_limits());
    }

    #[test]
    fn test_retry_raises_user_and_total_limits() {
        let limits = tuned_memory_limits(static_limits(), tuning(true), 1, Some(10_000));
        assert_eq!(limits.max_user_memory, 5_000);
        assert_eq!(limits.max_total_memory, 5_000);
        assert_eq!(limits.max_revocable_memory, 50);
    }

    #[test]
    fn test_tuning_never_lowers_limits() {
        let limits = tuned_memory_limits(static_limits(), tuning(true), 3, Some(100));
        assert_eq!(limits, static_limits());
        let disabled = tuned_memory_limits(static_limits(), tuning(false), 3, Some(10_000));
        assert_eq!(disabled, static_limits());
        let unknown = tuned_memory_limits(static_limits(), tuning(true), 3, None);
        assert_eq!(unknown, static_limits());
    }
}
