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
//! Runs the drivers of one task on the task executor.
//!
//! Each driver is submitted as a unit of work that processes one time slice and then
//! resubmits itself until it finishes. The task moves to FINISHED when its last driver
//! finishes and to FAILED on the first driver failure. Once the task is done for any other
//! reason the output buffer is aborted and the remaining drivers close on their next slice.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::common::error::{ExecResult, ExecutionError};
use crate::exec::driver::{Driver, DriverState};
use crate::exec::output_buffer::OutputBuffer;
use crate::novaexec_logging::{debug, error, task_span};
use crate::runtime::executor::Executor;
use crate::runtime::task_context::TaskContext;
use crate::runtime::task_state_machine::{TaskState, TaskStateMachine};

const BLOCKED_WAIT: Duration = Duration::from_millis(10);

pub struct TaskExecution {
    task_context: Arc<TaskContext>,
    output_buffer: Arc<OutputBuffer>,
    executor: Arc<dyn Executor>,
    time_slice: Duration,
    remaining_drivers: AtomicUsize,
    total_drivers: AtomicUsize,
}

impl TaskExecution {
    pub fn new(
        task_context: Arc<TaskContext>,
        output_buffer: Arc<OutputBuffer>,
        executor: Arc<dyn Executor>,
        time_slice: Duration,
    ) -> Arc<Self> {
        let buffer = Arc::clone(&output_buffer);
        task_context
            .state_machine()
            .add_state_change_listener(Arc::new(move |state| match state {
                TaskState::Finished => {
                    buffer.set_no_more_rows();
                }
                s if s.is_done() => buffer.abort(),
                _ => {}
            }));
        Arc::new(Self {
            task_context,
            output_buffer,
            executor,
            time_slice,
            remaining_drivers: AtomicUsize::new(0),
            total_drivers: AtomicUsize::new(0),
        })
    }

    pub fn task_context(&self) -> &Arc<TaskContext> {
        &self.task_context
    }

    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        self.task_context.state_machine()
    }

    pub fn total_drivers(&self) -> usize {
        self.total_drivers.load(Ordering::Acquire)
    }

    pub fn completed_drivers(&self) -> usize {
        self.total_drivers() - self.remaining_drivers.load(Ordering::Acquire)
    }

    /// Move the task to RUNNING and schedule every driver.
    pub fn start(self: &Arc<Self>, drivers: Vec<Driver>) -> ExecResult<()> {
        let state_machine = self.state_machine();
        if !state_machine.transition_to_running() {
            return Err(ExecutionError::internal(format!(
                "task {} cannot start in state {:?}",
                state_machine.task_id(),
                state_machine.state()
            )));
        }
        self.total_drivers.store(drivers.len(), Ordering::Release);
        self.remaining_drivers
            .store(drivers.len(), Ordering::Release);
        if drivers.is_empty() {
            state_machine.finished();
            return Ok(());
        }
        for driver in drivers {
            self.schedule(driver);
        }
        Ok(())
    }

    pub fn cancel(&self) -> bool {
        self.state_machine().cancel()
    }

    fn schedule(self: &Arc<Self>, driver: Driver) {
        let execution = Arc::clone(self);
        // The driver travels with the unit of work; if the executor rejects it the closure
        // is dropped, and with it the driver, which closes its operators.
        let posted = self.executor.execute(Box::new(move || {
            execution.run_slice(driver);
            Ok(())
        }));
        if let Err(err) = posted {
            error!(
                "unable to schedule driver of task {}: {}",
                self.state_machine().task_id(),
                err
            );
            self.state_machine().failed(err);
        }
    }

    fn run_slice(self: &Arc<Self>, mut driver: Driver) {
        let _span = task_span(self.state_machine().task_id()).entered();
        match driver.process(self.time_slice) {
            DriverState::Ready => self.schedule(driver),
            DriverState::Blocked => {
                self.output_buffer.wait_for_space(BLOCKED_WAIT);
                self.schedule(driver);
            }
            DriverState::Finished => {
                let remaining = self.remaining_drivers.fetch_sub(1, Ordering::AcqRel) - 1;
                debug!(
                    "driver {}.{} of task {} finished, {} remaining",
                    driver.context().pipeline_id(),
                    driver.context().driver_id(),
                    self.state_machine().task_id(),
                    remaining
                );
                if remaining == 0 {
                    drop(driver);
                    self.state_machine().finished();
                }
            }
            DriverState::Canceled => {}
            DriverState::Failed(err) => {
                drop(driver);
                self.state_machine().failed(err);
            }
        }
    }
}
