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
//! Cooperative driver over one operator chain.
//!
//! ```text
//! Ready ──process()──► moves pages source → sink until the time slice ends
//!   │                    │
//!   │                    ├─ sink cannot take input ─► Blocked
//!   │                    ├─ sink finished ──────────► Finished
//!   │                    ├─ task already done ──────► Canceled
//!   │                    └─ operator error ─────────► Failed(err)
//!   └──────────────◄─────┘ (time slice used up)
//! ```
//!
//! Revoke requests are honored between steps: an operator whose context has an outstanding
//! request spills before the driver moves any more pages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::error::{ExecResult, ExecutionError};
use crate::exec::operator::Operator;
use crate::novaexec_logging::{debug, warn};
use crate::runtime::system_info::current_thread_cpu_time;
use crate::runtime::task_context::DriverContext;
use crate::runtime::task_state_machine::TaskStateMachine;

#[derive(Debug)]
pub enum DriverState {
    Ready,
    Blocked,
    Finished,
    Canceled,
    Failed(ExecutionError),
}

pub struct Driver {
    context: Arc<DriverContext>,
    operators: Vec<Box<dyn Operator>>,
    finishing: Vec<bool>,
    task_state: Arc<TaskStateMachine>,
    closed: bool,
}

impl Driver {
    pub fn new(
        context: Arc<DriverContext>,
        operators: Vec<Box<dyn Operator>>,
        task_state: Arc<TaskStateMachine>,
    ) -> ExecResult<Self> {
        if operators.is_empty() {
            return Err(ExecutionError::internal("driver needs at least one operator"));
        }
        let finishing = vec![false; operators.len()];
        Ok(Self {
            context,
            operators,
            finishing,
            task_state,
            closed: false,
        })
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.context
    }

    /// Run until the time slice is used up or the driver cannot make progress.
    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        let cpu_start = current_thread_cpu_time();
        let state = self.process_inner(time_slice);
        if let (Some(start), Some(end)) = (cpu_start, current_thread_cpu_time()) {
            self.context.record_cpu_time(end.saturating_sub(start));
        }
        state
    }

    fn process_inner(&mut self, time_slice: Duration) -> DriverState {
        let start = Instant::now();
        loop {
            if self.task_state.is_done() {
                self.close();
                return DriverState::Canceled;
            }
            if let Err(err) = self.handle_memory_revoke() {
                return self.fail(err);
            }
            if self.sink_finished() {
                return self.finish();
            }
            let made_progress = match self.step() {
                Ok(progress) => progress,
                Err(err) => return self.fail(err),
            };
            if self.sink_finished() {
                return self.finish();
            }
            if !made_progress {
                let sink = self.operators.len() - 1;
                if !self.finishing[sink] && !self.operators[sink].need_input() {
                    return DriverState::Blocked;
                }
                return DriverState::Ready;
            }
            if start.elapsed() >= time_slice {
                return DriverState::Ready;
            }
        }
    }

    fn handle_memory_revoke(&mut self) -> ExecResult<()> {
        for operator in self.operators.iter_mut() {
            let context = Arc::clone(operator.context());
            if !context.is_memory_revoking_requested() {
                continue;
            }
            debug!(
                "driver {}.{} revoking memory of {}",
                self.context.pipeline_id(),
                self.context.driver_id(),
                operator.name()
            );
            operator.start_memory_revoke()?;
            operator.finish_memory_revoke()?;
            context.reset_memory_revoking_requested();
        }
        Ok(())
    }

    /// Move at most one page across every operator boundary and propagate finishing.
    fn step(&mut self) -> ExecResult<bool> {
        let mut made_progress = false;
        for idx in 0..self.operators.len() - 1 {
            let (upstream, downstream) = self.operators.split_at_mut(idx + 1);
            let current = &mut upstream[idx];
            let next = &mut downstream[0];

            if !self.finishing[idx + 1]
                && next.need_input()
                && !current.is_finished()
                && let Some(page) = current.get_output()?
            {
                next.add_input(page)?;
                made_progress = true;
            }

            if current.is_finished() && !self.finishing[idx + 1] {
                next.finish()?;
                self.finishing[idx + 1] = true;
                made_progress = true;
            }
        }
        Ok(made_progress)
    }

    fn sink_finished(&self) -> bool {
        self.operators
            .last()
            .is_some_and(|sink| sink.is_finished())
    }

    fn finish(&mut self) -> DriverState {
        self.context.set_finished();
        match self.close_operators() {
            Ok(()) => DriverState::Finished,
            Err(err) => DriverState::Failed(err),
        }
    }

    fn fail(&mut self, mut err: ExecutionError) -> DriverState {
        if let Err(close_err) = self.close_operators() {
            err.add_suppressed(close_err);
        }
        DriverState::Failed(err)
    }

    /// Close every operator. Safe to call more than once.
    pub fn close(&mut self) {
        if let Err(err) = self.close_operators() {
            warn!(
                "failed to close driver {}.{}: {}",
                self.context.pipeline_id(),
                self.context.driver_id(),
                err
            );
        }
    }

    fn close_operators(&mut self) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first: Option<ExecutionError> = None;
        for operator in self.operators.iter_mut() {
            if let Err(err) = operator.close() {
                match first.as_mut() {
                    Some(first) => first.add_suppressed(err),
                    None => first = Some(err),
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}
