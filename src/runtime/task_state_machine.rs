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
//! Task lifecycle.
//!
//! ```text
//!   PLANNED ──► RUNNING ──► FINISHED
//!      │           │
//!      └───────────┴──────► CANCELED | ABORTED | FAILED
//! ```
//!
//! Terminal states satisfy [`TaskState::is_done`]; transitions out of them are no-ops that
//! return `false`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::ExecutionError;
use crate::common::ids::TaskId;
use crate::runtime::state_machine::{StateChangeListener, StateMachine};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Planned,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Aborted | TaskState::Failed
        )
    }
}

pub struct TaskStateMachine {
    task_id: TaskId,
    created_at: DateTime<Utc>,
    created: Instant,
    ended: Mutex<Option<(DateTime<Utc>, Instant)>>,
    state: StateMachine<TaskState>,
    failure_causes: Mutex<Vec<ExecutionError>>,
}

impl TaskStateMachine {
    pub fn new(task_id: TaskId) -> Arc<Self> {
        let name = format!("task {}", task_id);
        Arc::new(Self {
            task_id,
            created_at: Utc::now(),
            created: Instant::now(),
            ended: Mutex::new(None),
            state: StateMachine::new(name, TaskState::Planned, TaskState::is_done),
            failure_causes: Mutex::new(Vec::new()),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.ended.lock().expect("task end lock").map(|(t, _)| t)
    }

    /// Time since creation, frozen once the task is done.
    pub fn elapsed(&self) -> Duration {
        match *self.ended.lock().expect("task end lock") {
            Some((_, end)) => end.duration_since(self.created),
            None => self.created.elapsed(),
        }
    }

    pub fn failure_causes(&self) -> Vec<ExecutionError> {
        self.failure_causes
            .lock()
            .expect("task failure causes lock")
            .clone()
    }

    pub fn transition_to_running(&self) -> bool {
        self.state
            .set_if(TaskState::Running, |s| s == TaskState::Planned)
    }

    pub fn finished(&self) -> bool {
        self.transition_to_done(TaskState::Finished)
    }

    pub fn cancel(&self) -> bool {
        self.transition_to_done(TaskState::Canceled)
    }

    pub fn abort(&self) -> bool {
        self.transition_to_done(TaskState::Aborted)
    }

    /// Move to FAILED, recording `cause`. Does nothing once the task is done.
    pub fn failed(&self, cause: ExecutionError) -> bool {
        let changed = {
            let mut causes = self.failure_causes.lock().expect("task failure causes lock");
            let changed = self.state.update_if(TaskState::Failed, |s| !s.is_done());
            if changed {
                causes.push(cause);
                self.record_end();
            }
            changed
        };
        if changed {
            self.state.fire_state_changed();
        }
        changed
    }

    pub fn add_state_change_listener(&self, listener: StateChangeListener<TaskState>) {
        self.state.add_state_change_listener(listener);
    }

    pub fn wait_until_done(&self, timeout: Duration) -> TaskState {
        self.state.wait_until_terminal(timeout)
    }

    pub fn wait_for_state_change(&self, current: TaskState, timeout: Duration) -> TaskState {
        self.state.wait_for_state_change(current, timeout)
    }

    fn transition_to_done(&self, done: TaskState) -> bool {
        let changed = {
            let _causes = self.failure_causes.lock().expect("task failure causes lock");
            let changed = self.state.update_if(done, |s| !s.is_done());
            if changed {
                self.record_end();
            }
            changed
        };
        if changed {
            self.state.fire_state_changed();
        }
        changed
    }

    fn record_end(&self) {
        let mut ended = self.ended.lock().expect("task end lock");
        if ended.is_none() {
            *ended = Some((Utc::now(), Instant::now()));
        }
    }
}
