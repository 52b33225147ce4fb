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
//! Query lifecycle as seen by the dispatcher.
//!
//! ```text
//! WAITING_FOR_PREREQUISITES -> QUEUED -> WAITING_FOR_RESOURCES -> DISPATCHING
//!     -> PLANNING -> STARTING -> RUNNING -> FINISHING -> FINISHED
//! ```
//!
//! FAILED and CANCELED are reachable from every non-terminal state. All forward
//! transitions only move to a later state, so a late transition request never rewinds the
//! query.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::error::{ExecutionError, ExecutionFailureInfo};
use crate::common::ids::QueryId;
use crate::runtime::state_machine::{StateChangeListener, StateMachine};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    WaitingForPrerequisites,
    Queued,
    WaitingForResources,
    Dispatching,
    Planning,
    Starting,
    Running,
    Finishing,
    Finished,
    Failed,
    Canceled,
}

impl QueryState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Failed | QueryState::Canceled
        )
    }
}

#[derive(Default)]
struct QueryTimings {
    queued_at: Option<Instant>,
    waiting_for_resources_at: Option<Instant>,
    dispatching_at: Option<Instant>,
    execution_started_at: Option<(DateTime<Utc>, Instant)>,
    ended_at: Option<(DateTime<Utc>, Instant)>,
}

/// Snapshot handed to monitors and the dispatch info.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicQueryInfo {
    pub query_id: QueryId,
    pub state: QueryState,
    pub query: String,
    pub resource_group: Option<String>,
    pub create_time: DateTime<Utc>,
    pub execution_start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_time: Duration,
    pub waiting_for_prerequisites_time: Duration,
    pub queued_time: Duration,
    pub failure_info: Option<ExecutionFailureInfo>,
    pub retry: bool,
}

pub struct QueryStateMachine {
    query_id: QueryId,
    query: String,
    resource_group: Option<String>,
    retry: bool,
    create_time: DateTime<Utc>,
    created: Instant,
    state: StateMachine<QueryState>,
    timings: Mutex<QueryTimings>,
    failure: Mutex<Option<ExecutionFailureInfo>>,
    last_heartbeat: Mutex<Instant>,
}

impl QueryStateMachine {
    pub fn new(
        query_id: QueryId,
        query: impl Into<String>,
        resource_group: Option<String>,
        retry: bool,
    ) -> Arc<Self> {
        let name = format!("query {}", query_id);
        Arc::new(Self {
            query_id,
            query: query.into(),
            resource_group,
            retry,
            create_time: Utc::now(),
            created: Instant::now(),
            state: StateMachine::new(
                name,
                QueryState::WaitingForPrerequisites,
                QueryState::is_done,
            ),
            timings: Mutex::new(QueryTimings::default()),
            failure: Mutex::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
        })
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn state(&self) -> QueryState {
        self.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn is_retry(&self) -> bool {
        self.retry
    }

    pub fn transition_to_queued(&self) -> bool {
        self.transition_forward(QueryState::Queued)
    }

    pub fn transition_to_waiting_for_resources(&self) -> bool {
        self.transition_forward(QueryState::WaitingForResources)
    }

    pub fn transition_to_dispatching(&self) -> bool {
        self.transition_forward(QueryState::Dispatching)
    }

    pub fn transition_to_planning(&self) -> bool {
        self.transition_forward(QueryState::Planning)
    }

    pub fn transition_to_starting(&self) -> bool {
        self.transition_forward(QueryState::Starting)
    }

    pub fn transition_to_running(&self) -> bool {
        self.transition_forward(QueryState::Running)
    }

    pub fn transition_to_finishing(&self) -> bool {
        self.transition_forward(QueryState::Finishing)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.transition_forward(QueryState::Finished)
    }

    /// Record the first failure and move to FAILED.
    pub fn transition_to_failed(&self, cause: &ExecutionError) -> bool {
        {
            let mut failure = self.failure.lock().expect("query failure lock");
            if self.is_done() {
                return false;
            }
            if failure.is_none() {
                *failure = Some(cause.to_failure_info());
            }
        }
        self.transition(QueryState::Failed, |s| !s.is_done())
    }

    pub fn transition_to_canceled(&self) -> bool {
        {
            let mut failure = self.failure.lock().expect("query failure lock");
            if self.is_done() {
                return false;
            }
            if failure.is_none() {
                *failure =
                    Some(ExecutionError::user_canceled("Query was canceled").to_failure_info());
            }
        }
        self.transition(QueryState::Canceled, |s| !s.is_done())
    }

    /// Failure recorded by a FAILED or CANCELED transition.
    pub fn failure_info(&self) -> Option<ExecutionFailureInfo> {
        if !matches!(self.state(), QueryState::Failed | QueryState::Canceled) {
            return None;
        }
        self.failure.lock().expect("query failure lock").clone()
    }

    pub fn add_state_change_listener(&self, listener: StateChangeListener<QueryState>) {
        self.state.add_state_change_listener(listener);
    }

    pub fn wait_for_state_change(&self, current: QueryState, timeout: Duration) -> QueryState {
        self.state.wait_for_state_change(current, timeout)
    }

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("query heartbeat lock") = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().expect("query heartbeat lock")
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.timings
            .lock()
            .expect("query timings lock")
            .execution_started_at
            .map(|(t, _)| t)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.timings
            .lock()
            .expect("query timings lock")
            .ended_at
            .map(|(t, _)| t)
    }

    pub fn elapsed_time(&self) -> Duration {
        let timings = self.timings.lock().expect("query timings lock");
        let end = timings.ended_at.map(|(_, i)| i).unwrap_or_else(Instant::now);
        end.duration_since(self.created)
    }

    /// Time from creation until the query was queued (or ended, or now).
    pub fn waiting_for_prerequisites_time(&self) -> Duration {
        let timings = self.timings.lock().expect("query timings lock");
        let end = timings
            .queued_at
            .or(timings.ended_at.map(|(_, i)| i))
            .unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.created)
    }

    /// Time spent in QUEUED; zero if the query never got there.
    pub fn queued_time(&self) -> Duration {
        let timings = self.timings.lock().expect("query timings lock");
        let Some(start) = timings.queued_at else {
            return Duration::ZERO;
        };
        let end = timings
            .waiting_for_resources_at
            .or(timings.dispatching_at)
            .or(timings.ended_at.map(|(_, i)| i))
            .unwrap_or_else(Instant::now);
        end.saturating_duration_since(start)
    }

    pub fn basic_query_info(&self) -> BasicQueryInfo {
        BasicQueryInfo {
            query_id: self.query_id.clone(),
            state: self.state(),
            query: self.query.clone(),
            resource_group: self.resource_group.clone(),
            create_time: self.create_time,
            execution_start_time: self.execution_start_time(),
            end_time: self.end_time(),
            elapsed_time: self.elapsed_time(),
            waiting_for_prerequisites_time: self.waiting_for_prerequisites_time(),
            queued_time: self.queued_time(),
            failure_info: self.failure_info(),
            retry: self.retry,
        }
    }

    fn transition_forward(&self, target: QueryState) -> bool {
        self.transition(target, |current| current < target)
    }

    fn transition(&self, target: QueryState, predicate: impl Fn(QueryState) -> bool) -> bool {
        let changed = self.state.update_if(target, predicate);
        if changed {
            self.record_timing(target);
            self.state.fire_state_changed();
        }
        changed
    }

    fn record_timing(&self, state: QueryState) {
        let now = Instant::now();
        let mut timings = self.timings.lock().expect("query timings lock");
        match state {
            QueryState::Queued => {
                timings.queued_at.get_or_insert(now);
            }
            QueryState::WaitingForResources => {
                timings.waiting_for_resources_at.get_or_insert(now);
            }
            QueryState::Dispatching => {
                timings.dispatching_at.get_or_insert(now);
            }
            QueryState::Planning
            | QueryState::Starting
            | QueryState::Running
            | QueryState::Finishing => {
                timings.execution_started_at.get_or_insert((Utc::now(), now));
            }
            QueryState::Finished | QueryState::Failed | QueryState::Canceled => {
                timings.ended_at.get_or_insert((Utc::now(), now));
            }
            QueryState::WaitingForPrerequisites => {}
        }
    }
}
