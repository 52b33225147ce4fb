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
//! Dispatch lifecycle of one query on the local coordinator.
//!
//! Responsibilities:
//! - Waits for the query prerequisites, then queues the query through the resource group
//!   queuer.
//! - Once the resource group admits the query, waits for the minimum cluster size, then
//!   hands the constructed [`QueryExecution`] to the submitter.
//! - Reports dispatch progress as a [`DispatchInfo`] and exposes cancellation and failure
//!   in every phase.
//!
//! Key exported interfaces:
//! - Types: `LocalDispatchQuery`, `QueryExecution`, `ResourceGroupQueryLimits`.
//!
//! All waits are futures spawned on the query runtime; no thread blocks while a query is
//! waiting for prerequisites or resources. The `submitted` completion is settled when the
//! query leaves the dispatcher, either through the submitter or by reaching a terminal
//! state, and callers only ever see its non-cancelable view.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::common::error::{ErrorCode, ExecResult, ExecutionError};
use crate::common::ids::QueryId;
use crate::dispatcher::cluster_size_monitor::ClusterResources;
use crate::dispatcher::dispatch_info::{CoordinatorLocation, DispatchInfo};
use crate::dispatcher::prerequisites::{PrerequisitesContext, QueryPrerequisites};
use crate::dispatcher::query_monitor::QueryMonitor;
use crate::novaexec_logging::{debug, error, query_span};
use crate::runtime::completion::{Completion, NonCancelableCompletion};
use crate::runtime::query_state_machine::{BasicQueryInfo, QueryState, QueryStateMachine};
use crate::runtime::state_machine::StateChangeListener;

/// Limits a resource group applies to the queries it admits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceGroupQueryLimits {
    pub execution_time_limit: Option<Duration>,
    pub total_memory_limit: Option<u64>,
    pub cpu_time_limit: Option<Duration>,
}

/// Planned query handed over to the execution engine.
pub trait QueryExecution: Send + Sync {
    fn query_id(&self) -> &QueryId;

    fn basic_query_info(&self) -> BasicQueryInfo;

    fn total_cpu_time(&self) -> Duration;

    fn total_memory_reservation(&self) -> u64;

    fn user_memory_reservation(&self) -> u64;

    fn set_resource_group_query_limits(&self, limits: ResourceGroupQueryLimits);
}

pub type QueryExecutionFuture = BoxFuture<'static, ExecResult<Arc<dyn QueryExecution>>>;

/// Registers the query with its resource group once it is queued.
pub type QueryQueuer = Box<dyn Fn(Arc<LocalDispatchQuery>) -> ExecResult<()> + Send + Sync>;

/// Starts the execution of a dispatched query.
pub type QuerySubmitter = Box<dyn Fn(Arc<dyn QueryExecution>) -> ExecResult<()> + Send + Sync>;

pub struct LocalDispatchQuery {
    self_ref: Weak<LocalDispatchQuery>,
    state_machine: Arc<QueryStateMachine>,
    query_monitor: Arc<dyn QueryMonitor>,
    query_execution: Completion<Arc<dyn QueryExecution>>,
    cluster_resources: Arc<dyn ClusterResources>,
    handle: Handle,
    queuer: QueryQueuer,
    submitter: QuerySubmitter,
    prerequisites: Arc<dyn QueryPrerequisites>,
    submitted: Completion<()>,
    finished: Completion<()>,
    resource_group_limits: OnceLock<ResourceGroupQueryLimits>,
    resource_wait: Mutex<Option<JoinHandle<()>>>,
}

impl LocalDispatchQuery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_machine: Arc<QueryStateMachine>,
        query_monitor: Arc<dyn QueryMonitor>,
        query_execution: QueryExecutionFuture,
        cluster_resources: Arc<dyn ClusterResources>,
        handle: Handle,
        queuer: QueryQueuer,
        submitter: QuerySubmitter,
        prerequisites: Arc<dyn QueryPrerequisites>,
    ) -> Arc<Self> {
        let query = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            state_machine,
            query_monitor,
            query_execution: Completion::new(),
            cluster_resources,
            handle,
            queuer,
            submitter,
            prerequisites,
            submitted: Completion::new(),
            finished: Completion::new(),
            resource_group_limits: OnceLock::new(),
            resource_wait: Mutex::new(None),
        });

        let weak = Arc::downgrade(&query);
        query
            .state_machine
            .add_state_change_listener(Arc::new(move |state: QueryState| {
                if !state.is_done() {
                    return;
                }
                if let Some(query) = weak.upgrade() {
                    query.submitted.set(());
                    query.finished.set(());
                    query.cancel_resource_wait();
                }
            }));

        let weak = Arc::downgrade(&query);
        let resolved = query.query_execution.clone();
        query.handle.spawn(async move {
            match query_execution.await {
                Ok(execution) => {
                    resolved.set(execution);
                }
                Err(err) => {
                    resolved.set_error(err.clone());
                    if let Some(query) = weak.upgrade() {
                        query.fail(err);
                    }
                }
            }
        });
        query
    }

    pub fn query_id(&self) -> &QueryId {
        self.state_machine.query_id()
    }

    pub fn state(&self) -> QueryState {
        self.state_machine.state()
    }

    pub fn is_done(&self) -> bool {
        self.state_machine.is_done()
    }

    pub fn is_retry(&self) -> bool {
        self.state_machine.is_retry()
    }

    /// Wait for the prerequisites asynchronously, then queue the query. A query that is
    /// already done never starts waiting.
    pub fn start_waiting_for_prerequisites(&self) {
        if self.is_done() {
            return;
        }
        let info = self.state_machine.basic_query_info();
        let context = PrerequisitesContext {
            query: info.query,
            resource_group: info.resource_group,
            retry: info.retry,
        };
        let prerequisites = self
            .prerequisites
            .wait_for_prerequisites(self.query_id(), &context);

        let notify = Arc::clone(&self.prerequisites);
        let query_id = self.query_id().clone();
        let listener: StateChangeListener<QueryState> = Arc::new(move |state| {
            if state.is_done() {
                notify.query_finished(&query_id);
            }
        });
        self.state_machine.add_state_change_listener(listener);

        let weak = self.self_ref.clone();
        let finished = self.finished.clone();
        let waiter = async move {
            tokio::select! {
                ready = prerequisites => {
                    let Some(query) = weak.upgrade() else {
                        return;
                    };
                    match ready {
                        Ok(()) => query.queue_query(),
                        Err(err) => query.fail(err),
                    }
                }
                // Dropping the prerequisites future cancels it.
                _ = finished.wait() => {}
            }
        };
        self.handle.spawn(waiter.instrument(query_span(self.query_id())));
    }

    fn queue_query(&self) {
        if !self.state_machine.transition_to_queued() {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        if let Err(err) = (self.queuer)(this) {
            self.fail(err);
        }
    }

    /// Called by the resource group once the query is admitted.
    pub fn start_waiting_for_resources(&self) {
        if !self.state_machine.transition_to_waiting_for_resources() {
            return;
        }
        let minimum_resources = futures::future::try_join(
            self.cluster_resources.wait_for_minimum_coordinator_sidecars(),
            self.cluster_resources.wait_for_minimum_workers(),
        );
        let weak = self.self_ref.clone();
        let execution = self.query_execution.clone();
        let waiter = async move {
            if let Err(err) = minimum_resources.await {
                if let Some(query) = weak.upgrade() {
                    query.fail(err);
                }
                return;
            }
            let dispatching = match weak.upgrade() {
                Some(query) => query.state_machine.transition_to_dispatching(),
                None => return,
            };
            // A failed construction already failed the query.
            let Ok(execution) = execution.wait().await else {
                return;
            };
            if let Some(query) = weak.upgrade() {
                query.start_execution(execution, dispatching);
            }
        };
        let wait = self.handle.spawn(waiter.instrument(query_span(self.query_id())));

        let mut slot = self.resource_wait.lock().expect("resource wait lock");
        if self.is_done() {
            wait.abort();
        } else {
            *slot = Some(wait);
        }
    }

    fn start_execution(&self, execution: Arc<dyn QueryExecution>, dispatching: bool) {
        if !dispatching {
            return;
        }
        if let Some(limits) = self.resource_group_limits.get() {
            execution.set_resource_group_query_limits(*limits);
        }
        if let Err(err) = (self.submitter)(execution) {
            error!("query submitter failed for {}: {}", self.query_id(), err);
            self.fail(err);
        }
        self.submitted.set(());
    }

    fn cancel_resource_wait(&self) {
        let wait = self.resource_wait.lock().expect("resource wait lock").take();
        if let Some(wait) = wait {
            debug!("canceling resource wait of query {}", self.query_id());
            wait.abort();
        }
    }

    /// Whether the query is still waiting for the minimum cluster size.
    pub fn is_waiting_for_resources(&self) -> bool {
        self.resource_wait
            .lock()
            .expect("resource wait lock")
            .as_ref()
            .is_some_and(|wait| !wait.is_finished())
    }

    /// Settled once the query has left the dispatcher.
    pub fn dispatched_future(&self) -> NonCancelableCompletion<()> {
        self.submitted.non_cancelable()
    }

    pub fn dispatch_info(&self) -> DispatchInfo {
        // Read `submitted` before the state so a failure that settled it is visible.
        let dispatched = self.submitted.is_done();
        let info = self.state_machine.basic_query_info();
        let elapsed_time = info.elapsed_time;
        let waiting_for_prerequisites_time = info.waiting_for_prerequisites_time;
        let queued_time = info.queued_time;

        match info.state {
            QueryState::Failed | QueryState::Canceled => DispatchInfo::Failed {
                failure_info: info.failure_info.unwrap_or_else(|| {
                    ExecutionError::internal("Query failed for an unknown reason")
                        .to_failure_info()
                }),
                elapsed_time,
                waiting_for_prerequisites_time,
                queued_time,
            },
            _ if dispatched => DispatchInfo::Dispatched {
                coordinator_location: CoordinatorLocation::local(),
                elapsed_time,
                waiting_for_prerequisites_time,
                queued_time,
            },
            QueryState::WaitingForPrerequisites => DispatchInfo::WaitingForPrerequisites {
                elapsed_time,
                waiting_for_prerequisites_time,
            },
            // Past the prerequisites but not yet handed to the submitter.
            _ => DispatchInfo::Queued {
                elapsed_time,
                waiting_for_prerequisites_time,
                queued_time,
            },
        }
    }

    pub fn fail(&self, cause: ExecutionError) {
        if self.state_machine.transition_to_failed(&cause) {
            self.query_monitor.query_immediate_failure_event(
                &self.state_machine.basic_query_info(),
                &cause.to_failure_info(),
            );
        }
    }

    pub fn cancel(&self) {
        if self.state_machine.transition_to_canceled() {
            let info = self.state_machine.basic_query_info();
            let failure = info.failure_info.clone().unwrap_or_else(|| {
                ExecutionError::user_canceled("Query was canceled").to_failure_info()
            });
            self.query_monitor
                .query_immediate_failure_event(&info, &failure);
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.state_machine.failure_info().map(|f| f.error_code)
    }

    pub fn record_heartbeat(&self) {
        self.state_machine.record_heartbeat();
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.state_machine.last_heartbeat()
    }

    pub fn add_state_change_listener(&self, listener: StateChangeListener<QueryState>) {
        self.state_machine.add_state_change_listener(listener);
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.state_machine.create_time()
    }

    pub fn queued_time(&self) -> Duration {
        self.state_machine.queued_time()
    }

    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.state_machine.execution_start_time()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state_machine.end_time()
    }

    pub fn total_cpu_time(&self) -> Duration {
        self.query_execution
            .peek()
            .map(|e| e.total_cpu_time())
            .unwrap_or(Duration::ZERO)
    }

    pub fn total_memory_reservation(&self) -> u64 {
        self.query_execution
            .peek()
            .map(|e| e.total_memory_reservation())
            .unwrap_or(0)
    }

    pub fn user_memory_reservation(&self) -> u64 {
        self.query_execution
            .peek()
            .map(|e| e.user_memory_reservation())
            .unwrap_or(0)
    }

    pub fn basic_query_info(&self) -> BasicQueryInfo {
        match self.query_execution.peek() {
            Some(execution) => execution.basic_query_info(),
            None => self.state_machine.basic_query_info(),
        }
    }

    pub fn resource_group_query_limits(&self) -> Option<ResourceGroupQueryLimits> {
        self.resource_group_limits.get().copied()
    }

    /// Limits may be set once; a second call is a caller bug and is rejected.
    pub fn set_resource_group_query_limits(
        &self,
        limits: ResourceGroupQueryLimits,
    ) -> ExecResult<()> {
        self.resource_group_limits.set(limits).map_err(|_| {
            ExecutionError::internal(format!(
                "resource group query limits already set for query {}",
                self.query_id()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::cluster_size_monitor::{ClusterSize, ClusterSizeMonitor};
    use crate::dispatcher::prerequisites::NoPrerequisites;
    use crate::dispatcher::query_monitor::LoggingQueryMonitor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeExecution {
        query_id: QueryId,
        limits: Mutex<Option<ResourceGroupQueryLimits>>,
    }

    impl QueryExecution for FakeExecution {
        fn query_id(&self) -> &QueryId {
            &self.query_id
        }

        fn basic_query_info(&self) -> BasicQueryInfo {
            QueryStateMachine::new(self.query_id.clone(), "select 1", None, false)
                .basic_query_info()
        }

        fn total_cpu_time(&self) -> Duration {
            Duration::from_millis(7)
        }

        fn total_memory_reservation(&self) -> u64 {
            42
        }

        fn user_memory_reservation(&self) -> u64 {
            40
        }

        fn set_resource_group_query_limits(&self, limits: ResourceGroupQueryLimits) {
            *self.limits.lock().unwrap() = Some(limits);
        }
    }

    fn dispatch_query(
        monitor: Arc<ClusterSizeMonitor>,
        submitted: Arc<AtomicUsize>,
    ) -> (Arc<LocalDispatchQuery>, Arc<FakeExecution>) {
        let query_id = QueryId::new("q_dispatch").unwrap();
        let execution = Arc::new(FakeExecution {
            query_id: query_id.clone(),
            limits: Mutex::new(None),
        });
        let resolved: Arc<dyn QueryExecution> = execution.clone();
        let state_machine = QueryStateMachine::new(query_id, "select 1", None, false);
        let query = LocalDispatchQuery::new(
            state_machine,
            Arc::new(LoggingQueryMonitor),
            Box::pin(async move { Ok(resolved) }),
            monitor,
            Handle::current(),
            Box::new(|query: Arc<LocalDispatchQuery>| -> ExecResult<()> {
                query.start_waiting_for_resources();
                Ok(())
            }),
            Box::new(move |_execution: Arc<dyn QueryExecution>| -> ExecResult<()> {
                submitted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Arc::new(NoPrerequisites),
        );
        (query, execution)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_is_dispatched_once_workers_join() {
        let monitor = Arc::new(ClusterSizeMonitor::new(1, 0, Duration::from_secs(30)));
        let submitted = Arc::new(AtomicUsize::new(0));
        let (query, execution) = dispatch_query(Arc::clone(&monitor), Arc::clone(&submitted));
        query
            .set_resource_group_query_limits(ResourceGroupQueryLimits {
                total_memory_limit: Some(1024),
                ..Default::default()
            })
            .unwrap();

        query.start_waiting_for_prerequisites();
        while query.state() != QueryState::WaitingForResources {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(query.dispatch_info(), DispatchInfo::Queued { .. }));

        monitor.update(ClusterSize {
            workers: 1,
            coordinator_sidecars: 0,
        });
        tokio::time::timeout(Duration::from_secs(5), query.dispatched_future().wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
        assert_eq!(query.state(), QueryState::Dispatching);
        assert!(matches!(query.dispatch_info(), DispatchInfo::Dispatched { .. }));
        assert_eq!(
            execution.limits.lock().unwrap().and_then(|l| l.total_memory_limit),
            Some(1024)
        );
        assert_eq!(query.total_memory_reservation(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undispatched_query_past_prerequisites_reports_queued() {
        let monitor = Arc::new(ClusterSizeMonitor::new(1, 0, Duration::from_secs(30)));
        let submitted = Arc::new(AtomicUsize::new(0));
        let (query, _) = dispatch_query(monitor, Arc::clone(&submitted));
        assert!(matches!(
            query.dispatch_info(),
            DispatchInfo::WaitingForPrerequisites { .. }
        ));

        // The state can move ahead of `submitted`; until it settles the query is still queued.
        assert!(query.state_machine.transition_to_planning());
        assert!(matches!(query.dispatch_info(), DispatchInfo::Queued { .. }));
        assert!(query.state_machine.transition_to_running());
        assert!(matches!(query.dispatch_info(), DispatchInfo::Queued { .. }));
        assert_eq!(submitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resource_group_limits_set_once() {
        let monitor = Arc::new(ClusterSizeMonitor::new(1, 0, Duration::from_secs(30)));
        let (query, _) = dispatch_query(monitor, Arc::new(AtomicUsize::new(0)));
        let limits = ResourceGroupQueryLimits::default();
        query.set_resource_group_query_limits(limits).unwrap();
        assert!(query.set_resource_group_query_limits(limits).is_err());
        assert_eq!(query.resource_group_query_limits(), Some(limits));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_execution_construction_fails_query() {
        let monitor = Arc::new(ClusterSizeMonitor::new(0, 0, Duration::from_secs(30)));
        let state_machine =
            QueryStateMachine::new(QueryId::new("q_broken").unwrap(), "select 1", None, false);
        let query = LocalDispatchQuery::new(
            state_machine,
            Arc::new(LoggingQueryMonitor),
            Box::pin(async { Err(ExecutionError::user("line 1:1: mismatched input")) }),
            monitor,
            Handle::current(),
            Box::new(|_: Arc<LocalDispatchQuery>| -> ExecResult<()> { Ok(()) }),
            Box::new(|_: Arc<dyn QueryExecution>| -> ExecResult<()> { Ok(()) }),
            Arc::new(NoPrerequisites),
        );
        tokio::time::timeout(Duration::from_secs(5), query.dispatched_future().wait())
            .await
            .unwrap()
            .unwrap();
        let info = query.dispatch_info();
        let failure = info.failure_info().unwrap();
        assert_eq!(failure.error_code, ErrorCode::GenericUserError);
        assert_eq!(query.error_code(), Some(ErrorCode::GenericUserError));
        assert_eq!(query.total_cpu_time(), Duration::ZERO);
    }
}
