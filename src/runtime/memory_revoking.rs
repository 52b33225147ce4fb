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
//! Memory revoking controller.
//!
//! Registered as a [`MemoryPool`] listener for one query. On every reservation growth it
//! raises the peak watermark, posts at most one revoke request per query to the revoking
//! executor once the reservation crosses `revoking_threshold`, and fails the query when the
//! total reservation is above the per-query limit with no revoke in progress.
//!
//! A revoke pass asks operators to spill in plan order until the reservation that triggered
//! it is expected to drop to `revoking_target` of the pool size.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::error::{ExecResult, ExecutionError, MemoryBreakdown};
use crate::common::ids::QueryId;
use crate::common::query_options::{DiagnosticSettings, SpillSettings, validate_revoking};
use crate::common::util::{fraction_of, succinct_bytes};
use crate::novaexec_logging::{debug, error, query_span, warn};
use crate::runtime::context_visitor::{ContextVisitor, RevokePendingVisitor};
use crate::runtime::executor::Executor;
use crate::runtime::memory_pool::MemoryPool;
use crate::runtime::query_context::QueryContext;
use crate::runtime::task_context::OperatorContext;

/// Outcome of the most recent revoke pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevokePass {
    /// Bytes above the revoking target at the reservation that triggered the pass.
    pub bytes_to_revoke: u64,
    /// Revocable bytes held by operators that were already asked to spill.
    pub bytes_already_revoking: u64,
    /// Revocable bytes of the operators asked to spill by this pass.
    pub bytes_requested: u64,
    pub operators_requested: usize,
}

pub struct MemoryRevokingController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    spill: SpillSettings,
    diagnostics: DiagnosticSettings,
    query_context: Arc<QueryContext>,
    executor: Arc<dyn Executor>,
    // Set while a revoke request is queued or running; at most one per query.
    revoke_in_flight: AtomicBool,
    // Some operator accepted a request and may still be spilling.
    revoke_pending: AtomicBool,
    passes: AtomicU64,
    last_pass: Mutex<Option<RevokePass>>,
}

impl MemoryRevokingController {
    pub fn new(
        spill: SpillSettings,
        diagnostics: DiagnosticSettings,
        query_context: Arc<QueryContext>,
        executor: Arc<dyn Executor>,
    ) -> ExecResult<Self> {
        validate_revoking(spill.revoking_threshold, spill.revoking_target)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                spill,
                diagnostics,
                query_context,
                executor,
                revoke_in_flight: AtomicBool::new(false),
                revoke_pending: AtomicBool::new(false),
                passes: AtomicU64::new(0),
                last_pass: Mutex::new(None),
            }),
        })
    }

    /// Install the listener on the query's pool.
    pub fn register(&self) {
        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        self.inner
            .query_context
            .pool()
            .add_listener(Arc::new(move |pool, query_id, total| {
                match weak.upgrade() {
                    Some(inner) => ControllerInner::on_memory_reserved(&inner, pool, query_id, total),
                    None => Ok(()),
                }
            }));
    }

    pub fn is_revoke_in_flight(&self) -> bool {
        self.inner.revoke_in_flight.load(Ordering::Acquire)
    }

    pub fn passes(&self) -> u64 {
        self.inner.passes.load(Ordering::Acquire)
    }

    pub fn last_revoke_pass(&self) -> Option<RevokePass> {
        *self.inner.last_pass.lock().expect("revoke pass lock")
    }

    /// Run a revoke pass for the current reservation on the calling thread, bypassing the
    /// executor.
    pub fn revoke_now(&self) {
        if self
            .inner
            .revoke_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let total = self.inner.query_context.total_memory_reservation();
            self.inner.run_revoke_pass(total);
        }
    }
}

impl ControllerInner {
    fn on_memory_reserved(
        self: &Arc<Self>,
        pool: &MemoryPool,
        query_id: &QueryId,
        total: u64,
    ) -> ExecResult<()> {
        if query_id != self.query_context.query_id() {
            return Ok(());
        }
        self.query_context.update_peak_node_total_memory(total);

        if self.spill.enabled
            && total > fraction_of(pool.max_bytes(), self.spill.revoking_threshold)
            && self
                .revoke_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.schedule_revoke(total);
        }

        self.check_total_memory_limit()
    }

    fn schedule_revoke(self: &Arc<Self>, total: u64) {
        let inner = Arc::clone(self);
        let posted = self.executor.execute(Box::new(move || {
            inner.run_revoke_pass(total);
            Ok(())
        }));
        if let Err(err) = posted {
            self.revoke_in_flight.store(false, Ordering::Release);
            error!(
                "unable to schedule memory revoking for query {}: {}",
                self.query_context.query_id(),
                err
            );
        }
    }

    fn run_revoke_pass(&self, total: u64) {
        let _in_flight = InFlightReset(&self.revoke_in_flight);
        let _span = query_span(self.query_context.query_id()).entered();
        self.passes.fetch_add(1, Ordering::AcqRel);
        // Operator revocation listeners run inside the pass; a panicking one must not take
        // the revoking worker down with it.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.revoke(total)))
            .map_err(|_| ExecutionError::internal("revocation request listener panicked"));
        match outcome {
            Ok(pass) => {
                debug!(
                    "revoke pass for query {}: to revoke {}, already revoking {}, requested {} from {} operators",
                    self.query_context.query_id(),
                    pass.bytes_to_revoke,
                    pass.bytes_already_revoking,
                    pass.bytes_requested,
                    pass.operators_requested
                );
                *self.last_pass.lock().expect("revoke pass lock") = Some(pass);
            }
            Err(err) => error!(
                "error requesting memory revoking for query {}: {}",
                self.query_context.query_id(),
                err
            ),
        }
    }

    fn revoke(&self, total: u64) -> RevokePass {
        let pool = self.query_context.pool();
        let target = fraction_of(pool.max_bytes(), self.spill.revoking_target);
        let mut pass = RevokePass {
            bytes_to_revoke: total.saturating_sub(target),
            ..RevokePass::default()
        };
        if pass.bytes_to_revoke == 0 {
            return pass;
        }

        pass.bytes_already_revoking = self.memory_already_being_revoked(pass.bytes_to_revoke);
        let remaining = pass.bytes_to_revoke as i64 - pass.bytes_already_revoking as i64;
        if remaining <= 0 {
            return pass;
        }

        let mut visitor = RevokeRequestVisitor {
            remaining,
            requested: 0,
            operators: 0,
        };
        self.query_context.accept(&mut visitor);
        if visitor.operators > 0 {
            self.revoke_pending.store(true, Ordering::Release);
        }
        pass.bytes_requested = visitor.requested;
        pass.operators_requested = visitor.operators;
        pass
    }

    /// Revocable bytes of operators that already have an outstanding request, across every
    /// task of the query. Stops summing once the total exceeds `target`.
    fn memory_already_being_revoked(&self, target: u64) -> u64 {
        let mut sum = 0u64;
        for task in self.query_context.task_contexts() {
            for operator in task.operator_contexts() {
                if operator.is_memory_revoking_requested() {
                    sum = sum.saturating_add(operator.revocable_memory().bytes());
                    if sum > target {
                        return sum;
                    }
                }
            }
        }
        sum
    }

    fn is_memory_revoke_pending(&self) -> bool {
        if !self.revoke_pending.load(Ordering::Acquire) {
            return false;
        }
        let pending = self.query_context.accept(&mut RevokePendingVisitor);
        if !pending {
            self.revoke_pending.store(false, Ordering::Release);
        }
        pending
    }

    fn check_total_memory_limit(&self) -> ExecResult<()> {
        let max_total = self.query_context.max_total_memory();
        let reservation = self
            .query_context
            .pool()
            .query_reservation(self.query_context.query_id());
        let total = reservation.total();
        if total <= max_total
            || self.revoke_in_flight.load(Ordering::Acquire)
            || self.is_memory_revoke_pending()
        {
            return Ok(());
        }

        let breakdown = MemoryBreakdown {
            limit: max_total,
            reserved: total,
            revocable: reservation.revocable,
        };
        let already_failed = self.query_context.failure().is_some();
        let heap_dump_path = if self.diagnostics.heap_dump_on_exceeded_memory_limit && !already_failed
        {
            match self
                .query_context
                .write_heap_dump(&self.diagnostics.heap_dump_dir)
            {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(
                        "failed to write heap dump for query {}: {}",
                        self.query_context.query_id(),
                        err
                    );
                    None
                }
            }
        } else {
            None
        };
        let additional_info = self
            .query_context
            .additional_failure_info(self.diagnostics.verbose_exceeded_memory_limit_errors);
        let err = ExecutionError::exceeded_local_total_memory_limit(
            breakdown,
            &additional_info,
            heap_dump_path,
        );
        if self.query_context.fail(err.clone()) {
            warn!(
                "query {} exceeded total memory limit: reserved {}, limit {}",
                self.query_context.query_id(),
                succinct_bytes(total),
                succinct_bytes(max_total)
            );
        }
        Err(err)
    }
}

struct InFlightReset<'a>(&'a AtomicBool);

impl Drop for InFlightReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Requests revoking in plan order until `remaining` is covered.
struct RevokeRequestVisitor {
    remaining: i64,
    requested: u64,
    operators: usize,
}

impl ContextVisitor for RevokeRequestVisitor {
    type Output = ();

    fn visit_operator(&mut self, operator: &Arc<OperatorContext>) {
        if self.remaining <= 0 {
            return;
        }
        let revoked = operator.request_memory_revoking();
        if revoked > 0 {
            self.remaining -= i64::try_from(revoked).unwrap_or(i64::MAX);
            self.requested += revoked;
            self.operators += 1;
        }
    }

    fn merge(&mut self, _results: Vec<()>) {}
}
