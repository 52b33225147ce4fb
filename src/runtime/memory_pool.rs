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
//! Bounded ledger of per-query byte reservations.
//!
//! The pool never rejects a reservation because of its nominal maximum; callers compare the
//! totals reported to listeners against their own limits. Listeners only hear about growth:
//! they run synchronously on the reserving thread, in registration order, after the ledger
//! has been updated and its lock released. Frees are silent. A listener must not reserve or
//! free on the same pool; such calls are rejected.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::common::error::{ExecResult, ExecutionError};
use crate::common::ids::QueryId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MemoryCategory {
    User,
    Revocable,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueryReservation {
    pub user: u64,
    pub revocable: u64,
}

impl QueryReservation {
    pub fn total(&self) -> u64 {
        self.user.saturating_add(self.revocable)
    }
}

/// Called with `(pool, query, total reservation of the query)` after every reservation.
pub type MemoryPoolListener =
    Arc<dyn Fn(&MemoryPool, &QueryId, u64) -> ExecResult<()> + Send + Sync>;

#[derive(Default)]
struct PoolLedger {
    reserved: u64,
    reserved_revocable: u64,
    queries: HashMap<QueryId, QueryReservation>,
}

thread_local! {
    static NOTIFYING_POOLS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct NotifyingGuard {
    pool: usize,
}

impl NotifyingGuard {
    fn enter(pool: usize) -> Self {
        NOTIFYING_POOLS.with(|pools| pools.borrow_mut().push(pool));
        Self { pool }
    }

    fn is_notifying(pool: usize) -> bool {
        NOTIFYING_POOLS.with(|pools| pools.borrow().contains(&pool))
    }
}

impl Drop for NotifyingGuard {
    fn drop(&mut self) {
        NOTIFYING_POOLS.with(|pools| {
            let mut pools = pools.borrow_mut();
            if let Some(pos) = pools.iter().rposition(|p| *p == self.pool) {
                pools.remove(pos);
            }
        });
    }
}

pub struct MemoryPool {
    id: String,
    max_bytes: u64,
    ledger: Mutex<PoolLedger>,
    listeners: RwLock<Vec<MemoryPoolListener>>,
}

impl MemoryPool {
    pub fn new(id: impl Into<String>, max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            max_bytes,
            ledger: Mutex::new(PoolLedger::default()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn add_listener(&self, listener: MemoryPoolListener) {
        self.listeners
            .write()
            .expect("memory pool listeners lock")
            .push(listener);
    }

    /// Record `bytes` more for `query_id` and notify listeners.
    ///
    /// The reservation stays recorded even when a listener returns an error; the caller owns
    /// the bytes and is expected to free them while unwinding.
    pub fn reserve(
        &self,
        query_id: &QueryId,
        category: MemoryCategory,
        bytes: u64,
    ) -> ExecResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.check_not_notifying()?;
        let total = {
            let mut ledger = self.ledger.lock().expect("memory pool ledger lock");
            let entry = ledger.queries.entry(query_id.clone()).or_default();
            match category {
                MemoryCategory::User => entry.user = entry.user.saturating_add(bytes),
                MemoryCategory::Revocable => {
                    entry.revocable = entry.revocable.saturating_add(bytes)
                }
            }
            let total = entry.total();
            ledger.reserved = ledger.reserved.saturating_add(bytes);
            if category == MemoryCategory::Revocable {
                ledger.reserved_revocable = ledger.reserved_revocable.saturating_add(bytes);
            }
            total
        };
        self.notify_listeners(query_id, total)
    }

    /// Release `bytes` previously reserved for `query_id`. Listeners are not notified.
    ///
    /// Freeing more than is reserved in the category is rejected without touching the ledger.
    pub fn free(&self, query_id: &QueryId, category: MemoryCategory, bytes: u64) -> ExecResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.check_not_notifying()?;
        let mut ledger = self.ledger.lock().expect("memory pool ledger lock");
        let Some(entry) = ledger.queries.get_mut(query_id) else {
            return Err(ExecutionError::internal(format!(
                "memory pool {}: query {} has no reservation to free {} bytes from",
                self.id, query_id, bytes
            )));
        };
        let current = match category {
            MemoryCategory::User => &mut entry.user,
            MemoryCategory::Revocable => &mut entry.revocable,
        };
        if *current < bytes {
            return Err(ExecutionError::internal(format!(
                "memory pool {}: query {} frees {} {:?} bytes but only {} are reserved",
                self.id, query_id, bytes, category, *current
            )));
        }
        *current -= bytes;
        if entry.total() == 0 {
            ledger.queries.remove(query_id);
        }
        ledger.reserved -= bytes;
        if category == MemoryCategory::Revocable {
            ledger.reserved_revocable -= bytes;
        }
        Ok(())
    }

    pub fn query_reservation(&self, query_id: &QueryId) -> QueryReservation {
        let ledger = self.ledger.lock().expect("memory pool ledger lock");
        ledger.queries.get(query_id).copied().unwrap_or_default()
    }

    pub fn query_memory_reservation(&self, query_id: &QueryId) -> u64 {
        self.query_reservation(query_id).user
    }

    pub fn query_revocable_memory_reservation(&self, query_id: &QueryId) -> u64 {
        self.query_reservation(query_id).revocable
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.ledger.lock().expect("memory pool ledger lock").reserved
    }

    pub fn reserved_revocable_bytes(&self) -> u64 {
        self.ledger
            .lock()
            .expect("memory pool ledger lock")
            .reserved_revocable
    }

    /// Negative when the pool is over-subscribed.
    pub fn free_bytes(&self) -> i64 {
        let reserved = self.reserved_bytes();
        i64::try_from(self.max_bytes)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(reserved).unwrap_or(i64::MAX))
    }

    pub fn reservations(&self) -> HashMap<QueryId, QueryReservation> {
        self.ledger
            .lock()
            .expect("memory pool ledger lock")
            .queries
            .clone()
    }

    fn key(&self) -> usize {
        self as *const MemoryPool as usize
    }

    fn check_not_notifying(&self) -> ExecResult<()> {
        if NotifyingGuard::is_notifying(self.key()) {
            return Err(ExecutionError::internal(format!(
                "memory pool {} modified from inside one of its listeners",
                self.id
            )));
        }
        Ok(())
    }

    fn notify_listeners(&self, query_id: &QueryId, total: u64) -> ExecResult<()> {
        let listeners = self
            .listeners
            .read()
            .expect("memory pool listeners lock")
            .clone();
        if listeners.is_empty() {
            return Ok(());
        }
        let _guard = NotifyingGuard::enter(self.key());
        for listener in listeners.iter() {
            listener(self, query_id, total)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("max_bytes", &self.max_bytes)
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn query(id: &str) -> QueryId {
        QueryId::new(id).unwrap()
    }

    #[test]
    fn test_categories_are_tracked_separately() {
        let pool = MemoryPool::new("test", 1000);
        let q = query("q1");
        pool.reserve(&q, MemoryCategory::User, 300).unwrap();
        pool.reserve(&q, MemoryCategory::Revocable, 200).unwrap();
        let reservation = pool.query_reservation(&q);
        assert_eq!(reservation.user, 300);
        assert_eq!(reservation.revocable, 200);
        assert_eq!(reservation.total(), 500);
        assert_eq!(pool.reserved_revocable_bytes(), 200);
        assert_eq!(pool.free_bytes(), 500);

        pool.free(&q, MemoryCategory::Revocable, 200).unwrap();
        assert_eq!(pool.query_revocable_memory_reservation(&q), 0);
        assert_eq!(pool.query_memory_reservation(&q), 300);
    }

    #[test]
    fn test_pool_does_not_reject_over_subscription() {
        let pool = MemoryPool::new("test", 100);
        let q = query("q1");
        pool.reserve(&q, MemoryCategory::User, 150).unwrap();
        assert_eq!(pool.free_bytes(), -50);
    }

    #[test]
    fn test_over_free_is_rejected() {
        let pool = MemoryPool::new("test", 100);
        let q = query("q1");
        pool.reserve(&q, MemoryCategory::User, 10).unwrap();
        assert!(pool.free(&q, MemoryCategory::User, 11).is_err());
        assert!(pool.free(&q, MemoryCategory::Revocable, 1).is_err());
        assert_eq!(pool.query_memory_reservation(&q), 10);
    }

    #[test]
    fn test_listeners_run_in_registration_order_with_query_total() {
        let pool = MemoryPool::new("test", 1000);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let seen = Arc::clone(&seen);
            pool.add_listener(Arc::new(move |_pool, query_id, total| {
                seen.lock().unwrap().push((name, query_id.to_string(), total));
                Ok(())
            }));
        }
        let q = query("q1");
        pool.reserve(&q, MemoryCategory::User, 10).unwrap();
        pool.reserve(&q, MemoryCategory::Revocable, 5).unwrap();
        pool.free(&q, MemoryCategory::User, 10).unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("first", "q1".to_string(), 10),
                ("second", "q1".to_string(), 10),
                ("first", "q1".to_string(), 15),
                ("second", "q1".to_string(), 15),
            ]
        );
    }

    #[test]
    fn test_listener_reentry_is_rejected() {
        let pool = MemoryPool::new("test", 1000);
        let q = query("q1");
        let inner_result = Arc::new(Mutex::new(None));
        let result = Arc::clone(&inner_result);
        pool.add_listener(Arc::new(move |pool, query_id, _total| {
            let r = pool.reserve(query_id, MemoryCategory::User, 1);
            *result.lock().unwrap() = Some(r.is_err());
            Ok(())
        }));
        pool.reserve(&q, MemoryCategory::User, 10).unwrap();
        assert_eq!(*inner_result.lock().unwrap(), Some(true));
        assert_eq!(pool.query_memory_reservation(&q), 10);
    }

    #[test]
    fn test_listener_error_propagates_and_keeps_reservation() {
        let pool = MemoryPool::new("test", 1000);
        let q = query("q1");
        pool.add_listener(Arc::new(|_pool, _query_id, total| {
            if total > 100 {
                return Err(ExecutionError::internal("too much"));
            }
            Ok(())
        }));
        pool.reserve(&q, MemoryCategory::User, 50).unwrap();
        assert!(pool.reserve(&q, MemoryCategory::User, 60).is_err());
        assert_eq!(pool.query_memory_reservation(&q), 110);
        pool.free(&q, MemoryCategory::User, 60).unwrap();
    }

    #[test]
    fn test_concurrent_reserve_and_free_balance() {
        let pool = MemoryPool::new("test", 1 << 20);
        let max_seen = Arc::new(AtomicU64::new(0));
        let max_clone = Arc::clone(&max_seen);
        pool.add_listener(Arc::new(move |_pool, _query_id, total| {
            max_clone.fetch_max(total, Ordering::AcqRel);
            Ok(())
        }));
        let q = query("q1");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    pool.reserve(&q, MemoryCategory::User, 3).unwrap();
                    pool.free(&q, MemoryCategory::User, 3).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.reserved_bytes(), 0);
        assert!(pool.reservations().is_empty());
        assert!(max_seen.load(Ordering::Acquire) <= 24);
    }
}
