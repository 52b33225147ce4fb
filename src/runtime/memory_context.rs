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
//! Per-query memory account and the per-operator local contexts that feed it.
//!
//! User and revocable bytes are forwarded to the shared [`MemoryPool`] after the per-query
//! limits are checked. System bytes (output buffers, exchange queues) are only tracked in
//! the [`MemTracker`] hierarchy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::error::{ExecResult, ExecutionError};
use crate::common::ids::QueryId;
use crate::common::util::succinct_bytes;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::memory_pool::{MemoryCategory, MemoryPool};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MemoryKind {
    User,
    Revocable,
    System,
}

/// Memory account of one query on this node.
pub struct QueryMemory {
    query_id: QueryId,
    pool: Arc<MemoryPool>,
    max_user_memory: u64,
    max_revocable_memory: u64,
    max_spill: u64,
    system_bytes: AtomicU64,
    spilled_bytes: AtomicU64,
}

impl QueryMemory {
    pub fn new(
        query_id: QueryId,
        pool: Arc<MemoryPool>,
        max_user_memory: u64,
        max_revocable_memory: u64,
        max_spill: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            pool,
            max_user_memory,
            max_revocable_memory,
            max_spill,
            system_bytes: AtomicU64::new(0),
            spilled_bytes: AtomicU64::new(0),
        })
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn user_bytes(&self) -> u64 {
        self.pool.query_memory_reservation(&self.query_id)
    }

    pub fn revocable_bytes(&self) -> u64 {
        self.pool.query_revocable_memory_reservation(&self.query_id)
    }

    pub fn system_bytes(&self) -> u64 {
        self.system_bytes.load(Ordering::Acquire)
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes.load(Ordering::Acquire)
    }

    /// Reserve `bytes` of `kind`. On error nothing stays reserved.
    pub fn reserve(&self, kind: MemoryKind, bytes: u64) -> ExecResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let category = match kind {
            MemoryKind::System => {
                self.system_bytes.fetch_add(bytes, Ordering::AcqRel);
                return Ok(());
            }
            MemoryKind::User => {
                let current = self.user_bytes();
                if current.saturating_add(bytes) > self.max_user_memory {
                    return Err(ExecutionError::exceeded_local_user_memory_limit(
                        self.max_user_memory,
                        &format!(
                            "User memory reservation: {}, requested: {}",
                            succinct_bytes(current),
                            succinct_bytes(bytes)
                        ),
                    ));
                }
                MemoryCategory::User
            }
            MemoryKind::Revocable => {
                let current = self.revocable_bytes();
                if current.saturating_add(bytes) > self.max_revocable_memory {
                    return Err(ExecutionError::exceeded_local_revocable_memory_limit(
                        self.max_revocable_memory,
                        &format!(
                            "Revocable memory reservation: {}, requested: {}",
                            succinct_bytes(current),
                            succinct_bytes(bytes)
                        ),
                    ));
                }
                MemoryCategory::Revocable
            }
        };
        if let Err(err) = self.pool.reserve(&self.query_id, category, bytes) {
            self.pool.free(&self.query_id, category, bytes)?;
            return Err(err);
        }
        Ok(())
    }

    pub fn free(&self, kind: MemoryKind, bytes: u64) -> ExecResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        match kind {
            MemoryKind::System => {
                self.system_bytes.fetch_sub(bytes, Ordering::AcqRel);
                Ok(())
            }
            MemoryKind::User => self.pool.free(&self.query_id, MemoryCategory::User, bytes),
            MemoryKind::Revocable => {
                self.pool
                    .free(&self.query_id, MemoryCategory::Revocable, bytes)
            }
        }
    }

    /// Account bytes written to spill storage against the per-query spill limit.
    pub fn reserve_spill(&self, bytes: u64) -> ExecResult<()> {
        let mut current = self.spilled_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.max_spill {
                return Err(ExecutionError::exceeded_spill_limit(self.max_spill));
            }
            match self.spilled_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn free_spill(&self, bytes: u64) {
        let _ = self
            .spilled_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }
}

/// Byte counter of one memory kind owned by one operator.
pub struct LocalMemoryContext {
    kind: MemoryKind,
    bytes: AtomicU64,
    memory: Arc<QueryMemory>,
    tracker: Arc<MemTracker>,
}

impl LocalMemoryContext {
    pub fn new(kind: MemoryKind, memory: Arc<QueryMemory>, tracker: Arc<MemTracker>) -> Self {
        Self {
            kind,
            bytes: AtomicU64::new(0),
            memory,
            tracker,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn query_memory(&self) -> &Arc<QueryMemory> {
        &self.memory
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Set the absolute reservation; the delta goes to the query account.
    ///
    /// A context is owned by a single operator, so concurrent `set_bytes` calls on the same
    /// context are not expected.
    pub fn set_bytes(&self, bytes: u64) -> ExecResult<()> {
        let old = self.bytes.load(Ordering::Acquire);
        if bytes == old {
            return Ok(());
        }
        if bytes > old {
            self.memory.reserve(self.kind, bytes - old)?;
            self.tracker.consume(to_i64(bytes - old));
        } else {
            self.memory.free(self.kind, old - bytes)?;
            self.tracker.release(to_i64(old - bytes));
        }
        self.bytes.store(bytes, Ordering::Release);
        Ok(())
    }

    pub fn add_bytes(&self, bytes: u64) -> ExecResult<()> {
        self.set_bytes(self.bytes().saturating_add(bytes))
    }

    pub fn close(&self) -> ExecResult<()> {
        self.set_bytes(0)
    }
}

fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorCode;

    fn memory(max_user: u64, max_revocable: u64) -> Arc<QueryMemory> {
        let pool = MemoryPool::new("test", 1 << 20);
        QueryMemory::new(QueryId::new("q1").unwrap(), pool, max_user, max_revocable, 100)
    }

    #[test]
    fn test_set_bytes_forwards_deltas() {
        let memory = memory(1000, 1000);
        let tracker = MemTracker::new_root("op");
        let ctx = LocalMemoryContext::new(MemoryKind::Revocable, Arc::clone(&memory), tracker);
        ctx.set_bytes(300).unwrap();
        ctx.set_bytes(100).unwrap();
        assert_eq!(memory.revocable_bytes(), 100);
        assert_eq!(ctx.bytes(), 100);
        ctx.close().unwrap();
        assert_eq!(memory.revocable_bytes(), 0);
    }

    #[test]
    fn test_user_limit_rejects_without_reserving() {
        let memory = memory(100, 1000);
        let tracker = MemTracker::new_root("op");
        let ctx = LocalMemoryContext::new(MemoryKind::User, Arc::clone(&memory), Arc::clone(&tracker));
        ctx.set_bytes(80).unwrap();
        let err = ctx.set_bytes(120).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceededLocalMemoryLimit);
        assert_eq!(ctx.bytes(), 80);
        assert_eq!(memory.user_bytes(), 80);
        assert_eq!(tracker.current(), 80);
    }

    #[test]
    fn test_system_memory_stays_out_of_pool() {
        let memory = memory(10, 10);
        let tracker = MemTracker::new_root("op");
        let ctx = LocalMemoryContext::new(MemoryKind::System, Arc::clone(&memory), tracker);
        ctx.set_bytes(500).unwrap();
        assert_eq!(memory.system_bytes(), 500);
        assert_eq!(memory.pool().reserved_bytes(), 0);
    }

    #[test]
    fn test_spill_limit() {
        let memory = memory(10, 10);
        memory.reserve_spill(60).unwrap();
        let err = memory.reserve_spill(60).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceededSpillLimit);
        memory.free_spill(60);
        memory.reserve_spill(60).unwrap();
    }
}
