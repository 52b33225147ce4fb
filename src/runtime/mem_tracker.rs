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
//! Hierarchical memory statistics.
//!
//! Trackers mirror the context tree (query, task, pipeline, driver, operator) and only
//! record what the owning context reports. They never enforce limits; enforcement lives in
//! the query context and the memory pool listeners.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

/// Bytes charged to a tracker for as long as the value is alive.
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemTrackerSnapshot {
    pub label: String,
    pub current_bytes: i64,
    pub peak_bytes: i64,
    pub allocated_bytes: i64,
    pub deallocated_bytes: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MemTrackerSnapshot>,
}

#[derive(Debug)]
pub struct MemTracker {
    label: String,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_parent(label.into(), None))
    }

    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let child = Arc::new(Self::with_parent(label.into(), Some(Arc::clone(parent))));
        let mut children = parent.children.lock().unwrap_or_else(|e| e.into_inner());
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        child
    }

    fn with_parent(label: String, parent: Option<Arc<MemTracker>>) -> Self {
        Self {
            label,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Cumulative bytes ever consumed.
    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Cumulative bytes ever released.
    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Apply a signed delta to this tracker and every ancestor.
    pub fn update(&self, delta: i64) {
        if delta > 0 {
            self.consume(delta);
        } else if delta < 0 {
            self.release(delta.saturating_neg());
        }
    }

    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        for tracker in self.self_and_ancestors() {
            let value = tracker.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            tracker.allocated.fetch_add(bytes, Ordering::AcqRel);
            tracker.peak.fetch_max(value, Ordering::AcqRel);
        }
    }

    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        for tracker in self.self_and_ancestors() {
            tracker.current.fetch_sub(bytes, Ordering::AcqRel);
            tracker.deallocated.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    fn self_and_ancestors(&self) -> impl Iterator<Item = &MemTracker> {
        std::iter::successors(Some(self), |tracker| tracker.parent.as_deref())
    }

    pub fn snapshot(&self) -> MemTrackerSnapshot {
        MemTrackerSnapshot {
            label: self.label.clone(),
            current_bytes: self.current(),
            peak_bytes: self.peak(),
            allocated_bytes: self.allocated(),
            deallocated_bytes: self.deallocated(),
            children: self.children().iter().map(|c| c.snapshot()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updates_propagate_to_ancestors() {
        let query = MemTracker::new_root("query");
        let task = MemTracker::new_child("task", &query);
        let operator = MemTracker::new_child("operator", &task);

        operator.update(100);
        operator.update(-40);
        assert_eq!(operator.current(), 60);
        assert_eq!(task.current(), 60);
        assert_eq!(query.current(), 60);
        assert_eq!(query.peak(), 100);
        assert_eq!(query.allocated(), 100);
        assert_eq!(query.deallocated(), 40);
    }

    #[test]
    fn test_tracked_bytes_release_on_drop() {
        let root = MemTracker::new_root("buffer");
        {
            let _bytes = TrackedBytes::new(32, Arc::clone(&root));
            assert_eq!(root.current(), 32);
        }
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn test_snapshot_skips_dropped_children() {
        let root = MemTracker::new_root("query");
        let kept = MemTracker::new_child("kept", &root);
        {
            let _dropped = MemTracker::new_child("dropped", &root);
        }
        kept.consume(5);
        let snapshot = root.snapshot();
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(snapshot.children[0].label, "kept");
        assert_eq!(snapshot.current_bytes, 5);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"deallocatedBytes\":0"), "{}", json);
    }
}
