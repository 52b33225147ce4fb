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
//! Task output buffer.
//!
//! Responsibilities:
//! - Queues pages produced by the task sink until the output consumer pulls them.
//! - Bounds buffered bytes through `OutputBufferMemoryManager`; a full buffer makes the sink
//!   report that it needs no input so the driver yields.
//! - Carries the one-shot "no more rows" signal and the abort path used when the task ends
//!   without finishing.
//!
//! Key exported interfaces:
//! - Types: `OutputBufferType`, `OutputBufferMemoryManager`, `OutputBuffer`.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::error::{ExecResult, ExecutionError};
use crate::exec::page::Page;
use crate::exec::task_info::OutputBufferInfo;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputBufferType {
    Row,
    Page,
    DiskPage,
}

impl FromStr for OutputBufferType {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ROW" => Ok(OutputBufferType::Row),
            "PAGE" => Ok(OutputBufferType::Page),
            "DISK_PAGE" => Ok(OutputBufferType::DiskPage),
            other => Err(ExecutionError::configuration(format!(
                "unknown output buffer type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputBufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputBufferType::Row => "ROW",
            OutputBufferType::Page => "PAGE",
            OutputBufferType::DiskPage => "DISK_PAGE",
        };
        f.write_str(name)
    }
}

/// Byte budget of buffered output. Buffered bytes are system memory: they are reported to
/// the task's tracker but never reserved in the pool.
pub struct OutputBufferMemoryManager {
    max_buffer_size: u64,
    buffered_bytes: AtomicI64,
    peak_buffered_bytes: AtomicI64,
    tracker: Arc<MemTracker>,
}

impl OutputBufferMemoryManager {
    pub fn new(max_buffer_size: u64, tracker: Arc<MemTracker>) -> Self {
        Self {
            max_buffer_size: max_buffer_size.max(1),
            buffered_bytes: AtomicI64::new(0),
            peak_buffered_bytes: AtomicI64::new(0),
            tracker,
        }
    }

    pub fn update_memory_usage(&self, delta: i64) {
        let current = self.buffered_bytes.fetch_add(delta, Ordering::AcqRel) + delta;
        self.peak_buffered_bytes.fetch_max(current, Ordering::AcqRel);
        self.tracker.update(delta);
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.load(Ordering::Acquire).max(0) as u64
    }

    pub fn peak_buffered_bytes(&self) -> u64 {
        self.peak_buffered_bytes.load(Ordering::Acquire).max(0) as u64
    }

    pub fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    pub fn is_full(&self) -> bool {
        self.buffered_bytes() >= self.max_buffer_size
    }

    fn clear(&self) {
        let buffered = self.buffered_bytes.swap(0, Ordering::AcqRel);
        self.tracker.update(-buffered);
    }
}

#[derive(Default)]
struct BufferQueue {
    pages: VecDeque<Page>,
    no_more_rows: bool,
    aborted: bool,
}

pub struct OutputBuffer {
    buffer_type: OutputBufferType,
    queue: Mutex<BufferQueue>,
    not_empty: Condvar,
    not_full: Condvar,
    memory: OutputBufferMemoryManager,
    total_rows: AtomicU64,
    total_pages: AtomicU64,
    waiting_for_output_nanos: AtomicU64,
    no_more_rows_signaled: AtomicBool,
}

impl OutputBuffer {
    pub fn new(
        buffer_type: OutputBufferType,
        max_buffer_size: u64,
        tracker: Arc<MemTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            buffer_type,
            queue: Mutex::new(BufferQueue::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            memory: OutputBufferMemoryManager::new(max_buffer_size, tracker),
            total_rows: AtomicU64::new(0),
            total_pages: AtomicU64::new(0),
            waiting_for_output_nanos: AtomicU64::new(0),
            no_more_rows_signaled: AtomicBool::new(false),
        })
    }

    pub fn buffer_type(&self) -> OutputBufferType {
        self.buffer_type
    }

    pub fn is_full(&self) -> bool {
        self.memory.is_full()
    }

    /// Queue a page. Pages arriving after an abort are dropped.
    pub fn enqueue(&self, page: Page) -> ExecResult<()> {
        let mut queue = self.queue.lock().expect("output buffer lock");
        if queue.aborted {
            return Ok(());
        }
        if queue.no_more_rows {
            return Err(ExecutionError::internal(
                "page added to output buffer after no more rows",
            ));
        }
        self.total_rows
            .fetch_add(page.positions() as u64, Ordering::AcqRel);
        self.total_pages.fetch_add(1, Ordering::AcqRel);
        self.memory
            .update_memory_usage(page.size_in_bytes() as i64);
        queue.pages.push_back(page);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Block the producer until there is room, the buffer is aborted or `timeout` passes.
    pub fn wait_for_space(&self, timeout: Duration) {
        let queue = self.queue.lock().expect("output buffer lock");
        let _ = self
            .not_full
            .wait_timeout_while(queue, timeout, |q| !q.aborted && self.memory.is_full())
            .expect("output buffer condvar wait");
    }

    /// Mark the end of output. Returns false if it was already signaled.
    pub fn set_no_more_rows(&self) -> bool {
        if self.no_more_rows_signaled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut queue = self.queue.lock().expect("output buffer lock");
        queue.no_more_rows = true;
        self.not_empty.notify_all();
        true
    }

    /// Drop all buffered pages and wake every waiter.
    pub fn abort(&self) {
        let mut queue = self.queue.lock().expect("output buffer lock");
        if queue.aborted {
            return;
        }
        queue.aborted = true;
        queue.pages.clear();
        self.memory.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.queue.lock().expect("output buffer lock").aborted
    }

    /// All output was produced and consumed, or the buffer was aborted.
    pub fn is_finished(&self) -> bool {
        let queue = self.queue.lock().expect("output buffer lock");
        queue.aborted || (queue.no_more_rows && queue.pages.is_empty())
    }

    /// Take the next page, blocking until one arrives. Returns `None` once the buffer is
    /// finished or aborted.
    pub fn take(&self) -> Option<Page> {
        let started = Instant::now();
        let mut queue = self.queue.lock().expect("output buffer lock");
        while queue.pages.is_empty() && !queue.no_more_rows && !queue.aborted {
            queue = self.not_empty.wait(queue).expect("output buffer condvar wait");
        }
        let waited = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.waiting_for_output_nanos
            .fetch_add(waited, Ordering::AcqRel);
        if queue.aborted {
            return None;
        }
        let page = queue.pages.pop_front()?;
        self.memory
            .update_memory_usage(-(page.size_in_bytes() as i64));
        self.not_full.notify_all();
        Some(page)
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows.load(Ordering::Acquire)
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Acquire)
    }

    /// Time consumers spent blocked in [`OutputBuffer::take`].
    pub fn waiting_for_output(&self) -> Duration {
        Duration::from_nanos(self.waiting_for_output_nanos.load(Ordering::Acquire))
    }

    pub fn info(&self) -> OutputBufferInfo {
        OutputBufferInfo {
            buffer_type: self.buffer_type,
            total_rows: self.total_rows(),
            total_pages: self.total_pages(),
            buffered_bytes: self.memory.buffered_bytes(),
            peak_buffered_bytes: self.memory.peak_buffered_bytes(),
            max_buffer_size: self.memory.max_buffer_size(),
            finished: self.is_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;

    fn page(bytes: usize) -> Page {
        Page::new(vec![Bytes::from(vec![0u8; bytes])])
    }

    #[test]
    fn test_parse_buffer_type() {
        assert_eq!("disk_page".parse::<OutputBufferType>().unwrap(), OutputBufferType::DiskPage);
        assert_eq!(OutputBufferType::Row.to_string(), "ROW");
        assert!("BROADCAST".parse::<OutputBufferType>().is_err());
    }

    #[test]
    fn test_full_buffer_blocks_until_consumed() {
        let tracker = MemTracker::new_root("task");
        let buffer = OutputBuffer::new(OutputBufferType::Page, 100, Arc::clone(&tracker));
        buffer.enqueue(page(60)).unwrap();
        assert!(!buffer.is_full());
        buffer.enqueue(page(60)).unwrap();
        assert!(buffer.is_full());
        assert_eq!(tracker.current(), 120);

        let consumer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                buffer.take().unwrap()
            })
        };
        buffer.wait_for_space(Duration::from_secs(5));
        assert!(!buffer.is_full());
        consumer.join().unwrap();
        assert_eq!(buffer.info().peak_buffered_bytes, 120);
    }

    #[test]
    fn test_no_more_rows_is_one_shot() {
        let buffer = OutputBuffer::new(OutputBufferType::Row, 100, MemTracker::new_root("task"));
        buffer.enqueue(page(1)).unwrap();
        assert!(buffer.set_no_more_rows());
        assert!(!buffer.set_no_more_rows());
        assert!(buffer.enqueue(page(1)).is_err());
        assert!(!buffer.is_finished());
        assert!(buffer.take().is_some());
        assert!(buffer.take().is_none());
        assert!(buffer.is_finished());
        assert_eq!(buffer.total_rows(), 1);
    }

    #[test]
    fn test_abort_releases_memory_and_wakes_consumer() {
        let tracker = MemTracker::new_root("task");
        let buffer = OutputBuffer::new(OutputBufferType::Page, 100, Arc::clone(&tracker));
        buffer.enqueue(page(10)).unwrap();
        buffer.take().unwrap();
        let consumer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.take())
        };
        thread::sleep(Duration::from_millis(10));
        buffer.enqueue(page(30)).unwrap();
        buffer.abort();
        let _ = consumer.join().unwrap();
        assert_eq!(tracker.current(), 0);
        assert!(buffer.is_finished());
        assert!(buffer.take().is_none());
    }
}
