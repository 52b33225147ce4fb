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
//! Pull-based task output.
//!
//! Responsibilities:
//! - `OutputSupplier` turns buffered pages into the unit the consumer asked for: row
//!   batches, pages, or a single handle to a temp file holding every page.
//! - `TaskOutputIterator` hands those units out, then waits for the task to finish,
//!   reports its `TaskInfo` once and surfaces the first failure cause.
//!
//! Key exported interfaces:
//! - Types: `TaskOutputItem`, `StorageHandle`, `OutputSupplier`, `TaskOutputIterator`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::common::error::{ErrorKind, ExecResult, ExecutionError};
use crate::exec::output_buffer::OutputBuffer;
use crate::exec::page::{Page, RowBatch};
use crate::exec::task_execution::TaskExecution;
use crate::exec::task_info::{
    ShuffleStats, TaskInfo, TaskInfoCollector, TaskStats, TaskStatus,
};
use crate::exec::temp_storage::{TempDataSink, TempStorage, TempStorageHandle};
use crate::novaexec_logging::{info, warn};
use crate::runtime::memory_revoking::MemoryRevokingController;
use crate::runtime::query_context::QueryContext;
use crate::runtime::task_state_machine::TaskState;

const TASK_DONE_POLL: Duration = Duration::from_millis(100);

/// Everything written by a DISK_PAGE task, as handed to the consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageHandle {
    pub serialized_handle: Bytes,
    pub uncompressed_size_bytes: u64,
    pub written_size_bytes: u64,
    pub checksum: u32,
    pub row_count: u64,
    pub page_count: u64,
}

impl StorageHandle {
    pub fn handle(&self) -> ExecResult<TempStorageHandle> {
        TempStorageHandle::deserialize(&self.serialized_handle)
    }

    /// Read every page back from `storage`.
    pub fn read_pages(&self, storage: &dyn TempStorage) -> ExecResult<Vec<Page>> {
        let data = storage.open(&self.handle()?)?;
        Page::deserialize_all(data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutputItem {
    Rows(RowBatch),
    Page(Page),
    Storage(StorageHandle),
}

impl TaskOutputItem {
    fn stats(&self) -> (u64, u64) {
        match self {
            TaskOutputItem::Rows(batch) => (batch.rows.len() as u64, batch.size_in_bytes()),
            TaskOutputItem::Page(page) => (page.positions() as u64, page.size_in_bytes()),
            TaskOutputItem::Storage(handle) => (handle.row_count, handle.written_size_bytes),
        }
    }
}

pub trait OutputSupplier: Send {
    /// Next unit of output, or `None` once the buffer has nothing more to give.
    fn next(&mut self, buffer: &OutputBuffer) -> ExecResult<Option<TaskOutputItem>>;

    /// Remove artifacts left behind by a task that failed.
    fn cleanup_on_failure(&mut self) -> ExecResult<()> {
        Ok(())
    }
}

pub struct RowOutputSupplier {
    partition: u32,
}

impl RowOutputSupplier {
    pub fn new(partition: u32) -> Self {
        Self { partition }
    }
}

impl OutputSupplier for RowOutputSupplier {
    fn next(&mut self, buffer: &OutputBuffer) -> ExecResult<Option<TaskOutputItem>> {
        Ok(buffer.take().map(|page| {
            TaskOutputItem::Rows(RowBatch {
                partition: self.partition,
                rows: page.into_rows(),
            })
        }))
    }
}

pub struct PageOutputSupplier;

impl OutputSupplier for PageOutputSupplier {
    fn next(&mut self, buffer: &OutputBuffer) -> ExecResult<Option<TaskOutputItem>> {
        Ok(buffer.take().map(TaskOutputItem::Page))
    }
}

/// Drains the whole buffer into one temp file, flushing every `write_buffer_size` bytes.
pub struct DiskPageOutputSupplier {
    storage: Arc<dyn TempStorage>,
    write_buffer_size: usize,
    written: Option<TempStorageHandle>,
    done: bool,
}

impl DiskPageOutputSupplier {
    pub fn new(storage: Arc<dyn TempStorage>, write_buffer_size: usize) -> Self {
        Self {
            storage,
            write_buffer_size: write_buffer_size.max(1),
            written: None,
            done: false,
        }
    }

    fn dump(
        &self,
        buffer: &OutputBuffer,
        sink: &mut dyn TempDataSink,
    ) -> ExecResult<Option<(TempStorageHandle, u64, u64, u64)>> {
        let mut pending: Vec<Bytes> = Vec::new();
        let mut pending_bytes = 0usize;
        let (mut rows, mut pages, mut uncompressed) = (0u64, 0u64, 0u64);
        while let Some(page) = buffer.take() {
            rows += page.positions() as u64;
            pages += 1;
            uncompressed += page.size_in_bytes();
            let chunk = page.serialize();
            pending_bytes += chunk.len();
            pending.push(chunk);
            if pending_bytes >= self.write_buffer_size {
                sink.write(&pending)?;
                pending.clear();
                pending_bytes = 0;
            }
        }
        if buffer.is_aborted() {
            return Ok(None);
        }
        if !pending.is_empty() {
            sink.write(&pending)?;
        }
        let handle = sink.commit()?;
        Ok(Some((handle, rows, pages, uncompressed)))
    }
}

impl OutputSupplier for DiskPageOutputSupplier {
    fn next(&mut self, buffer: &OutputBuffer) -> ExecResult<Option<TaskOutputItem>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut sink = self.storage.create()?;
        let dumped = match self.dump(buffer, sink.as_mut()) {
            Ok(Some(dumped)) => dumped,
            Ok(None) => {
                let mut released = sink.rollback();
                if let Err(e) = sink.close() {
                    match &mut released {
                        Err(err) => err.add_suppressed(e),
                        Ok(()) => released = Err(e),
                    }
                }
                return released.map(|_| None);
            }
            Err(cause) => {
                let mut err =
                    ExecutionError::internal("Unable to dump data to disk").with_cause(cause);
                if let Err(e) = sink.rollback() {
                    err.add_suppressed(e);
                }
                if let Err(e) = sink.close() {
                    err.add_suppressed(e);
                }
                return Err(err);
            }
        };
        let (handle, row_count, page_count, uncompressed) = dumped;
        // Committed data is removed by `cleanup_on_failure` if closing fails.
        self.written = Some(handle.clone());
        sink.close()?;
        Ok(Some(TaskOutputItem::Storage(StorageHandle {
            serialized_handle: handle.serialize()?,
            uncompressed_size_bytes: uncompressed,
            written_size_bytes: handle.size_bytes,
            checksum: handle.checksum,
            row_count,
            page_count,
        })))
    }

    fn cleanup_on_failure(&mut self) -> ExecResult<()> {
        match self.written.take() {
            Some(handle) => self.storage.remove(&handle),
            None => Ok(()),
        }
    }
}

/// Keeps the per-task stack alive for as long as the output is being read.
pub struct TaskResources {
    pub query_context: Arc<QueryContext>,
    pub execution: Arc<TaskExecution>,
    pub revoking: MemoryRevokingController,
}

pub struct TaskOutputIterator {
    resources: TaskResources,
    buffer: Arc<OutputBuffer>,
    supplier: Box<dyn OutputSupplier>,
    collector: Arc<dyn TaskInfoCollector>,
    started: Instant,
    shuffle: ShuffleStats,
    output_done: bool,
    output_error: Option<ExecutionError>,
    finished: bool,
}

impl TaskOutputIterator {
    pub fn new(
        resources: TaskResources,
        buffer: Arc<OutputBuffer>,
        supplier: Box<dyn OutputSupplier>,
        collector: Arc<dyn TaskInfoCollector>,
    ) -> Self {
        Self {
            resources,
            buffer,
            supplier,
            collector,
            started: Instant::now(),
            shuffle: ShuffleStats::default(),
            output_done: false,
            output_error: None,
            finished: false,
        }
    }

    pub fn resources(&self) -> &TaskResources {
        &self.resources
    }

    pub fn shuffle_stats(&self) -> ShuffleStats {
        self.shuffle
    }

    /// Next unit of output. Blocks until output is available or the task is done. Returns
    /// `Ok(None)` once a finished task has no more output, and the task's first failure
    /// once a failed task has none.
    pub fn get_next(&mut self) -> ExecResult<Option<TaskOutputItem>> {
        if self.finished {
            return Ok(None);
        }
        if !self.output_done {
            match self.supplier.next(&self.buffer) {
                Ok(Some(item)) => {
                    let (rows, bytes) = item.stats();
                    self.shuffle.rows += rows;
                    self.shuffle.batches += 1;
                    self.shuffle.bytes += bytes;
                    return Ok(Some(item));
                }
                Ok(None) => {}
                Err(err) => {
                    // A task that already finished keeps its state; the error is still
                    // reported below.
                    if !self.resources.execution.state_machine().failed(err.clone()) {
                        self.output_error = Some(err);
                    }
                }
            }
            self.output_done = true;
        }

        let state = self.wait_for_task();
        self.finished = true;
        self.update_wall_time();
        self.collector.collect(self.task_info());

        let state_machine = self.resources.execution.state_machine();
        let mut causes = state_machine.failure_causes();
        causes.extend(self.output_error.take());
        if !causes.is_empty() {
            let mut first = causes.swap_remove(0);
            if let Err(e) = self.supplier.cleanup_on_failure() {
                warn!(
                    "cleanup of failed task {} output failed: {}",
                    state_machine.task_id(),
                    e
                );
                first.add_suppressed(e);
            }
            return Err(propagate(first));
        }
        match state {
            TaskState::Finished => Ok(None),
            other => {
                if let Err(e) = self.supplier.cleanup_on_failure() {
                    warn!(
                        "cleanup of {:?} task {} output failed: {}",
                        other,
                        state_machine.task_id(),
                        e
                    );
                }
                Err(ExecutionError::user_canceled(format!(
                    "Task {} was {:?}",
                    state_machine.task_id(),
                    other
                )))
            }
        }
    }

    pub fn cancel(&self) -> bool {
        self.resources.execution.cancel()
    }

    fn wait_for_task(&self) -> TaskState {
        let state_machine = self.resources.execution.state_machine();
        loop {
            let state = state_machine.wait_until_done(TASK_DONE_POLL);
            if state.is_done() {
                return state;
            }
        }
    }

    fn update_wall_time(&mut self) {
        let wall = self
            .started
            .elapsed()
            .saturating_sub(self.buffer.waiting_for_output());
        self.shuffle.wall_time_ms = wall.as_millis() as u64;
    }

    pub fn task_info(&self) -> TaskInfo {
        let execution = &self.resources.execution;
        let task = execution.task_context();
        let state_machine = execution.state_machine();
        let operators = task.operator_contexts();
        let sum = |f: fn(&crate::runtime::task_context::OperatorStats) -> u64| -> u64 {
            operators.iter().map(|op| f(&op.stats())).sum()
        };
        let user = task.user_memory_reservation();
        let revocable = task.revocable_memory_reservation();
        let system = task.system_memory_reservation();
        let peak = self.resources.query_context.peak_node_total_memory();
        TaskInfo {
            task_status: TaskStatus {
                task_id: state_machine.task_id().clone(),
                state: state_machine.state(),
                failures: state_machine
                    .failure_causes()
                    .iter()
                    .map(|e| e.to_failure_info())
                    .collect(),
                memory_reservation_bytes: user + revocable,
                system_memory_reservation_bytes: system,
                peak_node_total_memory: peak,
            },
            output_buffers: self.buffer.info(),
            stats: TaskStats {
                create_time: Some(state_machine.created_at()),
                end_time: state_machine.end_time(),
                elapsed_time_ms: state_machine.elapsed().as_millis() as u64,
                total_cpu_time_ms: task.total_cpu_time().as_millis() as u64,
                user_memory_reservation_bytes: user,
                revocable_memory_reservation_bytes: revocable,
                system_memory_reservation_bytes: system,
                peak_total_memory_bytes: peak,
                peak_user_memory_bytes: task.tracker().peak().max(0) as u64,
                full_gc_count: 0,
                full_gc_time_ms: 0,
                total_drivers: execution.total_drivers(),
                completed_drivers: execution.completed_drivers(),
                raw_input_rows: sum(|s| s.input_rows),
                raw_input_bytes: sum(|s| s.input_bytes),
                output_rows: self.buffer.total_rows(),
                output_bytes: self.shuffle.bytes,
                spilled_bytes: sum(|s| s.spilled_bytes),
            },
            shuffle_stats: self.shuffle,
        }
    }
}

impl Iterator for TaskOutputIterator {
    type Item = ExecResult<TaskOutputItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

impl Drop for TaskOutputIterator {
    fn drop(&mut self) {
        if !self.finished && self.resources.execution.cancel() {
            info!(
                "task {} canceled because its output was dropped",
                self.resources.execution.state_machine().task_id()
            );
        }
    }
}

/// Runtime and interruption failures surface as they are; everything else is wrapped.
fn propagate(cause: ExecutionError) -> ExecutionError {
    match cause.kind() {
        ErrorKind::Runtime | ErrorKind::Interrupted => cause,
        ErrorKind::Io | ErrorKind::Configuration => {
            ExecutionError::internal(cause.message().to_string()).with_cause(cause)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorCode;

    #[test]
    fn test_propagate_keeps_runtime_errors() {
        let err = ExecutionError::exceeded_spill_limit(10);
        assert_eq!(propagate(err.clone()).code(), ErrorCode::ExceededSpillLimit);
        let io = ExecutionError::io(
            "write temp file",
            &std::io::Error::other("disk full"),
        );
        let wrapped = propagate(io);
        assert_eq!(wrapped.kind(), ErrorKind::Runtime);
        assert_eq!(wrapped.cause().unwrap().kind(), ErrorKind::Io);
    }
}
