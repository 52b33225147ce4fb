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
//! Operator contract and the operators the execution core ships with.
//!
//! Responsibilities:
//! - Defines the push/pull step contract drivers use to move pages between operators,
//!   including the memory revoke hooks.
//! - Provides the split source, the spillable page buffer and the task output sink.
//!
//! Current limitations:
//! - Relational operators (joins, aggregations) are supplied by the planner layer through
//!   `TaskPlan`; only the operators needed to move and spill pages live here.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::common::error::{ExecResult, ExecutionError};
use crate::exec::output_buffer::OutputBuffer;
use crate::exec::page::Page;
use crate::exec::split::Split;
use crate::exec::temp_storage::{TempStorage, TempStorageHandle};
use crate::runtime::task_context::OperatorContext;

/// Step contract driven by [`Driver`](crate::exec::driver::Driver).
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn context(&self) -> &Arc<OperatorContext>;

    fn need_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, page: Page) -> ExecResult<()> {
        let _ = page;
        Err(ExecutionError::internal(format!(
            "{} does not accept input",
            self.name()
        )))
    }

    fn get_output(&mut self) -> ExecResult<Option<Page>> {
        Ok(None)
    }

    /// No more input will be added.
    fn finish(&mut self) -> ExecResult<()>;

    fn is_finished(&self) -> bool;

    /// Spill revocable memory. Called on the driver thread after a revoke request.
    fn start_memory_revoke(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn finish_memory_revoke(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ExecResult<()> {
        self.context().close()
    }
}

/// Emits the pages carried by its splits.
pub struct SplitSourceOperator {
    context: Arc<OperatorContext>,
    splits: VecDeque<Split>,
    pending: VecDeque<Page>,
    finished: bool,
}

impl SplitSourceOperator {
    pub fn new(context: Arc<OperatorContext>, splits: Vec<Split>) -> Self {
        Self {
            context,
            splits: splits.into(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl Operator for SplitSourceOperator {
    fn name(&self) -> &str {
        "SplitSource"
    }

    fn context(&self) -> &Arc<OperatorContext> {
        &self.context
    }

    fn get_output(&mut self) -> ExecResult<Option<Page>> {
        while self.pending.is_empty() {
            let Some(split) = self.splits.pop_front() else {
                break;
            };
            self.context.record_input(0, split.data.len() as u64);
            self.pending = Page::deserialize_all(split.data)?.into();
        }
        let Some(page) = self.pending.pop_front() else {
            self.finished = true;
            return Ok(None);
        };
        self.context
            .record_output(page.positions() as u64, page.size_in_bytes());
        Ok(Some(page))
    }

    fn finish(&mut self) -> ExecResult<()> {
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Buffers every input page and emits them once input is finished. Buffered pages are
/// revocable memory; on revoke they are written to temp storage and read back when the
/// operator emits its output.
pub struct SpillableBufferOperator {
    context: Arc<OperatorContext>,
    storage: Arc<dyn TempStorage>,
    buffered: Vec<Page>,
    buffered_bytes: u64,
    spills: Vec<TempStorageHandle>,
    // Spill space held against the query until the spilled pages are emitted or dropped.
    spill_reserved: u64,
    output: VecDeque<Page>,
    input_finished: bool,
}

impl SpillableBufferOperator {
    pub fn new(context: Arc<OperatorContext>, storage: Arc<dyn TempStorage>) -> Self {
        Self {
            context,
            storage,
            buffered: Vec::new(),
            buffered_bytes: 0,
            spills: Vec::new(),
            spill_reserved: 0,
            output: VecDeque::new(),
            input_finished: false,
        }
    }

    pub fn spill_count(&self) -> usize {
        self.spills.len()
    }

    fn spill(&mut self) -> ExecResult<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let bytes = self.buffered_bytes;
        let query_memory = Arc::clone(self.context.query_memory());
        query_memory.reserve_spill(bytes)?;

        let chunks: Vec<Bytes> = self.buffered.iter().map(Page::serialize).collect();
        let (handle, closed) = match write_spill(self.storage.as_ref(), &chunks) {
            Ok(written) => written,
            Err(err) => {
                query_memory.free_spill(bytes);
                return Err(err);
            }
        };
        self.spill_reserved += bytes;
        self.context.record_spill(bytes);
        self.spills.push(handle);
        self.buffered.clear();
        self.buffered_bytes = 0;
        let released = self.context.revocable_memory().set_bytes(0);
        closed.and(released)
    }

    fn release_spill_space(&mut self) {
        self.context
            .query_memory()
            .free_spill(std::mem::take(&mut self.spill_reserved));
    }

    fn unspill(&mut self) -> ExecResult<()> {
        for handle in std::mem::take(&mut self.spills) {
            let data = self.storage.open(&handle)?;
            self.output.extend(Page::deserialize_all(data)?);
            self.storage.remove(&handle)?;
        }
        Ok(())
    }
}

impl Operator for SpillableBufferOperator {
    fn name(&self) -> &str {
        "SpillableBuffer"
    }

    fn context(&self) -> &Arc<OperatorContext> {
        &self.context
    }

    fn need_input(&self) -> bool {
        !self.input_finished
    }

    fn add_input(&mut self, page: Page) -> ExecResult<()> {
        let bytes = page.size_in_bytes();
        self.context.record_input(page.positions() as u64, bytes);
        self.context
            .revocable_memory()
            .set_bytes(self.buffered_bytes + bytes)?;
        self.buffered_bytes += bytes;
        self.buffered.push(page);
        Ok(())
    }

    fn get_output(&mut self) -> ExecResult<Option<Page>> {
        if !self.input_finished {
            return Ok(None);
        }
        let page = self.output.pop_front();
        if let Some(page) = &page {
            self.context
                .record_output(page.positions() as u64, page.size_in_bytes());
        }
        Ok(page)
    }

    fn finish(&mut self) -> ExecResult<()> {
        if self.input_finished {
            return Ok(());
        }
        self.input_finished = true;
        self.unspill()?;
        self.output.extend(self.buffered.drain(..));
        self.buffered_bytes = 0;
        self.release_spill_space();
        // Emitted pages are owned by downstream; stop counting them as revocable.
        self.context.revocable_memory().set_bytes(0)
    }

    fn is_finished(&self) -> bool {
        self.input_finished && self.output.is_empty()
    }

    fn start_memory_revoke(&mut self) -> ExecResult<()> {
        if self.input_finished {
            return Ok(());
        }
        self.spill()
    }

    /// Removes spill files that were never read back.
    fn close(&mut self) -> ExecResult<()> {
        let mut errors: Vec<ExecutionError> = Vec::new();
        for handle in std::mem::take(&mut self.spills) {
            if let Err(err) = self.storage.remove(&handle) {
                errors.push(err);
            }
        }
        self.release_spill_space();
        if let Err(err) = self.context.close() {
            errors.push(err);
        }
        let mut errors = errors.into_iter();
        match errors.next() {
            Some(mut first) => {
                errors.for_each(|err| first.add_suppressed(err));
                Err(first)
            }
            None => Ok(()),
        }
    }
}

/// Write `chunks` to a new temp file. An error means nothing was committed and the sink is
/// already rolled back and closed; otherwise the committed handle comes with the result of
/// closing the sink.
fn write_spill(
    storage: &dyn TempStorage,
    chunks: &[Bytes],
) -> ExecResult<(TempStorageHandle, ExecResult<()>)> {
    let mut sink = storage.create()?;
    match sink.write(chunks).and_then(|_| sink.commit()) {
        Ok(handle) => Ok((handle, sink.close())),
        Err(mut err) => {
            if let Err(e) = sink.rollback() {
                err.add_suppressed(e);
            }
            if let Err(e) = sink.close() {
                err.add_suppressed(e);
            }
            Err(err)
        }
    }
}

/// Sink that hands pages to the task output buffer.
pub struct TaskOutputOperator {
    context: Arc<OperatorContext>,
    buffer: Arc<OutputBuffer>,
    finished: bool,
}

impl TaskOutputOperator {
    pub fn new(context: Arc<OperatorContext>, buffer: Arc<OutputBuffer>) -> Self {
        Self {
            context,
            buffer,
            finished: false,
        }
    }
}

impl Operator for TaskOutputOperator {
    fn name(&self) -> &str {
        "TaskOutput"
    }

    fn context(&self) -> &Arc<OperatorContext> {
        &self.context
    }

    fn need_input(&self) -> bool {
        !self.finished && !self.buffer.is_full()
    }

    fn add_input(&mut self, page: Page) -> ExecResult<()> {
        self.context
            .record_input(page.positions() as u64, page.size_in_bytes());
        self.buffer.enqueue(page)
    }

    fn finish(&mut self) -> ExecResult<()> {
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
