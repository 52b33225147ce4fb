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
//! End-to-end tests of task execution through `TaskExecutorFactory`.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use common::{query_id, run_with_timeout, source, task_id};
use novaexec::ExecResult;
use novaexec::common::error::{ErrorCode, ErrorKind, ExecutionError};
use novaexec::common::query_options::QueryOptions;
use novaexec::exec::split::TaskSource;
use novaexec::exec::task_executor_factory::{BufferedScanPlan, TaskExecutorFactory, TaskRequest};
use novaexec::exec::task_info::CollectingTaskInfoCollector;
use novaexec::exec::task_output::{TaskOutputItem, TaskOutputIterator};
use novaexec::exec::temp_storage::{
    LocalTempStorage, TempDataSink, TempStorage, TempStorageHandle,
};
use novaexec::runtime::executor::{Executor, Task, ThreadPoolExecutor};
use novaexec::runtime::task_state_machine::TaskState;

const PAGE_BYTES: u64 = 32;

/// Runs revoke passes on the reserving thread so spills happen deterministically.
struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) -> ExecResult<()> {
        task()
    }
}

struct Fixture {
    dir: TempDir,
    storage: Arc<dyn TempStorage>,
    collector: Arc<CollectingTaskInfoCollector>,
    factory: TaskExecutorFactory,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn TempStorage> =
            Arc::new(LocalTempStorage::new(vec![dir.path().to_path_buf()]).unwrap());
        Self::with_storage(dir, storage)
    }

    fn with_storage(dir: TempDir, storage: Arc<dyn TempStorage>) -> Self {
        let collector = Arc::new(CollectingTaskInfoCollector::default());
        let factory = TaskExecutorFactory::new(
            Arc::clone(&storage),
            Arc::new(InlineExecutor),
            Arc::new(ThreadPoolExecutor::new("test-task-executor", 2, 1024)),
            collector.clone(),
        );
        Self {
            dir,
            storage,
            collector,
            factory,
        }
    }

    fn dir(&self) -> &Path {
        self.dir.path()
    }

    fn run(
        &self,
        name: &str,
        partition: u32,
        options: QueryOptions,
        sources: Vec<TaskSource>,
        spill: bool,
    ) -> ExecResult<TaskOutputIterator> {
        let request = TaskRequest {
            task_id: task_id(&query_id(name), partition),
            options,
            sources,
        };
        self.factory.create(request, &BufferedScanPlan { spill })
    }
}

fn options(buffer_type: &str) -> QueryOptions {
    QueryOptions {
        output_buffer_type: Some(buffer_type.to_string()),
        spill_enabled: Some(false),
        query_max_memory_per_node: Some(1 << 20),
        query_max_total_memory_per_node: Some(1 << 20),
        max_spill_per_node: Some(1 << 20),
        sink_max_buffer_size: Some(1 << 20),
        temp_storage_write_buffer_size: Some(64),
        dynamic_memory_tuning_enabled: Some(false),
        ..Default::default()
    }
}

fn drain(iterator: TaskOutputIterator) -> ExecResult<Vec<TaskOutputItem>> {
    run_with_timeout(Duration::from_secs(10), move || iterator.collect())
}

#[test]
fn test_page_output_delivers_every_page() {
    let fixture = Fixture::new();
    let iterator = fixture
        .run(
            "page_output",
            0,
            options("PAGE"),
            vec![source("0", 2, 3), source("1", 2, 3)],
            false,
        )
        .unwrap();
    let items = drain(iterator).unwrap();

    assert_eq!(items.len(), 12);
    let mut rows = 0;
    for item in &items {
        match item {
            TaskOutputItem::Page(page) => {
                assert_eq!(page.size_in_bytes(), PAGE_BYTES);
                rows += page.positions();
            }
            other => panic!("unexpected output {:?}", other),
        }
    }
    assert_eq!(rows, 48);

    let infos = fixture.collector.infos();
    assert_eq!(infos.len(), 1);
    let info = &infos[0];
    assert_eq!(info.task_status.state, TaskState::Finished);
    assert!(info.task_status.failures.is_empty());
    assert_eq!(info.stats.total_drivers, 2);
    assert_eq!(info.stats.completed_drivers, 2);
    assert_eq!(info.stats.output_rows, 48);
    assert_eq!(info.shuffle_stats.rows, 48);
    assert_eq!(info.shuffle_stats.batches, 12);
    assert_eq!(info.shuffle_stats.bytes, 12 * PAGE_BYTES);
    assert!(info.to_json().unwrap().contains("\"taskStatus\""));
}

#[test]
fn test_row_output_is_tagged_with_partition() {
    let fixture = Fixture::new();
    let iterator = fixture
        .run("row_output", 5, options("ROW"), vec![source("0", 1, 2)], false)
        .unwrap();
    let items = drain(iterator).unwrap();

    assert_eq!(items.len(), 2);
    for item in items {
        let TaskOutputItem::Rows(batch) = item else {
            panic!("expected rows");
        };
        assert_eq!(batch.partition, 5);
        assert_eq!(batch.rows.len(), 4);
    }
}

#[test]
fn test_disk_page_output_writes_one_file() {
    let fixture = Fixture::new();
    let iterator = fixture
        .run(
            "disk_page_output",
            0,
            options("DISK_PAGE"),
            vec![source("0", 3, 4)],
            false,
        )
        .unwrap();
    let items = drain(iterator).unwrap();

    assert_eq!(items.len(), 1);
    let TaskOutputItem::Storage(handle) = &items[0] else {
        panic!("expected a storage handle");
    };
    assert_eq!(handle.page_count, 12);
    assert_eq!(handle.row_count, 48);
    assert_eq!(handle.uncompressed_size_bytes, 12 * PAGE_BYTES);
    let location = handle.handle().unwrap();
    assert!(location.path.starts_with(fixture.dir()));
    assert_eq!(location.size_bytes, handle.written_size_bytes);

    let pages = handle.read_pages(fixture.storage.as_ref()).unwrap();
    assert_eq!(pages.len(), 12);
    assert_eq!(pages.iter().map(|p| p.positions()).sum::<usize>(), 48);

    let infos = fixture.collector.infos();
    assert_eq!(infos[0].task_status.state, TaskState::Finished);
    assert_eq!(infos[0].shuffle_stats.batches, 1);
}

#[test]
fn test_revoked_buffer_spills_and_reads_back() {
    let fixture = Fixture::new();
    let mut options = options("PAGE");
    options.spill_enabled = Some(true);
    options.memory_revoking_threshold = Some(0.25);
    options.memory_revoking_target = Some(0.0);
    // 12 pages of 32 bytes fit under the total limit; revoking starts above 100 bytes.
    options.query_max_total_memory_per_node = Some(400);
    let iterator = fixture
        .run("spilled_buffer", 0, options, vec![source("0", 3, 4)], true)
        .unwrap();
    let items = drain(iterator).unwrap();

    assert_eq!(items.len(), 12);
    let infos = fixture.collector.infos();
    let info = &infos[0];
    assert_eq!(info.task_status.state, TaskState::Finished);
    assert!(info.stats.spilled_bytes > 0);
    assert_eq!(info.stats.revocable_memory_reservation_bytes, 0);
    assert!(info.task_status.peak_node_total_memory <= 400);
    // Spill files are removed once read back.
    assert_eq!(std::fs::read_dir(fixture.dir()).unwrap().count(), 0);
}

#[test]
fn test_cancel_surfaces_user_canceled() {
    let fixture = Fixture::new();
    let mut options = options("PAGE");
    options.sink_max_buffer_size = Some(PAGE_BYTES);
    let mut iterator = fixture
        .run("canceled", 0, options, vec![source("0", 4, 4)], false)
        .unwrap();

    assert!(matches!(
        iterator.get_next().unwrap(),
        Some(TaskOutputItem::Page(_))
    ));
    assert!(iterator.cancel());
    let err = run_with_timeout(Duration::from_secs(10), move || {
        loop {
            match iterator.get_next() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("canceled task finished"),
                Err(err) => return err,
            }
        }
    });
    assert_eq!(err.code(), ErrorCode::UserCanceled);
    assert!(err.message().contains("Canceled"), "{}", err);
    assert_eq!(
        fixture.collector.infos()[0].task_status.state,
        TaskState::Canceled
    );
}

#[test]
fn test_dropping_output_cancels_task() {
    let fixture = Fixture::new();
    let mut options = options("PAGE");
    options.sink_max_buffer_size = Some(PAGE_BYTES);
    let iterator = fixture
        .run("dropped", 0, options, vec![source("0", 4, 4)], false)
        .unwrap();
    let state_machine = Arc::clone(iterator.resources().execution.state_machine());
    drop(iterator);
    assert_eq!(
        state_machine.wait_until_done(Duration::from_secs(5)),
        TaskState::Canceled
    );
    assert!(fixture.collector.infos().is_empty());
}

#[test]
fn test_invalid_options_are_rejected() {
    let fixture = Fixture::new();
    let err = fixture
        .run("bad_buffer", 0, options("SHUFFLE"), vec![source("0", 1, 1)], false)
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::ConfigurationInvalid);

    let mut options = options("PAGE");
    options.memory_revoking_threshold = Some(0.4);
    options.memory_revoking_target = Some(0.6);
    let err = fixture
        .run("bad_revoking", 0, options, vec![source("0", 1, 1)], false)
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::ConfigurationInvalid);
}

/// Sink calls that fail on demand. Rollback and close still reach the real sink first.
#[derive(Clone, Copy, Default)]
struct Faults {
    create: bool,
    write: bool,
    rollback: bool,
    close: bool,
}

#[derive(Default)]
struct SinkCalls {
    created: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    closed: AtomicUsize,
    removed: AtomicUsize,
}

fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Local temp storage whose sinks fail on demand; counts every lifecycle call.
struct FaultyStorage {
    inner: LocalTempStorage,
    faults: Faults,
    calls: Arc<SinkCalls>,
}

struct FaultySink {
    inner: Box<dyn TempDataSink>,
    faults: Faults,
    calls: Arc<SinkCalls>,
}

fn injected(op: &str) -> ExecutionError {
    ExecutionError::io(op, &std::io::Error::other("disk full"))
}

impl TempStorage for FaultyStorage {
    fn create(&self) -> ExecResult<Box<dyn TempDataSink>> {
        self.calls.created.fetch_add(1, Ordering::SeqCst);
        if self.faults.create {
            return Err(injected("create temp file"));
        }
        Ok(Box::new(FaultySink {
            inner: self.inner.create()?,
            faults: self.faults,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn open(&self, handle: &TempStorageHandle) -> ExecResult<Bytes> {
        self.inner.open(handle)
    }

    fn remove(&self, handle: &TempStorageHandle) -> ExecResult<()> {
        self.calls.removed.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(handle)
    }
}

impl TempDataSink for FaultySink {
    fn write(&mut self, chunks: &[Bytes]) -> ExecResult<()> {
        if self.faults.write {
            return Err(injected("write temp file"));
        }
        self.inner.write(chunks)
    }

    fn commit(&mut self) -> ExecResult<TempStorageHandle> {
        self.calls.committed.fetch_add(1, Ordering::SeqCst);
        self.inner.commit()
    }

    fn rollback(&mut self) -> ExecResult<()> {
        self.calls.rolled_back.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback()?;
        if self.faults.rollback {
            return Err(injected("roll back temp file"));
        }
        Ok(())
    }

    fn close(&mut self) -> ExecResult<()> {
        self.calls.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close()?;
        if self.faults.close {
            return Err(injected("close temp file"));
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }
}

fn faulty_fixture(faults: Faults) -> (Fixture, Arc<SinkCalls>) {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(SinkCalls::default());
    let storage: Arc<dyn TempStorage> = Arc::new(FaultyStorage {
        inner: LocalTempStorage::new(vec![dir.path().to_path_buf()]).unwrap(),
        faults,
        calls: Arc::clone(&calls),
    });
    (Fixture::with_storage(dir, storage), calls)
}

fn failing_writes() -> Faults {
    Faults {
        write: true,
        ..Default::default()
    }
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_failed_disk_write_releases_sink() {
    let (fixture, calls) = faulty_fixture(failing_writes());
    let mut options = options("DISK_PAGE");
    options.temp_storage_write_buffer_size = Some(1);
    let iterator = fixture
        .run("failed_dump", 0, options, vec![source("0", 2, 2)], false)
        .unwrap();
    let err = drain(iterator).unwrap_err();

    assert_eq!(err.code(), ErrorCode::GenericInternalError);
    assert!(err.message().contains("Unable to dump data to disk"), "{}", err);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::Io);
    assert_eq!(count(&calls.created), 1);
    assert_eq!(count(&calls.rolled_back), 1);
    assert_eq!(count(&calls.closed), 1);
    assert_eq!(count(&calls.committed), 0);
    assert_eq!(fixture.collector.infos().len(), 1);
}

#[test]
fn test_aborted_disk_write_closes_sink_when_rollback_fails() {
    let (fixture, calls) = faulty_fixture(Faults {
        rollback: true,
        ..Default::default()
    });
    let mut options = options("DISK_PAGE");
    // Drivers block on the full buffer, so the task is still running when canceled.
    options.sink_max_buffer_size = Some(PAGE_BYTES);
    let iterator = fixture
        .run("aborted_dump", 0, options, vec![source("0", 4, 4)], false)
        .unwrap();
    assert!(iterator.cancel());
    let err = drain(iterator).unwrap_err();

    assert!(err.message().contains("roll back temp file"), "{}", err);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::Io);
    assert_eq!(count(&calls.created), 1);
    assert_eq!(count(&calls.rolled_back), 1);
    assert_eq!(count(&calls.closed), 1);
    assert_eq!(count(&calls.committed), 0);
    assert_eq!(files_in(fixture.dir()), 0);
    assert_eq!(
        fixture.collector.infos()[0].task_status.state,
        TaskState::Canceled
    );
}

#[test]
fn test_disk_output_is_removed_when_close_fails_after_commit() {
    let (fixture, calls) = faulty_fixture(Faults {
        close: true,
        ..Default::default()
    });
    let iterator = fixture
        .run(
            "close_after_commit",
            0,
            options("DISK_PAGE"),
            vec![source("0", 3, 4)],
            false,
        )
        .unwrap();
    let err = drain(iterator).unwrap_err();

    assert!(err.message().contains("close temp file"), "{}", err);
    assert_eq!(count(&calls.created), 1);
    assert_eq!(count(&calls.committed), 1);
    assert_eq!(count(&calls.closed), 1);
    assert_eq!(count(&calls.rolled_back), 0);
    // The committed file was recorded before closing, so failure cleanup removed it.
    assert_eq!(count(&calls.removed), 1);
    assert_eq!(files_in(fixture.dir()), 0);
}

#[test]
fn test_failed_spill_fails_task_and_releases_sink() {
    let (fixture, calls) = faulty_fixture(failing_writes());
    let mut options = options("PAGE");
    options.spill_enabled = Some(true);
    options.memory_revoking_threshold = Some(0.25);
    options.memory_revoking_target = Some(0.0);
    options.query_max_total_memory_per_node = Some(400);
    let iterator = fixture
        .run("failed_spill", 0, options, vec![source("0", 3, 4)], true)
        .unwrap();
    let err = drain(iterator).unwrap_err();

    // I/O failures are reported as internal errors carrying the original cause.
    assert_eq!(err.code(), ErrorCode::GenericInternalError);
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::Io);
    let created = count(&calls.created);
    assert!(created >= 1);
    assert_eq!(count(&calls.closed), created);
    assert_eq!(count(&calls.rolled_back), created);
    assert_eq!(count(&calls.committed), 0);

    let infos = fixture.collector.infos();
    assert_eq!(infos[0].task_status.state, TaskState::Failed);
    assert_eq!(infos[0].task_status.failures.len(), 1);
    assert_eq!(infos[0].stats.revocable_memory_reservation_bytes, 0);
}

#[test]
fn test_spill_files_are_removed_when_close_fails_after_commit() {
    let (fixture, calls) = faulty_fixture(Faults {
        close: true,
        ..Default::default()
    });
    let mut options = options("PAGE");
    options.spill_enabled = Some(true);
    options.memory_revoking_threshold = Some(0.25);
    options.memory_revoking_target = Some(0.0);
    options.query_max_total_memory_per_node = Some(400);
    let iterator = fixture
        .run("spill_close_failed", 0, options, vec![source("0", 3, 4)], true)
        .unwrap();
    let query = Arc::clone(&iterator.resources().query_context);
    let err = drain(iterator).unwrap_err();

    assert!(err.message().contains("close temp file"), "{}", err);
    let committed = count(&calls.committed);
    assert!(committed >= 1);
    assert_eq!(count(&calls.closed), count(&calls.created));
    // Closing the operator removes every spill file that was never read back.
    assert_eq!(count(&calls.removed), committed);
    assert_eq!(files_in(fixture.dir()), 0);
    assert_eq!(query.memory().spilled_bytes(), 0);

    let infos = fixture.collector.infos();
    assert_eq!(infos[0].task_status.state, TaskState::Failed);
    assert_eq!(infos[0].stats.revocable_memory_reservation_bytes, 0);
}

#[test]
fn test_spill_space_is_returned_when_temp_file_cannot_be_created() {
    let (fixture, calls) = faulty_fixture(Faults {
        create: true,
        ..Default::default()
    });
    let mut options = options("PAGE");
    options.spill_enabled = Some(true);
    options.memory_revoking_threshold = Some(0.25);
    options.memory_revoking_target = Some(0.0);
    options.query_max_total_memory_per_node = Some(400);
    let iterator = fixture
        .run("spill_create_failed", 0, options, vec![source("0", 3, 4)], true)
        .unwrap();
    let query = Arc::clone(&iterator.resources().query_context);
    let err = drain(iterator).unwrap_err();

    assert!(err.message().contains("create temp file"), "{}", err);
    assert!(count(&calls.created) >= 1);
    assert_eq!(count(&calls.closed), 0);
    assert_eq!(query.memory().spilled_bytes(), 0);
    assert_eq!(
        fixture.collector.infos()[0].task_status.state,
        TaskState::Failed
    );
}
