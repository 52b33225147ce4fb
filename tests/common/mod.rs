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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use novaexec::common::ids::{QueryId, TaskId};
use novaexec::common::query_options::{DiagnosticSettings, MemoryLimits, SpillSettings};
use novaexec::exec::page::Page;
use novaexec::exec::split::{Split, TaskSource};
use novaexec::novaexec_config;
use novaexec::novaexec_logging;
use novaexec::runtime::executor::{Executor, Task};
use novaexec::ExecResult;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novaexec.toml");
        let spill_dir = temp_dir.path().join("spill");

        let config_content = format!(
            r#"
log_level = "debug"

[memory]
query_max_total_memory_per_node = 1048576

[spill]
enable = true
revoking_threshold = 0.9
revoking_target = 0.5
local_dirs = ["{}"]

[runtime]
task_executor_threads = 2
task_time_slice_ms = 50
"#,
            spill_dir.display()
        );

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novaexec_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static novaexec_config::NovaExecConfig> {
        novaexec_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

pub fn query_id(name: &str) -> QueryId {
    QueryId::new(name).expect("valid query id")
}

pub fn task_id(query: &QueryId, partition: u32) -> TaskId {
    TaskId::for_stage(query, 1, partition, 0)
}

pub fn limits(max_total_memory: u64) -> MemoryLimits {
    MemoryLimits {
        max_user_memory: 1 << 30,
        max_total_memory,
        max_revocable_memory: 1 << 30,
        max_broadcast_memory: 1 << 30,
        max_spill: 1 << 30,
    }
}

pub fn spill(enabled: bool, threshold: f64, target: f64) -> SpillSettings {
    SpillSettings {
        enabled,
        revoking_threshold: threshold,
        revoking_target: target,
    }
}

pub fn diagnostics() -> DiagnosticSettings {
    DiagnosticSettings {
        verbose_exceeded_memory_limit_errors: false,
        heap_dump_on_exceeded_memory_limit: false,
        heap_dump_dir: PathBuf::from("/nonexistent"),
    }
}

/// A page with `rows` rows of `width` bytes each.
pub fn page(rows: usize, width: usize) -> Page {
    Page::new((0..rows).map(|i| bytes::Bytes::from(vec![i as u8; width])).collect())
}

/// A source whose splits carry `pages_per_split` serialized pages each.
pub fn source(plan_node_id: &str, splits: usize, pages_per_split: usize) -> TaskSource {
    let splits = (0..splits)
        .map(|id| {
            let mut data = Vec::new();
            for _ in 0..pages_per_split {
                data.extend_from_slice(&page(4, 8).serialize());
            }
            Split {
                split_id: id as u64,
                size_hint: Some(data.len() as u64),
                data: bytes::Bytes::from(data),
            }
        })
        .collect();
    TaskSource::new(plan_node_id, splits)
}

/// Holds submitted work until the test runs it; counts submissions.
#[derive(Default)]
pub struct CountingExecutor {
    submitted: AtomicUsize,
    queue: Mutex<Vec<Task>>,
}

impl CountingExecutor {
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn run_pending(&self) {
        let tasks = std::mem::take(&mut *self.queue.lock().unwrap());
        for task in tasks {
            task().unwrap();
        }
    }
}

impl Executor for CountingExecutor {
    fn execute(&self, task: Task) -> ExecResult<()> {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        self.queue.lock().unwrap().push(task);
        Ok(())
    }
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
}
