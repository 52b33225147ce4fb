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
//! Bounded worker pools for background work.
//!
//! Memory revocation and task drivers run on dedicated pools so that a pool listener firing
//! on a reserving thread never waits for spill I/O.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::common::config::{
    memory_revoking_queue_size, memory_revoking_threads, task_executor_queue_size,
    task_executor_threads,
};
use crate::common::error::{ExecResult, ExecutionError};
use crate::novaexec_logging::error;

pub type Task = Box<dyn FnOnce() -> ExecResult<()> + Send + 'static>;

/// Where background work is sent.
pub trait Executor: Send + Sync {
    /// Queue `task`; an error means the task was dropped without running.
    fn execute(&self, task: Task) -> ExecResult<()>;
}

pub struct ThreadPoolExecutor {
    name: String,
    inner: Arc<ThreadPoolInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(name: impl Into<String>, num_threads: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let inner = Arc::new(ThreadPoolInner::new(queue_capacity));
        let threads = num_threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let inner_clone = Arc::clone(&inner);
            let worker_name = name.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, idx))
                .spawn(move || worker_loop(&worker_name, inner_clone));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("failed to spawn {} worker: {}", name, err),
            }
        }
        Self {
            name,
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.num_tasks()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Stop accepting work, drop queued tasks and join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock().expect("executor workers lock"));
        for handle in workers {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) -> ExecResult<()> {
        self.inner.submit(task).map_err(|reason| {
            ExecutionError::insufficient_resources(format!("{}: {}", self.name, reason))
        })
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.name)
            .field("queued", &self.num_tasks())
            .finish()
    }
}

struct ThreadPoolInner {
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    capacity: usize,
    active: AtomicUsize,
    shutdown: AtomicBool,
}

impl ThreadPoolInner {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    fn submit(&self, task: Task) -> Result<(), &'static str> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err("executor is shut down");
        }
        let mut queue = self.queue.lock().expect("executor queue lock");
        if queue.len() >= self.capacity {
            return Err("executor queue is full");
        }
        queue.push_back(task);
        self.cv.notify_one();
        Ok(())
    }

    fn num_tasks(&self) -> usize {
        self.queue.lock().expect("executor queue lock").len()
    }

    fn take(&self) -> Option<Task> {
        let mut queue = self.queue.lock().expect("executor queue lock");
        while queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            queue = self.cv.wait(queue).expect("executor queue condvar wait");
        }
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        queue.pop_front()
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut queue = self.queue.lock().expect("executor queue lock");
        queue.clear();
        self.cv.notify_all();
    }
}

fn worker_loop(name: &str, inner: Arc<ThreadPoolInner>) {
    while let Some(task) = inner.take() {
        inner.active.fetch_add(1, Ordering::AcqRel);
        let result = task();
        inner.active.fetch_sub(1, Ordering::AcqRel);
        if let Err(err) = result {
            error!("{} task failed: {}", name, err);
        }
    }
}

static MEMORY_REVOKING_EXECUTOR: OnceLock<Arc<ThreadPoolExecutor>> = OnceLock::new();
static TASK_EXECUTOR: OnceLock<Arc<ThreadPoolExecutor>> = OnceLock::new();

/// Process-wide pool reserved for memory revocation passes.
pub fn memory_revoking_executor() -> Arc<ThreadPoolExecutor> {
    Arc::clone(MEMORY_REVOKING_EXECUTOR.get_or_init(|| {
        Arc::new(ThreadPoolExecutor::new(
            "memory-revoking",
            memory_revoking_threads(),
            memory_revoking_queue_size(),
        ))
    }))
}

/// Process-wide pool running task drivers.
pub fn task_executor() -> Arc<ThreadPoolExecutor> {
    Arc::clone(TASK_EXECUTOR.get_or_init(|| {
        Arc::new(ThreadPoolExecutor::new(
            "task-executor",
            task_executor_threads(),
            task_executor_queue_size(),
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_submitted_tasks() {
        let exec = ThreadPoolExecutor::new("test", 2, 16);
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            exec.execute(Box::new(move || {
                tx.send(i).unwrap();
                Ok(())
            }))
            .unwrap();
        }
        let mut got: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
        exec.shutdown();
    }

    #[test]
    fn test_failed_task_does_not_kill_worker() {
        let exec = ThreadPoolExecutor::new("test", 1, 16);
        exec.execute(Box::new(|| Err(ExecutionError::internal("boom"))))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        exec.execute(Box::new(move || {
            tx.send(()).unwrap();
            Ok(())
        }))
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        exec.shutdown();
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let exec = ThreadPoolExecutor::new("test", 1, 1);
        exec.shutdown();
        assert!(exec.execute(Box::new(|| Ok(()))).is_err());
    }
}
