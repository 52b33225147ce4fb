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
//! Minimum cluster size gate.
//!
//! The membership layer pushes the current number of active workers and coordinator
//! sidecars through [`ClusterSizeMonitor::update`]. Queries waiting for resources hold a
//! future that resolves once the required count is reached, or fails with
//! `GENERIC_INSUFFICIENT_RESOURCES` after the configured maximum wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::common::config;
use crate::common::error::{ExecResult, ExecutionError};
use crate::common::util::succinct_duration;
use crate::novaexec_logging::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterSize {
    pub workers: usize,
    pub coordinator_sidecars: usize,
}

/// Source of the minimum-resources futures a dispatch waits on.
pub trait ClusterResources: Send + Sync {
    fn wait_for_minimum_workers(&self) -> BoxFuture<'static, ExecResult<()>>;

    fn wait_for_minimum_coordinator_sidecars(&self) -> BoxFuture<'static, ExecResult<()>>;
}

pub struct ClusterSizeMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    size: watch::Sender<ClusterSize>,
    min_workers: usize,
    min_coordinator_sidecars: usize,
    max_wait: Duration,
    waiters: AtomicUsize,
}

#[derive(Clone, Copy)]
enum NodeKind {
    Worker,
    CoordinatorSidecar,
}

impl NodeKind {
    fn label(self) -> &'static str {
        match self {
            NodeKind::Worker => "worker",
            NodeKind::CoordinatorSidecar => "coordinator sidecar",
        }
    }

    fn count(self, size: &ClusterSize) -> usize {
        match self {
            NodeKind::Worker => size.workers,
            NodeKind::CoordinatorSidecar => size.coordinator_sidecars,
        }
    }
}

struct WaiterGuard(Arc<MonitorInner>);

impl WaiterGuard {
    fn new(inner: Arc<MonitorInner>) -> Self {
        inner.waiters.fetch_add(1, Ordering::AcqRel);
        Self(inner)
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ClusterSizeMonitor {
    pub fn new(min_workers: usize, min_coordinator_sidecars: usize, max_wait: Duration) -> Self {
        let (size, _) = watch::channel(ClusterSize::default());
        Self {
            inner: Arc::new(MonitorInner {
                size,
                min_workers,
                min_coordinator_sidecars,
                max_wait,
                waiters: AtomicUsize::new(0),
            }),
        }
    }

    /// Monitor using the `[dispatch]` section of the process configuration.
    pub fn from_config() -> Self {
        Self::new(
            config::min_workers(),
            config::min_coordinator_sidecars(),
            config::required_workers_max_wait(),
        )
    }

    pub fn update(&self, size: ClusterSize) {
        debug!(
            "cluster size updated: {} workers, {} coordinator sidecars",
            size.workers, size.coordinator_sidecars
        );
        self.inner.size.send_replace(size);
    }

    pub fn cluster_size(&self) -> ClusterSize {
        *self.inner.size.borrow()
    }

    /// Futures currently waiting for the cluster to grow.
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::Acquire)
    }

    fn wait_for(&self, kind: NodeKind, required: usize) -> BoxFuture<'static, ExecResult<()>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if kind.count(&inner.size.borrow()) >= required {
                return Ok(());
            }
            let _waiter = WaiterGuard::new(Arc::clone(&inner));
            let mut rx = inner.size.subscribe();
            let reached = tokio::time::timeout(inner.max_wait, async move {
                rx.wait_for(|size| kind.count(size) >= required)
                    .await
                    .map(|_| ())
            })
            .await;
            match reached {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ExecutionError::internal("cluster size monitor closed")),
                Err(_) => {
                    let active = kind.count(&inner.size.borrow());
                    Err(ExecutionError::insufficient_resources(format!(
                        "Insufficient active {label} nodes. Waited {} for at least {} {label}s, but only {} {label}s are active",
                        succinct_duration(inner.max_wait),
                        required,
                        active,
                        label = kind.label()
                    )))
                }
            }
        })
    }
}

impl ClusterResources for ClusterSizeMonitor {
    fn wait_for_minimum_workers(&self) -> BoxFuture<'static, ExecResult<()>> {
        self.wait_for(NodeKind::Worker, self.inner.min_workers)
    }

    fn wait_for_minimum_coordinator_sidecars(&self) -> BoxFuture<'static, ExecResult<()>> {
        self.wait_for(NodeKind::CoordinatorSidecar, self.inner.min_coordinator_sidecars)
    }
}
