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
//! Process-wide tokio runtime running dispatch continuations.

use std::sync::{Arc, OnceLock};

use tokio::runtime::{Handle, Runtime};

use crate::common::config::query_executor_threads;
use crate::common::error::{ExecResult, ExecutionError};
use crate::novaexec_logging::info;

const QUERY_RUNTIME_THREAD_NAME: &str = "novaexec-query-executor";
static QUERY_RUNTIME: OnceLock<Result<Arc<Runtime>, String>> = OnceLock::new();

pub fn query_runtime() -> ExecResult<&'static Arc<Runtime>> {
    match QUERY_RUNTIME.get_or_init(|| {
        let worker_threads = query_executor_threads().max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(worker_threads)
            .thread_name(QUERY_RUNTIME_THREAD_NAME)
            .build()
            .map_err(|e| format!("init query executor runtime failed: {e}"))?;
        info!(
            worker_threads,
            thread_name = QUERY_RUNTIME_THREAD_NAME,
            "query executor runtime initialized"
        );
        Ok(Arc::new(runtime))
    }) {
        Ok(runtime) => Ok(runtime),
        Err(err) => Err(ExecutionError::internal(err.clone())),
    }
}

/// Handle used to spawn dispatch continuations.
pub fn query_runtime_handle() -> ExecResult<Handle> {
    Ok(query_runtime()?.handle().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn query_runtime_is_singleton_across_threads() {
        let expected_ptr = Arc::as_ptr(query_runtime().expect("get query runtime")) as usize;
        let handles = (0..8)
            .map(|_| {
                thread::spawn(move || {
                    let ptr = Arc::as_ptr(query_runtime().expect("get query runtime")) as usize;
                    assert_eq!(ptr, expected_ptr);
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join runtime singleton checker");
        }
    }

    #[test]
    fn query_runtime_handle_spawns() {
        let handle = query_runtime_handle().expect("query runtime handle");
        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            tx.send(7_u32).expect("send from query runtime");
        });
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 7);
    }
}
