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
//! Tests that run against a loaded `novaexec.toml`.
//!
//! The process configuration is global, so this file keeps its own test binary.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestConfig, query_id, run_with_timeout, source, task_id};
use novaexec::ExecResult;
use novaexec::common::query_options::QueryOptions;
use novaexec::exec::task_executor_factory::{BufferedScanPlan, TaskExecutorFactory, TaskRequest};
use novaexec::exec::task_info::CollectingTaskInfoCollector;
use novaexec::exec::task_output::TaskOutputItem;
use novaexec::novaexec_logging;
use novaexec::runtime::task_state_machine::TaskState;

#[test]
fn test_factory_from_config_runs_task() {
    let test_config = TestConfig::new().unwrap();
    let cfg = test_config.load_config().unwrap();
    novaexec_logging::init_from_config(cfg);
    assert!(cfg.spill.enable);
    assert_eq!(cfg.runtime.task_time_slice_ms, 50);
    assert_eq!(cfg.effective_log_filter(), "info,novaexec=debug");

    // Options left unset resolve against the loaded file.
    let options = QueryOptions::default();
    assert_eq!(options.memory_limits().max_total_memory, 1 << 20);
    let spill = options.spill_settings().unwrap();
    assert!(spill.enabled);
    assert_eq!(spill.revoking_threshold, 0.9);
    assert_eq!(options.output_buffer_type(), "PAGE");

    let collector = Arc::new(CollectingTaskInfoCollector::default());
    let factory = TaskExecutorFactory::from_config(collector.clone()).unwrap();
    assert!(test_config.temp_dir.path().join("spill").is_dir());

    let request = TaskRequest {
        task_id: task_id(&query_id("configured"), 0),
        options,
        sources: vec![source("0", 1, 2)],
    };
    let iterator = factory.create(request, &BufferedScanPlan::default()).unwrap();
    let items: Vec<TaskOutputItem> = run_with_timeout(Duration::from_secs(10), move || {
        iterator.collect::<ExecResult<Vec<_>>>()
    })
    .unwrap();

    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| matches!(item, TaskOutputItem::Page(_))));
    let infos = collector.infos();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].task_status.state, TaskState::Finished);
}
