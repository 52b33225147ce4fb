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
use std::path::PathBuf;
use std::time::Duration;

use crate::common::app_config::{DispatchConfig, MemoryConfig, RuntimeConfig, SpillConfig};
use crate::novaexec_config::config as novaexec_app_config;

fn memory() -> MemoryConfig {
    novaexec_app_config()
        .ok()
        .map(|c| c.memory.clone())
        .unwrap_or_default()
}

fn spill() -> SpillConfig {
    novaexec_app_config()
        .ok()
        .map(|c| c.spill.clone())
        .unwrap_or_default()
}

fn runtime() -> RuntimeConfig {
    novaexec_app_config()
        .ok()
        .map(|c| c.runtime.clone())
        .unwrap_or_default()
}

fn dispatch() -> DispatchConfig {
    novaexec_app_config()
        .ok()
        .map(|c| c.dispatch.clone())
        .unwrap_or_default()
}

pub(crate) fn query_max_memory_per_node() -> u64 {
    memory().query_max_memory_per_node
}

pub(crate) fn query_max_total_memory_per_node() -> u64 {
    memory().query_max_total_memory_per_node
}

pub(crate) fn query_max_revocable_memory_per_node() -> u64 {
    memory().query_max_revocable_memory_per_node
}

pub(crate) fn query_max_broadcast_memory() -> u64 {
    memory().query_max_broadcast_memory
}

pub(crate) fn node_max_broadcast_memory() -> u64 {
    memory().node_max_broadcast_memory
}

pub(crate) fn verbose_exceeded_memory_limit_errors() -> bool {
    memory().verbose_exceeded_memory_limit_errors
}

pub(crate) fn heap_dump_on_exceeded_memory_limit() -> bool {
    memory().heap_dump_on_exceeded_memory_limit
}

pub(crate) fn heap_dump_dir() -> PathBuf {
    PathBuf::from(memory().heap_dump_dir)
}

pub(crate) fn dynamic_tuning_enabled() -> bool {
    memory().dynamic_tuning_enabled
}

pub(crate) fn dynamic_tuning_attempt_threshold() -> u32 {
    memory().dynamic_tuning_attempt_threshold
}

pub(crate) fn dynamic_tuning_fraction() -> f64 {
    memory().dynamic_tuning_fraction
}

pub(crate) fn available_runtime_memory_override() -> Option<u64> {
    memory().available_runtime_memory_override
}

pub(crate) fn spill_enabled() -> bool {
    spill().enable
}

pub(crate) fn revoking_threshold() -> f64 {
    spill().revoking_threshold
}

pub(crate) fn revoking_target() -> f64 {
    spill().revoking_target
}

pub(crate) fn max_spill_per_node() -> u64 {
    spill().max_spill_per_node
}

pub(crate) fn temp_storage_dirs() -> Vec<PathBuf> {
    spill().effective_local_dirs()
}

pub(crate) fn temp_storage_write_buffer_size() -> usize {
    spill().write_buffer_size
}

pub(crate) fn query_executor_threads() -> usize {
    runtime().query_executor_threads
}

pub(crate) fn task_executor_threads() -> usize {
    runtime().actual_task_executor_threads()
}

pub(crate) fn task_executor_queue_size() -> usize {
    runtime().task_executor_queue_size
}

pub(crate) fn memory_revoking_threads() -> usize {
    runtime().memory_revoking_threads
}

pub(crate) fn memory_revoking_queue_size() -> usize {
    runtime().memory_revoking_queue_size
}

pub(crate) fn sink_max_buffer_size() -> u64 {
    runtime().sink_max_buffer_size
}

pub(crate) fn task_time_slice() -> Duration {
    Duration::from_millis(runtime().task_time_slice_ms)
}

pub(crate) fn output_buffer_type() -> String {
    runtime().output_buffer_type
}

pub(crate) fn min_workers() -> usize {
    dispatch().min_workers
}

pub(crate) fn min_coordinator_sidecars() -> usize {
    dispatch().min_coordinator_sidecars
}

pub(crate) fn required_workers_max_wait() -> Duration {
    Duration::from_millis(dispatch().required_workers_max_wait_ms)
}
