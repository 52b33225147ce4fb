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
//! Per-query session overrides.
//!
//! Every field is optional; unset values fall back to the process configuration
//! (`crate::common::config`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::config;
use crate::common::error::{ExecResult, ExecutionError};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub spill_enabled: Option<bool>,
    pub memory_revoking_threshold: Option<f64>,
    pub memory_revoking_target: Option<f64>,
    pub query_max_memory_per_node: Option<u64>,
    pub query_max_total_memory_per_node: Option<u64>,
    pub query_max_revocable_memory_per_node: Option<u64>,
    pub query_max_broadcast_memory: Option<u64>,
    pub max_spill_per_node: Option<u64>,
    pub verbose_exceeded_memory_limit_errors: Option<bool>,
    pub heap_dump_on_exceeded_memory_limit: Option<bool>,
    pub heap_dump_dir: Option<String>,
    pub dynamic_memory_tuning_enabled: Option<bool>,
    pub dynamic_memory_tuning_attempt_threshold: Option<u32>,
    pub dynamic_memory_tuning_fraction: Option<f64>,
    pub sink_max_buffer_size: Option<u64>,
    pub temp_storage_write_buffer_size: Option<usize>,
    pub output_buffer_type: Option<String>,
}

/// Static per-node memory limits before any retry tuning is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLimits {
    pub max_user_memory: u64,
    pub max_total_memory: u64,
    pub max_revocable_memory: u64,
    pub max_broadcast_memory: u64,
    pub max_spill: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicTuning {
    pub enabled: bool,
    pub attempt_threshold: u32,
    pub fraction: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpillSettings {
    pub enabled: bool,
    pub revoking_threshold: f64,
    pub revoking_target: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticSettings {
    pub verbose_exceeded_memory_limit_errors: bool,
    pub heap_dump_on_exceeded_memory_limit: bool,
    pub heap_dump_dir: PathBuf,
}

impl QueryOptions {
    pub fn memory_limits(&self) -> MemoryLimits {
        MemoryLimits {
            max_user_memory: self
                .query_max_memory_per_node
                .unwrap_or_else(config::query_max_memory_per_node),
            max_total_memory: self
                .query_max_total_memory_per_node
                .unwrap_or_else(config::query_max_total_memory_per_node),
            max_revocable_memory: self
                .query_max_revocable_memory_per_node
                .unwrap_or_else(config::query_max_revocable_memory_per_node),
            max_broadcast_memory: self
                .query_max_broadcast_memory
                .unwrap_or_else(config::query_max_broadcast_memory)
                .min(config::node_max_broadcast_memory()),
            max_spill: self
                .max_spill_per_node
                .unwrap_or_else(config::max_spill_per_node),
        }
    }

    pub fn dynamic_tuning(&self) -> DynamicTuning {
        DynamicTuning {
            enabled: self
                .dynamic_memory_tuning_enabled
                .unwrap_or_else(config::dynamic_tuning_enabled),
            attempt_threshold: self
                .dynamic_memory_tuning_attempt_threshold
                .unwrap_or_else(config::dynamic_tuning_attempt_threshold),
            fraction: self
                .dynamic_memory_tuning_fraction
                .unwrap_or_else(config::dynamic_tuning_fraction),
        }
    }

    /// Resolve the spill settings, rejecting a revoking target above the threshold.
    pub fn spill_settings(&self) -> ExecResult<SpillSettings> {
        let settings = SpillSettings {
            enabled: self.spill_enabled.unwrap_or_else(config::spill_enabled),
            revoking_threshold: self
                .memory_revoking_threshold
                .unwrap_or_else(config::revoking_threshold),
            revoking_target: self
                .memory_revoking_target
                .unwrap_or_else(config::revoking_target),
        };
        validate_revoking(settings.revoking_threshold, settings.revoking_target)?;
        Ok(settings)
    }

    pub fn diagnostics(&self) -> DiagnosticSettings {
        DiagnosticSettings {
            verbose_exceeded_memory_limit_errors: self
                .verbose_exceeded_memory_limit_errors
                .unwrap_or_else(config::verbose_exceeded_memory_limit_errors),
            heap_dump_on_exceeded_memory_limit: self
                .heap_dump_on_exceeded_memory_limit
                .unwrap_or_else(config::heap_dump_on_exceeded_memory_limit),
            heap_dump_dir: self
                .heap_dump_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(config::heap_dump_dir),
        }
    }

    pub fn sink_max_buffer_size(&self) -> u64 {
        self.sink_max_buffer_size
            .unwrap_or_else(config::sink_max_buffer_size)
    }

    pub fn temp_storage_write_buffer_size(&self) -> usize {
        self.temp_storage_write_buffer_size
            .unwrap_or_else(config::temp_storage_write_buffer_size)
    }

    pub fn output_buffer_type(&self) -> String {
        self.output_buffer_type
            .clone()
            .unwrap_or_else(config::output_buffer_type)
    }
}

pub(crate) fn validate_revoking(threshold: f64, target: f64) -> ExecResult<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ExecutionError::configuration(format!(
            "memory revoking threshold must be within [0, 1], got {}",
            threshold
        )));
    }
    if !(0.0..=1.0).contains(&target) {
        return Err(ExecutionError::configuration(format!(
            "memory revoking target must be within [0, 1], got {}",
            target
        )));
    }
    if target > threshold {
        return Err(ExecutionError::configuration(format!(
            "memory revoking target ({}) must not be greater than memory revoking threshold ({})",
            target, threshold
        )));
    }
    Ok(())
}
