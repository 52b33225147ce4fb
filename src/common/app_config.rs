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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaExecConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaExecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaExecConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaExecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static NovaExecConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAEXEC_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novaexec.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVAEXEC_CONFIG or create ./novaexec.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaExecConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novaexec=debug,tokio=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Directory for `novaexec.log`; stderr when unset.
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub spill: SpillConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl NovaExecConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: NovaExecConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("validate config: {}", path.display()))?;
        Ok(cfg)
    }

    /// Filter expression handed to the logging subscriber.
    pub fn effective_log_filter(&self) -> String {
        if let Some(filter) = self.log_filter.as_ref().filter(|f| !f.trim().is_empty()) {
            return filter.clone();
        }
        match self.log_level.as_str() {
            "debug" => "info,novaexec=debug".to_string(),
            "trace" => "info,novaexec=trace".to_string(),
            other => other.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        let spill = &self.spill;
        for (name, value) in [
            ("spill.revoking_threshold", spill.revoking_threshold),
            ("spill.revoking_target", spill.revoking_target),
            (
                "memory.dynamic_tuning_fraction",
                self.memory.dynamic_tuning_fraction,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if spill.revoking_target > spill.revoking_threshold {
            return Err(anyhow!(
                "spill.revoking_target ({}) must not be greater than spill.revoking_threshold ({})",
                spill.revoking_target,
                spill.revoking_threshold
            ));
        }
        Ok(())
    }
}

impl Default for NovaExecConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            log_dir: None,
            memory: MemoryConfig::default(),
            spill: SpillConfig::default(),
            runtime: RuntimeConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_query_max_memory_per_node")]
    pub query_max_memory_per_node: u64,
    #[serde(default = "default_query_max_total_memory_per_node")]
    pub query_max_total_memory_per_node: u64,
    #[serde(default = "default_query_max_revocable_memory_per_node")]
    pub query_max_revocable_memory_per_node: u64,
    #[serde(default = "default_query_max_broadcast_memory")]
    pub query_max_broadcast_memory: u64,
    #[serde(default = "default_node_max_broadcast_memory")]
    pub node_max_broadcast_memory: u64,
    #[serde(default)]
    pub verbose_exceeded_memory_limit_errors: bool,
    #[serde(default)]
    pub heap_dump_on_exceeded_memory_limit: bool,
    #[serde(default = "default_heap_dump_dir")]
    pub heap_dump_dir: String,
    #[serde(default)]
    pub dynamic_tuning_enabled: bool,
    #[serde(default = "default_dynamic_tuning_attempt_threshold")]
    pub dynamic_tuning_attempt_threshold: u32,
    #[serde(default = "default_dynamic_tuning_fraction")]
    pub dynamic_tuning_fraction: f64,
    /// Overrides the detected physical memory used by dynamic tuning.
    #[serde(default)]
    pub available_runtime_memory_override: Option<u64>,
}

fn default_query_max_memory_per_node() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_query_max_total_memory_per_node() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_query_max_revocable_memory_per_node() -> u64 {
    16 * 1024 * 1024 * 1024
}

fn default_query_max_broadcast_memory() -> u64 {
    1024 * 1024 * 1024
}

fn default_node_max_broadcast_memory() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_heap_dump_dir() -> String {
    "log/heap_dump".to_string()
}

fn default_dynamic_tuning_attempt_threshold() -> u32 {
    1
}

fn default_dynamic_tuning_fraction() -> f64 {
    0.6
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            query_max_memory_per_node: default_query_max_memory_per_node(),
            query_max_total_memory_per_node: default_query_max_total_memory_per_node(),
            query_max_revocable_memory_per_node: default_query_max_revocable_memory_per_node(),
            query_max_broadcast_memory: default_query_max_broadcast_memory(),
            node_max_broadcast_memory: default_node_max_broadcast_memory(),
            verbose_exceeded_memory_limit_errors: false,
            heap_dump_on_exceeded_memory_limit: false,
            heap_dump_dir: default_heap_dump_dir(),
            dynamic_tuning_enabled: false,
            dynamic_tuning_attempt_threshold: default_dynamic_tuning_attempt_threshold(),
            dynamic_tuning_fraction: default_dynamic_tuning_fraction(),
            available_runtime_memory_override: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpillConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_revoking_threshold")]
    pub revoking_threshold: f64,
    #[serde(default = "default_revoking_target")]
    pub revoking_target: f64,
    #[serde(default = "default_max_spill_per_node")]
    pub max_spill_per_node: u64,
    #[serde(default)]
    pub local_dirs: Vec<String>,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

fn default_revoking_threshold() -> f64 {
    0.9
}

fn default_revoking_target() -> f64 {
    0.5
}

fn default_max_spill_per_node() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_write_buffer_size() -> usize {
    4 * 1024 * 1024
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            enable: false,
            revoking_threshold: default_revoking_threshold(),
            revoking_target: default_revoking_target(),
            max_spill_per_node: default_max_spill_per_node(),
            local_dirs: Vec::new(),
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

impl SpillConfig {
    /// Directories used by local temporary storage, falling back to the system temp dir.
    pub fn effective_local_dirs(&self) -> Vec<PathBuf> {
        if self.local_dirs.is_empty() {
            return vec![std::env::temp_dir().join("novaexec")];
        }
        self.local_dirs.iter().map(PathBuf::from).collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_query_executor_threads")]
    pub query_executor_threads: usize,
    #[serde(default = "default_task_executor_threads")]
    pub task_executor_threads: usize,
    #[serde(default = "default_task_executor_queue_size")]
    pub task_executor_queue_size: usize,
    #[serde(default = "default_memory_revoking_threads")]
    pub memory_revoking_threads: usize,
    #[serde(default = "default_memory_revoking_queue_size")]
    pub memory_revoking_queue_size: usize,
    #[serde(default = "default_sink_max_buffer_size")]
    pub sink_max_buffer_size: u64,
    #[serde(default = "default_task_time_slice_ms")]
    pub task_time_slice_ms: u64,
    #[serde(default = "default_output_buffer_type")]
    pub output_buffer_type: String,
}

fn default_query_executor_threads() -> usize {
    2
}

fn default_task_executor_threads() -> usize {
    0 // 0 means use CPU cores
}

fn default_task_executor_queue_size() -> usize {
    102_400
}

fn default_memory_revoking_threads() -> usize {
    1
}

fn default_memory_revoking_queue_size() -> usize {
    1024
}

fn default_sink_max_buffer_size() -> u64 {
    32 * 1024 * 1024
}

fn default_task_time_slice_ms() -> u64 {
    1000
}

fn default_output_buffer_type() -> String {
    "PAGE".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            query_executor_threads: default_query_executor_threads(),
            task_executor_threads: default_task_executor_threads(),
            task_executor_queue_size: default_task_executor_queue_size(),
            memory_revoking_threads: default_memory_revoking_threads(),
            memory_revoking_queue_size: default_memory_revoking_queue_size(),
            sink_max_buffer_size: default_sink_max_buffer_size(),
            task_time_slice_ms: default_task_time_slice_ms(),
            output_buffer_type: default_output_buffer_type(),
        }
    }
}

impl RuntimeConfig {
    /// Get the actual number of task executor threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_task_executor_threads(&self) -> usize {
        if self.task_executor_threads > 0 {
            self.task_executor_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default)]
    pub min_coordinator_sidecars: usize,
    #[serde(default = "default_required_workers_max_wait_ms")]
    pub required_workers_max_wait_ms: u64,
}

fn default_min_workers() -> usize {
    1
}

fn default_required_workers_max_wait_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            min_coordinator_sidecars: 0,
            required_workers_max_wait_ms: default_required_workers_max_wait_ms(),
        }
    }
}
