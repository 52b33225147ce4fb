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
//! Process logging.
//!
//! Events are written one per line in a glog-like layout:
//! `Lmmdd hh:mm:ss.uuuuuu thread file:line] {query_id=.. task_id=..} message`.
//! The braces carry the fields of the enclosing [`query_span`] / [`task_span`], so every
//! line emitted while a driver slice or a dispatch step runs names its query and task.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use tracing::Span;
use tracing_subscriber::fmt::FormattedFields;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::common::app_config::NovaExecConfig;
use crate::common::ids::{QueryId, TaskId};

pub use tracing::{debug, error, info, trace, warn};

const LOG_FILE_NAME: &str = "novaexec.log";

static INIT: OnceLock<()> = OnceLock::new();

/// Span covering work done on behalf of one query.
pub fn query_span(query_id: &QueryId) -> Span {
    tracing::info_span!("query", query_id = %query_id)
}

/// Span covering one driver slice or output step of a task.
pub fn task_span(task_id: &TaskId) -> Span {
    tracing::info_span!("task", task_id = %task_id)
}

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogTarget {
    Stderr,
    File(PathBuf),
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `$NOVAEXEC_LOG_FILE`, then `$NOVAEXEC_LOG_DIR`, then the configured `log_dir`.
fn resolve_target(log_dir: Option<&str>) -> LogTarget {
    if let Some(path) = non_empty_env("NOVAEXEC_LOG_FILE") {
        return LogTarget::File(PathBuf::from(path));
    }
    non_empty_env("NOVAEXEC_LOG_DIR")
        .or_else(|| log_dir.map(str::to_string))
        .map(|dir| LogTarget::File(Path::new(&dir).join(LOG_FILE_NAME)))
        .unwrap_or(LogTarget::Stderr)
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writer and ANSI flag for `target`. A file that cannot be opened falls back to stderr.
fn make_writer(target: &LogTarget) -> (BoxMakeWriter, bool) {
    if let LogTarget::File(path) = target {
        match open_log_file(path) {
            Ok(file) => return (BoxMakeWriter::new(Mutex::new(file)), false),
            // The subscriber is not installed yet.
            Err(err) => eprintln!(
                "failed to open log file {}: {}, fallback to stderr",
                path.display(),
                err
            ),
        }
    }
    (
        BoxMakeWriter::new(std::io::stderr),
        atty::is(atty::Stream::Stderr),
    )
}

struct GlogFormatter;

fn level_char(level: &tracing::Level) -> char {
    match *level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let thread = std::thread::current();
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_char(metadata.level()),
            Local::now().format("%m%d %H:%M:%S%.6f"),
            thread.name().unwrap_or("unnamed"),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0)
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut context = Vec::new();
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>()
                    && !fields.fields.is_empty()
                {
                    context.push(fields.fields.clone());
                }
            }
            if !context.is_empty() {
                write!(writer, "{{{}}} ", context.join(" "))?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn install(filter: &str, log_dir: Option<&str>) {
    INIT.get_or_init(|| {
        let (writer, ansi) = make_writer(&resolve_target(log_dir));
        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(writer)
            .with_ansi(ansi)
            .event_format(GlogFormatter)
            .try_init();
    });
}

/// Install the subscriber with `level` as the filter expression. Only the first call in a
/// process has an effect.
pub fn init_with_level(level: &str) {
    install(level, None);
}

pub fn init() {
    init_with_level("info");
}

/// Install the subscriber using the filter and log directory of a loaded config.
pub fn init_from_config(config: &NovaExecConfig) {
    install(&config.effective_log_filter(), config.log_dir.as_deref());
}
