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
//! Temporary storage for spilled and disk-page output.
//!
//! Responsibilities:
//! - Defines the `TempStorage` / `TempDataSink` contract: `create -> write* -> commit`, or
//!   `rollback`, followed by exactly one `close`.
//! - Provides `LocalTempStorage`, which writes files round-robin over local directories and
//!   protects each file with a crc32c checksum recorded in its handle.
//!
//! Key exported interfaces:
//! - Types: `TempStorage`, `TempDataSink`, `TempStorageHandle`, `LocalTempStorage`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::config;
use crate::common::error::{ExecResult, ExecutionError};
use crate::novaexec_logging::{info, warn};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// Location and integrity data of one committed temp file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempStorageHandle {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: u32,
}

impl TempStorageHandle {
    pub fn serialize(&self) -> ExecResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ExecutionError::internal(format!("serialize temp storage handle: {}", e)))
    }

    pub fn deserialize(bytes: &[u8]) -> ExecResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            ExecutionError::internal(format!("deserialize temp storage handle: {}", e))
        })
    }
}

pub trait TempStorage: Send + Sync {
    fn create(&self) -> ExecResult<Box<dyn TempDataSink>>;

    /// Read back a committed file, verifying its checksum.
    fn open(&self, handle: &TempStorageHandle) -> ExecResult<Bytes>;

    fn remove(&self, handle: &TempStorageHandle) -> ExecResult<()>;
}

/// One file being written. `commit` and `rollback` are mutually exclusive; `close` must be
/// called once after either (or on its own to abandon the sink).
pub trait TempDataSink: Send {
    fn write(&mut self, chunks: &[Bytes]) -> ExecResult<()>;

    fn commit(&mut self) -> ExecResult<TempStorageHandle>;

    fn rollback(&mut self) -> ExecResult<()>;

    fn close(&mut self) -> ExecResult<()>;

    fn bytes_written(&self) -> u64;
}

#[derive(Debug)]
pub struct LocalTempStorage {
    dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
}

impl LocalTempStorage {
    pub fn new(dirs: Vec<PathBuf>) -> ExecResult<Self> {
        if dirs.is_empty() {
            return Err(ExecutionError::configuration(
                "spill.local_dirs is empty",
            ));
        }
        for dir in &dirs {
            ensure_dir(dir)?;
        }
        Ok(Self {
            dirs,
            next_dir: AtomicUsize::new(0),
        })
    }

    /// Storage over the directories configured in `[spill] local_dirs`.
    pub fn from_config() -> ExecResult<Self> {
        Self::new(config::temp_storage_dirs())
    }

    fn next_dir(&self) -> &Path {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        &self.dirs[idx % self.dirs.len()]
    }
}

impl TempStorage for LocalTempStorage {
    fn create(&self) -> ExecResult<Box<dyn TempDataSink>> {
        let path = self.next_dir().join(format!(
            "novaexec-{}-{}.tmp",
            std::process::id(),
            NEXT_FILE_ID.fetch_add(1, Ordering::AcqRel)
        ));
        let file = File::create(&path).map_err(|e| {
            ExecutionError::io(format!("create temp file {}", path.display()), &e)
        })?;
        info!("created temp storage file {}", path.display());
        Ok(Box::new(LocalTempDataSink {
            path,
            writer: Some(BufWriter::new(file)),
            checksum: 0,
            written: 0,
            state: SinkState::Open,
        }))
    }

    fn open(&self, handle: &TempStorageHandle) -> ExecResult<Bytes> {
        let data = fs::read(&handle.path).map_err(|e| {
            ExecutionError::io(format!("read temp file {}", handle.path.display()), &e)
        })?;
        if data.len() as u64 != handle.size_bytes {
            return Err(ExecutionError::internal(format!(
                "temp file {} has {} bytes, expected {}",
                handle.path.display(),
                data.len(),
                handle.size_bytes
            )));
        }
        let checksum = crc32c::crc32c(&data);
        if checksum != handle.checksum {
            return Err(ExecutionError::internal(format!(
                "temp file {} checksum mismatch: {:#010x} != {:#010x}",
                handle.path.display(),
                checksum,
                handle.checksum
            )));
        }
        Ok(Bytes::from(data))
    }

    fn remove(&self, handle: &TempStorageHandle) -> ExecResult<()> {
        fs::remove_file(&handle.path).map_err(|e| {
            ExecutionError::io(format!("remove temp file {}", handle.path.display()), &e)
        })?;
        info!("removed temp storage file {}", handle.path.display());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinkState {
    Open,
    Committed,
    RolledBack,
    Closed,
}

struct LocalTempDataSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    checksum: u32,
    written: u64,
    state: SinkState,
}

impl LocalTempDataSink {
    fn writer(&mut self) -> ExecResult<&mut BufWriter<File>> {
        if self.state != SinkState::Open {
            return Err(ExecutionError::internal(format!(
                "temp file {} is {:?}",
                self.path.display(),
                self.state
            )));
        }
        self.writer.as_mut().ok_or_else(|| {
            ExecutionError::internal(format!("temp file {} has no writer", self.path.display()))
        })
    }
}

impl TempDataSink for LocalTempDataSink {
    fn write(&mut self, chunks: &[Bytes]) -> ExecResult<()> {
        let path = self.path.clone();
        let writer = self.writer()?;
        for chunk in chunks {
            writer
                .write_all(chunk)
                .map_err(|e| ExecutionError::io(format!("write temp file {}", path.display()), &e))?;
        }
        for chunk in chunks {
            self.checksum = crc32c::crc32c_append(self.checksum, chunk);
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    fn commit(&mut self) -> ExecResult<TempStorageHandle> {
        let path = self.path.clone();
        let writer = self.writer()?;
        writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(|e| ExecutionError::io(format!("commit temp file {}", path.display()), &e))?;
        self.state = SinkState::Committed;
        Ok(TempStorageHandle {
            path,
            size_bytes: self.written,
            checksum: self.checksum,
        })
    }

    fn rollback(&mut self) -> ExecResult<()> {
        if matches!(self.state, SinkState::Committed | SinkState::Closed) {
            return Err(ExecutionError::internal(format!(
                "cannot roll back temp file {} in state {:?}",
                self.path.display(),
                self.state
            )));
        }
        self.writer = None;
        self.state = SinkState::RolledBack;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecutionError::io(
                format!("roll back temp file {}", self.path.display()),
                &e,
            )),
        }
    }

    fn close(&mut self) -> ExecResult<()> {
        if self.state == SinkState::Closed {
            return Ok(());
        }
        let abandoned = self.state == SinkState::Open;
        self.writer = None;
        self.state = SinkState::Closed;
        if abandoned {
            warn!(
                "temp file {} closed without commit or rollback",
                self.path.display()
            );
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

fn ensure_dir(path: &Path) -> ExecResult<()> {
    if path.as_os_str().is_empty() {
        return Err(ExecutionError::configuration(
            "spill.local_dirs contains empty path",
        ));
    }
    fs::create_dir_all(path).map_err(|e| {
        ExecutionError::io(format!("create temp directory {}", path.display()), &e)
    })
}
