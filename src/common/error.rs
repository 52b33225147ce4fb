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
//! Error taxonomy of the execution core.
//!
//! Every failure that can reach a query or task state machine is an [`ExecutionError`]:
//! a classified [`ErrorCode`], a human readable message, an optional cause chain and the
//! list of suppressed errors collected while cleaning up after the primary failure.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::util::succinct_bytes;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    UserError,
    InternalError,
    InsufficientResources,
    External,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GenericUserError,
    UserCanceled,
    GenericInternalError,
    RemoteTaskError,
    AbandonedTask,
    ConfigurationInvalid,
    GenericInsufficientResources,
    ExceededLocalMemoryLimit,
    ExceededSpillLimit,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::GenericUserError => 0x0000_0000,
            ErrorCode::UserCanceled => 0x0000_0003,
            ErrorCode::GenericInternalError => 0x0001_0000,
            ErrorCode::RemoteTaskError => 0x0001_0006,
            ErrorCode::AbandonedTask => 0x0001_000A,
            ErrorCode::ConfigurationInvalid => 0x0001_0013,
            ErrorCode::GenericInsufficientResources => 0x0002_0000,
            ErrorCode::ExceededLocalMemoryLimit => 0x0002_0007,
            ErrorCode::ExceededSpillLimit => 0x0002_0008,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::GenericUserError => "GENERIC_USER_ERROR",
            ErrorCode::UserCanceled => "USER_CANCELED",
            ErrorCode::GenericInternalError => "GENERIC_INTERNAL_ERROR",
            ErrorCode::RemoteTaskError => "REMOTE_TASK_ERROR",
            ErrorCode::AbandonedTask => "ABANDONED_TASK",
            ErrorCode::ConfigurationInvalid => "CONFIGURATION_INVALID",
            ErrorCode::GenericInsufficientResources => "GENERIC_INSUFFICIENT_RESOURCES",
            ErrorCode::ExceededLocalMemoryLimit => "EXCEEDED_LOCAL_MEMORY_LIMIT",
            ErrorCode::ExceededSpillLimit => "EXCEEDED_SPILL_LIMIT",
        }
    }

    pub fn error_type(self) -> ErrorType {
        match self {
            ErrorCode::GenericUserError | ErrorCode::UserCanceled => ErrorType::UserError,
            ErrorCode::GenericInternalError
            | ErrorCode::RemoteTaskError
            | ErrorCode::AbandonedTask
            | ErrorCode::ConfigurationInvalid => ErrorType::InternalError,
            ErrorCode::GenericInsufficientResources
            | ErrorCode::ExceededLocalMemoryLimit
            | ErrorCode::ExceededSpillLimit => ErrorType::InsufficientResources,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// How an error travels through the task output path.
///
/// `Runtime` and `Interrupted` errors are handed to the consumer unchanged; anything else
/// is wrapped into a generic internal failure that keeps the original as its cause.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    Runtime,
    Interrupted,
    Io,
    Configuration,
}

/// Reservation numbers attached to an exceeded-memory error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryBreakdown {
    pub limit: u64,
    pub reserved: u64,
    pub revocable: u64,
}

#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ExecutionError {
    code: ErrorCode,
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Box<ExecutionError>>,
    suppressed: Vec<ExecutionError>,
    heap_dump_path: Option<PathBuf>,
    memory: Option<MemoryBreakdown>,
}

pub type ExecResult<T> = Result<T, ExecutionError>;

impl ExecutionError {
    pub fn new(code: ErrorCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            cause: None,
            suppressed: Vec::new(),
            heap_dump_path: None,
            memory: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericInternalError, ErrorKind::Runtime, message)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericUserError, ErrorKind::Runtime, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConfigurationInvalid,
            ErrorKind::Configuration,
            message,
        )
    }

    pub fn io(message: impl Into<String>, err: &std::io::Error) -> Self {
        let mut error = Self::new(ErrorCode::GenericInternalError, ErrorKind::Io, message);
        error.cause = Some(Box::new(Self::new(
            ErrorCode::GenericInternalError,
            ErrorKind::Io,
            err.to_string(),
        )));
        error
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericInternalError, ErrorKind::Interrupted, message)
    }

    pub fn user_canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UserCanceled, ErrorKind::Runtime, message)
    }

    pub fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::GenericInsufficientResources,
            ErrorKind::Runtime,
            message,
        )
    }

    pub fn exceeded_local_user_memory_limit(max_user_memory: u64, additional_info: &str) -> Self {
        Self::new(
            ErrorCode::ExceededLocalMemoryLimit,
            ErrorKind::Runtime,
            format!(
                "Query exceeded per-node user memory limit of {} [{}]",
                succinct_bytes(max_user_memory),
                additional_info
            ),
        )
    }

    pub fn exceeded_local_revocable_memory_limit(
        max_revocable_memory: u64,
        additional_info: &str,
    ) -> Self {
        Self::new(
            ErrorCode::ExceededLocalMemoryLimit,
            ErrorKind::Runtime,
            format!(
                "Query exceeded per-node revocable memory limit of {} [{}]",
                succinct_bytes(max_revocable_memory),
                additional_info
            ),
        )
    }

    /// Total (user + revocable) limit violation observed by the pool listener.
    pub fn exceeded_local_total_memory_limit(
        breakdown: MemoryBreakdown,
        additional_info: &str,
        heap_dump_path: Option<PathBuf>,
    ) -> Self {
        let mut message = format!(
            "Query exceeded per-node total memory limit of {} [{}Total reserved memory: {}B, Total revocable memory: {}B]",
            succinct_bytes(breakdown.limit),
            additional_info,
            breakdown.reserved,
            breakdown.revocable
        );
        if let Some(path) = &heap_dump_path {
            message.push_str(&format!(". Heap dump written to {}", path.display()));
        }
        let mut error = Self::new(
            ErrorCode::ExceededLocalMemoryLimit,
            ErrorKind::Runtime,
            message,
        );
        error.heap_dump_path = heap_dump_path;
        error.memory = Some(breakdown);
        error
    }

    pub fn exceeded_spill_limit(max_spill: u64) -> Self {
        Self::new(
            ErrorCode::ExceededSpillLimit,
            ErrorKind::Runtime,
            format!(
                "Query exceeded local spill limit of {}",
                succinct_bytes(max_spill)
            ),
        )
    }

    pub fn with_cause(mut self, cause: ExecutionError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach an error raised while cleaning up after this one.
    pub fn add_suppressed(&mut self, error: ExecutionError) {
        self.suppressed.push(error);
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ExecutionError> {
        self.cause.as_deref()
    }

    pub fn suppressed(&self) -> &[ExecutionError] {
        &self.suppressed
    }

    pub fn heap_dump_path(&self) -> Option<&PathBuf> {
        self.heap_dump_path.as_ref()
    }

    pub fn memory_breakdown(&self) -> Option<MemoryBreakdown> {
        self.memory
    }

    pub fn to_failure_info(&self) -> ExecutionFailureInfo {
        ExecutionFailureInfo::from(self)
    }
}

/// Serializable snapshot of an [`ExecutionError`] reported to the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailureInfo {
    pub error_type: ErrorType,
    pub message: String,
    pub error_code: ErrorCode,
    pub cause: Option<Box<ExecutionFailureInfo>>,
    pub suppressed: Vec<ExecutionFailureInfo>,
    pub heap_dump_path: Option<String>,
}

impl ExecutionFailureInfo {
    pub fn to_error(&self) -> ExecutionError {
        let mut error = ExecutionError::new(self.error_code, ErrorKind::Runtime, &self.message);
        if let Some(cause) = &self.cause {
            error.cause = Some(Box::new(cause.to_error()));
        }
        error.suppressed = self.suppressed.iter().map(|s| s.to_error()).collect();
        error.heap_dump_path = self.heap_dump_path.as_ref().map(PathBuf::from);
        error
    }
}

impl From<&ExecutionError> for ExecutionFailureInfo {
    fn from(error: &ExecutionError) -> Self {
        Self {
            error_type: error.code.error_type(),
            message: error.message.clone(),
            error_code: error.code,
            cause: error.cause.as_ref().map(|c| Box::new(Self::from(c.as_ref()))),
            suppressed: error.suppressed.iter().map(Self::from).collect(),
            heap_dump_path: error
                .heap_dump_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_memory_error_carries_breakdown() {
        let breakdown = MemoryBreakdown {
            limit: 1000,
            reserved: 1200,
            revocable: 0,
        };
        let err = ExecutionError::exceeded_local_total_memory_limit(breakdown, "", None);
        assert_eq!(err.code(), ErrorCode::ExceededLocalMemoryLimit);
        assert_eq!(
            err.code().error_type(),
            ErrorType::InsufficientResources
        );
        assert!(err.message().contains("1000B"), "{}", err);
        assert!(err.message().contains("Total reserved memory: 1200B"), "{}", err);
        assert_eq!(err.memory_breakdown(), Some(breakdown));
    }

    #[test]
    fn test_failure_info_keeps_suppressed_and_cause() {
        let io = std::io::Error::other("disk full");
        let mut err = ExecutionError::io("Unable to dump data to disk", &io);
        err.add_suppressed(ExecutionError::internal("rollback failed"));
        let info = err.to_failure_info();
        assert_eq!(info.error_code, ErrorCode::GenericInternalError);
        assert_eq!(info.suppressed.len(), 1);
        assert_eq!(info.cause.as_ref().unwrap().message, "disk full");

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"errorCode\":\"GENERIC_INTERNAL_ERROR\""));
        let round: ExecutionFailureInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(round.to_error().suppressed().len(), 1);
    }
}
