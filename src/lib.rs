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
//! Query dispatch, task execution and memory accounting core of a distributed SQL engine.

pub mod common;
pub mod dispatcher;
pub mod exec;
pub mod runtime;

pub use common::app_config as novaexec_config;
pub use common::logging as novaexec_logging;

pub use common::error::{ErrorCode, ExecResult, ExecutionError};
pub use common::ids::{QueryId, TaskId};
pub use dispatcher::dispatch_query::LocalDispatchQuery;
pub use exec::task_executor_factory::{TaskExecutorFactory, TaskRequest};
