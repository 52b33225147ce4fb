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
//! Conditions a query waits for before it is queued.

use futures::future::BoxFuture;

use crate::common::error::ExecResult;
use crate::common::ids::QueryId;

/// What a prerequisites implementation may inspect about the query.
#[derive(Clone, Debug)]
pub struct PrerequisitesContext {
    pub query: String,
    pub resource_group: Option<String>,
    pub retry: bool,
}

pub trait QueryPrerequisites: Send + Sync {
    /// Resolves once the query may be queued. Dropping the future cancels the wait.
    fn wait_for_prerequisites(
        &self,
        query_id: &QueryId,
        context: &PrerequisitesContext,
    ) -> BoxFuture<'static, ExecResult<()>>;

    /// Called once the query reaches a terminal state.
    fn query_finished(&self, _query_id: &QueryId) {}
}

/// Every query is ready immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPrerequisites;

impl QueryPrerequisites for NoPrerequisites {
    fn wait_for_prerequisites(
        &self,
        _query_id: &QueryId,
        _context: &PrerequisitesContext,
    ) -> BoxFuture<'static, ExecResult<()>> {
        Box::pin(futures::future::ready(Ok(())))
    }
}
