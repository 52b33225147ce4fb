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
//! At-most-once completion token.
//!
//! A [`Completion`] is settled exactly once with a value, an error or a cancellation; later
//! attempts return `false`. Clones share the same token. [`Completion::non_cancelable`]
//! hands out a view that can wait on the token but ignores cancellation requests, so a
//! consumer cannot settle the token on behalf of the producer.

use std::sync::Arc;

use tokio::sync::watch;

use crate::common::error::{ExecResult, ExecutionError};

#[derive(Clone, Debug)]
enum Outcome<T> {
    Pending,
    Value(T),
    Failed(ExecutionError),
    Canceled,
}

impl<T> Outcome<T> {
    fn is_done(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

pub struct Completion<T> {
    state: Arc<watch::Sender<Outcome<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Outcome::Pending);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn completed(value: T) -> Self {
        let completion = Self::new();
        completion.set(value);
        completion
    }

    pub fn set(&self, value: T) -> bool {
        self.settle(Outcome::Value(value))
    }

    pub fn set_error(&self, error: ExecutionError) -> bool {
        self.settle(Outcome::Failed(error))
    }

    pub fn cancel(&self) -> bool {
        self.settle(Outcome::Canceled)
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().is_done()
    }

    pub fn is_canceled(&self) -> bool {
        matches!(*self.state.borrow(), Outcome::Canceled)
    }

    /// Settled value, if any, without waiting.
    pub fn peek(&self) -> Option<T> {
        match &*self.state.borrow() {
            Outcome::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Wait until the token is settled. A cancellation surfaces as a `USER_CANCELED` error.
    pub async fn wait(&self) -> ExecResult<T> {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(|o| o.is_done()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => Outcome::Canceled,
        };
        match outcome {
            Outcome::Value(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
            Outcome::Canceled | Outcome::Pending => {
                Err(ExecutionError::user_canceled("future was canceled"))
            }
        }
    }

    /// Block the calling thread until the token is settled.
    pub fn wait_blocking(&self) -> ExecResult<T> {
        futures::executor::block_on(self.wait())
    }

    pub fn non_cancelable(&self) -> NonCancelableCompletion<T> {
        NonCancelableCompletion {
            inner: self.clone(),
        }
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_done() {
                return false;
            }
            *current = outcome;
            true
        })
    }
}

/// Read-only view of a [`Completion`]; `cancel` is accepted and ignored.
#[derive(Clone)]
pub struct NonCancelableCompletion<T> {
    inner: Completion<T>,
}

impl<T: Clone + Send + Sync + 'static> NonCancelableCompletion<T> {
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn cancel(&self) -> bool {
        false
    }

    pub async fn wait(&self) -> ExecResult<T> {
        self.inner.wait().await
    }

    pub fn wait_blocking(&self) -> ExecResult<T> {
        self.inner.wait_blocking()
    }
}
