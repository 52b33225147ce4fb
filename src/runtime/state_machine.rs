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
//! Generic forward-only state holder with change listeners.
//!
//! Transitions are atomic with respect to each other. Listener notification is serialized per
//! machine: a thread that changes the state while another thread is already notifying only
//! records the request, and the notifying thread loops until no request is left. Listeners
//! therefore observe states in transition order, may skip intermediate states when
//! transitions race, and always observe the final state.
//!
//! Once a terminal state is reached every further transition is rejected and no listener
//! runs again.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub type StateChangeListener<S> = Arc<dyn Fn(S) + Send + Sync + 'static>;

pub struct StateMachine<S> {
    name: String,
    state: Mutex<S>,
    changed: Condvar,
    is_terminal: fn(&S) -> bool,
    listeners: Mutex<Vec<StateChangeListener<S>>>,
    pending_notifications: AtomicUsize,
    last_notified: Mutex<Option<S>>,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>, initial: S, is_terminal: fn(&S) -> bool) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(initial),
            changed: Condvar::new(),
            is_terminal,
            listeners: Mutex::new(Vec::new()),
            pending_notifications: AtomicUsize::new(0),
            last_notified: Mutex::new(Some(initial)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> S {
        *self.state.lock().expect("state machine lock")
    }

    pub fn is_terminal(&self) -> bool {
        (self.is_terminal)(&self.get())
    }

    /// Move to `new_state` when `predicate(current)` holds. Returns whether the state changed.
    pub fn set_if(&self, new_state: S, predicate: impl Fn(S) -> bool) -> bool {
        let changed = self.update_if(new_state, predicate);
        if changed {
            self.fire_state_changed();
        }
        changed
    }

    pub fn compare_and_set(&self, expected: S, new_state: S) -> bool {
        self.set_if(new_state, |current| current == expected)
    }

    /// Change the state without running listeners; the caller must follow up with
    /// [`StateMachine::fire_state_changed`] once its own bookkeeping is consistent.
    pub(crate) fn update_if(&self, new_state: S, predicate: impl Fn(S) -> bool) -> bool {
        let mut state = self.state.lock().expect("state machine lock");
        if (self.is_terminal)(&state) || *state == new_state || !predicate(*state) {
            return false;
        }
        *state = new_state;
        self.changed.notify_all();
        true
    }

    pub(crate) fn fire_state_changed(&self) {
        if self.pending_notifications.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            let state = self.get();
            let fresh = {
                let mut last = self.last_notified.lock().expect("state machine lock");
                if *last == Some(state) {
                    false
                } else {
                    *last = Some(state);
                    true
                }
            };
            if fresh {
                let listeners = self
                    .listeners
                    .lock()
                    .expect("state machine listeners lock")
                    .clone();
                for listener in listeners {
                    listener(state);
                }
            }
            if self.pending_notifications.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// Register a listener. If the machine is already terminal the listener is invoked
    /// immediately with the final state.
    pub fn add_state_change_listener(&self, listener: StateChangeListener<S>) {
        let terminal = {
            let state = self.state.lock().expect("state machine lock");
            self.listeners
                .lock()
                .expect("state machine listeners lock")
                .push(Arc::clone(&listener));
            (self.is_terminal)(&state).then_some(*state)
        };
        if let Some(state) = terminal {
            listener(state);
        }
    }

    /// Block until the state differs from `current` or `timeout` elapses; returns the
    /// latest state.
    pub fn wait_for_state_change(&self, current: S, timeout: Duration) -> S {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("state machine lock");
        while *state == current {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("state machine condvar wait");
            state = guard;
        }
        *state
    }

    /// Block until the machine reaches a terminal state or `timeout` elapses.
    pub fn wait_until_terminal(&self, timeout: Duration) -> S {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("state machine lock");
        while !(self.is_terminal)(&state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("state machine condvar wait");
            state = guard;
        }
        *state
    }
}
