// RestKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Request-scoped state shared between the HTTP layer and the CRUD capabilities.
//!
//! A `Context` is immutable: every `with_*` operation returns a new context and leaves the
//! original untouched.  This makes it safe to hand contexts to concurrently-running tasks and is
//! what allows the router to accumulate path parameters as it descends into nested routers without
//! affecting the callers that already captured a context.

use futures::future::{self, BoxFuture};
use http::Extensions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Errors returned by contexts that are no longer valid.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ContextError {
    /// Indicates that the context was explicitly cancelled.
    #[error("context canceled")]
    Canceled,

    /// Indicates that the deadline attached to the context has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Result type for this module.
pub type ContextResult<T> = Result<T, ContextError>;

/// A single node in the persistent list of path parameters.
#[derive(Debug)]
struct PathParam {
    /// Name of the parameter, as declared with a `:name` segment.
    name: String,

    /// Decoded value captured for the parameter.
    value: String,

    /// Parameter that was recorded before this one, if any.
    parent: Option<Arc<PathParam>>,
}

/// Persistent chain of `(name, value)` path parameters.
///
/// Adding a parameter creates a new head that points to the previous chain, so older chains are
/// never mutated.  Lookups walk the chain from the most recent entry, which gives last-write-wins
/// semantics when the same name is recorded more than once.
#[derive(Clone, Debug, Default)]
pub struct PathParams(Option<Arc<PathParam>>);

impl PathParams {
    /// Returns a new chain that extends this one with `name` set to `value`.
    pub fn with<N: Into<String>, V: Into<String>>(&self, name: N, value: V) -> Self {
        Self(Some(Arc::new(PathParam {
            name: name.into(),
            value: value.into(),
            parent: self.0.clone(),
        })))
    }

    /// Returns true if no parameters have been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Gets the most recent value recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let mut current = self.0.as_deref();
        while let Some(param) = current {
            if param.name == name {
                return Some(&param.value);
            }
            current = param.parent.as_deref();
        }
        None
    }

    /// Reifies the chain into a map where later writes shadow earlier ones.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::default();
        let mut current = self.0.as_deref();
        while let Some(param) = current {
            map.entry(param.name.clone()).or_insert_with(|| param.value.clone());
            current = param.parent.as_deref();
        }
        map
    }

    /// Obtains the chain stored in `extensions`, or an empty chain if there is none.
    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<PathParams>().cloned().unwrap_or_default()
    }
}

/// Handle to cancel the context returned by `Context::with_cancel`.
///
/// Dropping the handle does not cancel the context.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Cancels the context tied to this handle and all the contexts derived from it.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Request-scoped values and cancellation signals.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// Typed values attached to the context, including the `PathParams` chain.
    extensions: Extensions,

    /// Cancellation signals of this context and of all of its ancestors.
    signals: Vec<watch::Receiver<bool>>,

    /// Earliest deadline among this context and its ancestors.
    deadline: Option<Instant>,
}

impl Context {
    /// Returns an empty context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Creates a context that exposes the values stored in `extensions`, typically the extensions
    /// of an incoming HTTP request.
    pub fn from_extensions(extensions: Extensions) -> Self {
        Self { extensions, ..Default::default() }
    }

    /// Returns the typed values attached to this context.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Consumes the context and returns its typed values so that they can be attached to an
    /// HTTP request.
    pub fn into_extensions(self) -> Extensions {
        self.extensions
    }

    /// Returns a new context that carries `value`, replacing any previous value of type `T`.
    pub fn with_value<T: Clone + Send + Sync + 'static>(&self, value: T) -> Self {
        let mut child = self.clone();
        child.extensions.insert(value);
        child
    }

    /// Gets the value of type `T` attached to this context, if any.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    /// Returns a new context with the path parameter `name` set to `value`.
    pub fn with_path_param<N: Into<String>, V: Into<String>>(&self, name: N, value: V) -> Self {
        let params = PathParams::from_extensions(&self.extensions).with(name, value);
        self.with_value(params)
    }

    /// Gets the most recent value of the path parameter `name`.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.extensions.get::<PathParams>().and_then(|params| params.get(name))
    }

    /// Returns all path parameters known to this context.
    pub fn path_params(&self) -> HashMap<String, String> {
        self.extensions.get::<PathParams>().map(PathParams::to_map).unwrap_or_default()
    }

    /// Returns a cancellable child context and the handle to cancel it.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut child = self.clone();
        child.signals.push(rx);
        (child, CancelHandle(Arc::new(tx)))
    }

    /// Returns a child context that expires after `timeout` unless a parent expires earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        child
    }

    /// Returns the deadline of this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason why this context is no longer valid, or `None` if it still is.
    pub fn err(&self) -> Option<ContextError> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Waits until this context is cancelled or expires and returns the reason.
    ///
    /// Never completes for contexts without cancellation signals nor deadline.
    pub async fn done(&self) -> ContextError {
        if let Some(e) = self.err() {
            return e;
        }

        let cancelled: BoxFuture<'static, ()> = if self.signals.is_empty() {
            Box::pin(future::pending())
        } else {
            let waits = self
                .signals
                .iter()
                .cloned()
                .map(|mut rx| {
                    Box::pin(async move {
                        loop {
                            if *rx.borrow_and_update() {
                                return;
                            }
                            if rx.changed().await.is_err() {
                                // The handle is gone so this signal can never fire.
                                future::pending::<()>().await;
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            Box::pin(async move {
                future::select_all(waits).await;
            })
        };

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            () = cancelled => ContextError::Canceled,
            () = expired => ContextError::DeadlineExceeded,
        }
    }
}
