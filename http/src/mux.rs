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

//! Pattern-based request multiplexer for handlers that are not part of the routing trie.

use crate::errors::RestError;
use crate::service::{BoxedHandler, Handler, HandlerFuture, Request};
use axum::response::IntoResponse;
use std::sync::Arc;

/// Dispatches requests to handlers registered under path patterns.
///
/// A pattern that ends in `/` names a subtree: it matches any path that starts with it, as well
/// as the pattern without the trailing slash.  Any other pattern matches its exact path only.
/// When several patterns match, the longest one wins.
#[derive(Clone, Default)]
pub struct ServeMux {
    /// Registered patterns and their handlers.
    entries: Vec<(String, BoxedHandler)>,
}

impl ServeMux {
    /// Registers `handler` to serve `pattern`.
    ///
    /// Panics if `pattern` is already registered, as that indicates a setup bug.
    pub fn handle<H: Handler>(&mut self, pattern: &str, handler: H) {
        let pattern = if pattern.starts_with('/') { pattern.to_owned() } else { format!("/{}", pattern) };
        assert!(
            !self.entries.iter().any(|(existing, _)| *existing == pattern),
            "Handler for pattern {} already registered",
            pattern
        );
        let handler: BoxedHandler = Arc::new(handler);
        self.entries.push((pattern, handler));
    }

    /// Returns the handler that serves `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&BoxedHandler> {
        let mut best: Option<&(String, BoxedHandler)> = None;
        for entry in &self.entries {
            let pattern = entry.0.as_str();
            let matches = if pattern.ends_with('/') {
                path.starts_with(pattern) || path == &pattern[..pattern.len() - 1]
            } else {
                path == pattern
            };
            if matches && best.is_none_or(|best| best.0.len() < pattern.len()) {
                best = Some(entry);
            }
        }
        best.map(|(_, handler)| handler)
    }

    /// Copies all entries of `other` into this mux.
    ///
    /// Panics if both muxes have a handler for the same pattern.
    pub(crate) fn merge(&mut self, other: &ServeMux) {
        for (pattern, handler) in &other.entries {
            assert!(
                !self.entries.iter().any(|(existing, _)| existing == pattern),
                "Handler for pattern {} already registered",
                pattern
            );
            self.entries.push((pattern.clone(), handler.clone()));
        }
    }
}

impl Handler for ServeMux {
    fn call(&self, request: Request) -> HandlerFuture {
        match self.lookup(request.uri().path()) {
            Some(handler) => handler.call(request),
            None => {
                let response = RestError::PathNotFound(request.uri().path().to_owned()).into_response();
                Box::pin(async move { response })
            }
        }
    }
}
