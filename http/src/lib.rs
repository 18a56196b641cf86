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

//! HTTP toolkit to expose and consume RESTful resources.
//!
//! The pieces in this crate interlock as follows:
//!
//! 1.  The `Router` resolves an incoming path through a trie of literal and `:param` segments,
//!     accumulating path parameters and middleware along the way, and falls back to a `ServeMux`
//!     for prefix-style registrations.
//!
//! 1.  The `RestHandler` serves the collection (`/`) and resource (`/:id`) endpoints of a single
//!     entity type on top of a set of CRUD capabilities, negotiating the codec of every request and
//!     response from the `Content-Type` and `Accept` headers.
//!
//! 1.  The `RestClient` speaks the same wire contract from the other side and decodes streamed
//!     collections lazily.  It sends requests through a `RoundTripper`, which can be wrapped in a
//!     `RetryTransport` to retry transient failures.
//!
//! Errors surface to HTTP callers as RFC 7807 problem documents whose `type` identifies the error
//! with a stable code.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod client;
pub mod codec;
pub mod errors;
pub mod ids;
pub mod mapping;
pub mod media;
pub mod mux;
pub mod resource;
pub mod retry;
pub mod router;
pub mod routing;
pub mod service;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod transport;

pub use client::{ClientError, ClientOptions, ClientResult, RestClient};
pub use errors::{ProblemDetails, ProblemType, RestError, RestResult};
pub use resource::{Operations, RestHandler, RestHandlerOptions};
pub use router::Router;
pub use service::{BoxedHandler, Handler, Middleware, Request, Response, handler_fn};
