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

//! Core abstractions shared by the RestKit crates.
//!
//! RestKit splits a RESTful service into the same layers every time:
//!
//! 1.  `crud`: The persistence seam.  Resources never talk to a database directly; instead, they
//!     receive an implementation of one or more of the capability traits defined here (`Creator`,
//!     `AllFinder`, `ByIdFinder`, `Updater`, `ByIdDeleter` and `AllDeleter`) and only expose the
//!     operations that the implementation supports.
//!
//! 1.  `context`: The request-scoped state that flows from the HTTP layer into the capabilities.
//!     A `Context` carries path parameters captured by the router, arbitrary typed values and
//!     cancellation signals.
//!
//! 1.  `clocks` and `env`: Ambient facilities to wait for things in a testable way and to read
//!     configuration from the environment.
//!
//! The HTTP machinery (routing, codecs, the resource handler and its client) lives in the sibling
//! `restkit-http` crate so that implementations of the capabilities do not need to pull in any
//! heavy dependencies.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod clocks;
pub mod context;
pub mod crud;
pub mod env;
