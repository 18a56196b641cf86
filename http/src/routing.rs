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

//! Tracking of the portion of a request path that remains to be routed.

use http::Request;

/// Normalizes `path` into an absolute path without empty, `.` or `..` segments and without a
/// trailing slash, except for the root path `/`.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = vec![];
    for segment in path.split('/') {
        match segment {
            "" | "." => (),
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Joins a cleaned `base` path with an additional `segment`.
fn join(base: &str, segment: &str) -> String {
    if base == "/" { format!("/{}", segment) } else { format!("{}/{}", base, segment) }
}

/// State of the routing of a request through nested routers and resources.
///
/// The routing context travels in the request extensions so that nested handlers continue
/// consuming the path where their parent left off.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingContext {
    /// Path of the original request, before any routing happened.
    request_uri: String,

    /// Cleaned path that has not been consumed yet.  Always starts with `/`.
    path_left: String,

    /// Cleaned path that has been consumed so far.  Always starts with `/`.
    current: String,
}

impl RoutingContext {
    /// Starts routing the request path `request_uri`.
    pub fn new<S: Into<String>>(request_uri: S) -> Self {
        let request_uri = request_uri.into();
        let path_left = clean_path(&request_uri);
        Self { request_uri, path_left, current: "/".to_owned() }
    }

    /// Returns the routing context of `request`, creating a new one if routing has not started.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        match request.extensions().get::<RoutingContext>() {
            Some(rc) => rc.clone(),
            None => Self::new(request.uri().path()),
        }
    }

    /// Returns the path of the original request.
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// Returns the path that remains to be routed.
    pub fn path_left(&self) -> &str {
        &self.path_left
    }

    /// Returns the path that has been routed so far.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// Returns true if the whole path has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.path_left == "/"
    }

    /// Returns the next segment to be routed without consuming it.
    pub fn peek(&self) -> Option<&str> {
        if self.is_exhausted() {
            return None;
        }
        let rest = &self.path_left[1..];
        Some(rest.split_once('/').map(|(segment, _)| segment).unwrap_or(rest))
    }

    /// Consumes and returns the next segment to be routed, in its raw (still escaped) form.
    pub fn shift(&mut self) -> Option<String> {
        let segment = self.peek()?.to_owned();
        self.current = join(&self.current, &segment);
        self.path_left = match self.path_left[1..].split_once('/') {
            Some((_, rest)) => format!("/{}", rest),
            None => "/".to_owned(),
        };
        Some(segment)
    }
}
