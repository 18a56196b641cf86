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

//! Media type names and header parsing helpers.

use http::HeaderMap;
use http::header::{ACCEPT, CONTENT_TYPE};

/// Plain JSON documents and arrays.
pub const JSON: &str = "application/json";

/// RFC 7807 problem documents encoded as JSON.
pub const PROBLEM_JSON: &str = "application/problem+json";

/// Newline-delimited JSON values.
pub const NDJSON: &str = "application/x-ndjson";

/// Alias of `NDJSON` used by some streaming clients.
pub const STREAM_JSON: &str = "application/stream+json";

/// Alias of `NDJSON` used by some streaming clients.
pub const JSON_STREAM: &str = "application/json-stream";

/// HTML form encoding of flat objects.
pub const FORM: &str = "application/x-www-form-urlencoded";

/// Reduces a media type header value to its lowercase essence, dropping any parameters.
///
/// For example, `Application/JSON; charset=utf-8` becomes `application/json`.
pub fn canonical(value: &str) -> String {
    match value.trim().parse::<mime::Mime>() {
        Ok(parsed) => parsed.essence_str().to_ascii_lowercase(),
        Err(_) => {
            let essence = value.split(';').next().unwrap_or_default();
            essence.trim().to_ascii_lowercase()
        }
    }
}

/// Returns the canonical media type in the `Content-Type` header of a message, if any.
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(canonical)
        .filter(|value| !value.is_empty())
}

/// Returns the canonical media types listed in the `Accept` headers of a request, in order.
///
/// Entries are separated by commas or whitespace and any parameters, such as quality factors, are
/// ignored.
pub fn accept_candidates(headers: &HeaderMap) -> Vec<String> {
    let mut candidates = vec![];
    for value in headers.get_all(ACCEPT).iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for entry in value.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let essence = entry.split(';').next().unwrap_or_default();
            for word in essence.split_whitespace() {
                candidates.push(canonical(word));
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_canonical() {
        assert_eq!("application/json", canonical("application/json"));
        assert_eq!("application/json", canonical("Application/JSON; charset=utf-8"));
        assert_eq!("application/x-ndjson", canonical("  application/x-ndjson  "));
        assert_eq!("foo", canonical("foo;bar"));
    }

    #[test]
    fn test_content_type() {
        let mut headers = HeaderMap::new();
        assert_eq!(None, content_type(&headers));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        assert_eq!(Some("text/plain".to_owned()), content_type(&headers));
    }

    #[test]
    fn test_accept_candidates() {
        let mut headers = HeaderMap::new();
        assert!(accept_candidates(&headers).is_empty());

        headers.append(
            ACCEPT,
            HeaderValue::from_static("text/html, application/x-ndjson;q=0.9,application/json"),
        );
        headers.append(ACCEPT, HeaderValue::from_static("application/xml application/foo"));
        assert_eq!(
            vec![
                "text/html",
                "application/x-ndjson",
                "application/json",
                "application/xml",
                "application/foo",
            ],
            accept_candidates(&headers)
        );
    }
}
