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

//! Test utilities to exercise handlers without going through the network.

use crate::codec::{Negotiated, decode_list, default_registry};
use crate::errors::ProblemDetails;
use crate::media;
use crate::service::{BoxedHandler, Handler};
use axum::body::Body;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Maximum body size for testing purposes.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Builder for a single request to a handler.
#[must_use]
pub struct OneShotBuilder {
    /// The handler being tested.
    handler: BoxedHandler,

    /// Builder for the request that will be sent to the handler.
    builder: http::request::Builder,
}

impl OneShotBuilder {
    /// Creates a new request against a given `method`/`uri` pair served by `handler`.
    pub fn new<H: Handler, U: AsRef<str>>(handler: H, (method, uri): (http::Method, U)) -> Self {
        let builder = http::Request::builder().method(method).uri(uri.as_ref());
        Self { handler: Arc::new(handler), builder }
    }

    /// Extends the URI in the request with a `query`.
    pub fn with_query<Q: Serialize>(mut self, query: Q) -> Self {
        let uri = self.builder.uri_ref().unwrap().to_string();
        assert!(!uri.contains('?'), "URI already contains a query: {}", uri);
        self.builder =
            self.builder.uri(format!("{}?{}", uri, serde_urlencoded::to_string(query).unwrap()));
        self
    }

    /// Sets the header `name` to `value` in the outgoing request.
    pub fn with_header<K, V>(mut self, name: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.builder = self.builder.header(name, value);
        self
    }

    /// Sets the `Accept` header of the outgoing request to `media_type`.
    pub fn with_accept(self, media_type: &str) -> Self {
        self.with_header(ACCEPT, media_type)
    }

    /// Finishes building the request and sends it with `body` as is.
    async fn send(self, body: Body) -> ResponseChecker {
        let request = self.builder.body(body).unwrap();
        ResponseChecker::from(self.handler.call(request).await)
    }

    /// Finishes building the request and sends it with an empty payload.
    pub async fn send_empty(self) -> ResponseChecker {
        self.send(Body::empty()).await
    }

    /// Finishes building the request and sends it with a payload of type `media_type`.
    pub async fn send_bytes<B: Into<Bytes>>(self, media_type: &str, bytes: B) -> ResponseChecker {
        self.with_header(CONTENT_TYPE, media_type).send(Body::from(bytes.into())).await
    }

    /// Finishes building the request and sends it with a text payload.
    pub async fn send_text<T: Into<String>>(self, text: T) -> ResponseChecker {
        self.with_header(CONTENT_TYPE, mime::TEXT_PLAIN.as_ref()).send(Body::from(text.into())).await
    }

    /// Finishes building the request and sends it with a form encoded in the body as the payload.
    pub async fn send_form<T: Serialize>(self, request: T) -> ResponseChecker {
        let body = serde_urlencoded::to_string(&request).unwrap();
        self.with_header(CONTENT_TYPE, media::FORM).send(Body::from(body)).await
    }

    /// Finishes building the request and sends it with a JSON payload.
    pub async fn send_json<T: Serialize>(self, request: T) -> ResponseChecker {
        let body = serde_json::to_vec(&request).unwrap();
        self.with_header(CONTENT_TYPE, media::JSON).send(Body::from(body)).await
    }
}

/// Type alias for the responses returned by handlers.
type HttpResponse = http::Response<Body>;

/// Validator for the outcome of a request sent by a `OneShotBuilder`.
#[must_use]
pub struct ResponseChecker {
    /// Actual response that we received from the handler.
    response: HttpResponse,

    /// Expected HTTP status code in the response above.
    exp_status: http::StatusCode,
}

impl From<HttpResponse> for ResponseChecker {
    fn from(response: HttpResponse) -> Self {
        Self { response, exp_status: http::StatusCode::OK }
    }
}

impl ResponseChecker {
    /// Sets the expected exit HTTP status to `status`.
    pub fn expect_status(mut self, status: http::StatusCode) -> Self {
        self.exp_status = status;
        self
    }

    /// Expects the header `name` to be present in the response with `value`.
    pub fn expect_header(self, name: &str, value: &str) -> Self {
        let actual = self.response.headers().get(name);
        assert_eq!(
            Some(value),
            actual.map(|v| v.to_str().unwrap()),
            "Unexpected value for header {}",
            name
        );
        self
    }

    /// Expects the canonical `Content-Type` of the response to be `media_type`.
    pub fn expect_content_type(self, media_type: &str) -> Self {
        assert_eq!(Some(media_type.to_owned()), media::content_type(self.response.headers()));
        self
    }

    /// Performs common validation operations on the response.
    pub fn verify(&self) {
        assert_eq!(self.exp_status, self.response.status());
    }

    /// Reads the whole body of the response.
    async fn take_body(self) -> Bytes {
        self.verify();
        axum::body::to_bytes(self.response.into_body(), MAX_BODY_SIZE).await.unwrap()
    }

    /// Finishes checking the response and expects it to contain an empty body.
    pub async fn expect_empty(self) {
        let body = self.take_body().await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.is_empty(), "Body not empty; got {}", body);
    }

    /// Finishes checking the response and expects its body to be a problem document of type
    /// `exp_code`, which is returned for further inspection.
    pub async fn expect_problem(self, exp_code: &str) -> ProblemDetails {
        let media_type = media::content_type(self.response.headers()).unwrap_or_default();
        let status = self.exp_status;
        let body = self.take_body().await;
        let codec = Negotiated::lookup_or_json(&media_type, default_registry()).codec;
        let decoded = codec.unmarshal(&body).map(serde_json::from_value::<ProblemDetails>);
        let problem = match decoded {
            Ok(Ok(problem)) => problem,
            _ => panic!("Invalid problem document {}", String::from_utf8_lossy(&body)),
        };
        assert_eq!(exp_code, problem.r#type.id);
        assert_eq!(status.as_u16(), problem.status);
        problem
    }

    /// Finishes checking the response and expects its body to be a problem document whose
    /// detail matches `exp_re`.
    pub async fn expect_error(self, exp_re: &str) {
        let body = self.take_body().await;
        let problem: ProblemDetails = match serde_json::from_slice(&body) {
            Ok(problem) => problem,
            Err(e) => {
                let body = String::from_utf8(body.to_vec()).unwrap();
                panic!("Invalid error response due to {}; content was {}", e, body);
            }
        };
        let re = regex::Regex::new(exp_re).unwrap();
        assert!(
            re.is_match(&problem.detail),
            "Problem '{:?}' does not match re '{}'",
            problem,
            exp_re
        );
    }

    /// Finishes checking the response and expects it to contain a valid JSON object of type `T`.
    pub async fn expect_json<T: DeserializeOwned>(self) -> T {
        let body = self.take_body().await;
        serde_json::from_slice::<T>(&body).unwrap()
    }

    /// Finishes checking the response and expects it to contain a list of `T` encoded with the
    /// streaming codec for the response's media type.
    pub async fn expect_list<T: DeserializeOwned>(self) -> Vec<T> {
        let media_type = media::content_type(self.response.headers()).unwrap();
        let body = self.take_body().await;
        let codec = default_registry().get(&media_type).unwrap().clone();
        let mut decoder = codec.streaming().unwrap().list_decoder();
        decode_list(decoder.as_mut(), &body)
            .unwrap()
            .into_iter()
            .map(|value| serde_json::from_value(value).unwrap())
            .collect()
    }

    /// Finishes checking the response and expects its body to be valid UTF-8 and to match
    /// `exp_re`.
    pub async fn expect_text(self, exp_re: &str) {
        assert!(!exp_re.is_empty(), "Use expect_empty to validate empty responses");

        let body = self.take_body().await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        let re = regex::Regex::new(exp_re).unwrap();
        assert!(re.is_match(&body), "Body content '{}' does not match re '{}'", body, exp_re);
    }

    /// Finishes checking the response and returns the body of the response as UTF-8.
    pub async fn take_body_as_text(self) -> String {
        let body = self.take_body().await;
        String::from_utf8(body.to_vec()).unwrap()
    }

    /// Finishes checking the response and returns the response itself for out of band
    /// validation of properties not supported by the `ResponseChecker`.
    pub async fn take_response(self) -> HttpResponse {
        self.verify();
        self.response
    }
}
