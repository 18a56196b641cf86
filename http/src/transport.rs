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

//! Round-trippers that carry client requests to a server.

use crate::service::{BoxedHandler, Handler};
use async_trait::async_trait;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::stream::{self, BoxStream, StreamExt};
use log::debug;
use restkit_core::context::{Context, ContextError};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};

/// Errors that can occur while carrying a request to a server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection went away before the response was complete.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The context of the request was cancelled or expired.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The request could not be built or sent as is.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Catch-all error for unclassified failures.
    #[error("{0}")]
    Other(String),

    /// The server or the network did not respond in time.
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl TransportError {
    /// Returns true if repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed(_) | TransportError::Timeout(_))
    }
}

/// Result type for this module.
pub type TransportResult<T> = Result<T, TransportError>;

/// Streaming body of a response received through a `RoundTripper`.
pub struct ResponseBody(BoxStream<'static, TransportResult<Bytes>>);

impl ResponseBody {
    /// Creates a body that yields the chunks of `stream`.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = TransportResult<Bytes>> + Send + 'static,
    {
        Self(stream.boxed())
    }

    /// Creates a body without content.
    pub fn empty() -> Self {
        Self(stream::empty().boxed())
    }

    /// Makes the body fail with a context error as soon as `ctx` is done.
    pub fn cancellable(self, ctx: &Context) -> Self {
        let chunks = stream::unfold((self.0, Some(ctx.clone())), |(mut inner, ctx)| async move {
            let ctx = ctx?;
            let next = tokio::select! {
                e = ctx.done() => Err(e),
                chunk = inner.next() => Ok(chunk),
            };
            match next {
                Ok(chunk) => chunk.map(|chunk| (chunk, (inner, Some(ctx)))),
                Err(e) => Some((Err(TransportError::Context(e)), (inner, None))),
            }
        });
        Self(chunks.boxed())
    }

    /// Reads the whole body into memory.
    pub async fn bytes(mut self) -> TransportResult<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.0.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self(stream::once(async move { Ok(bytes) }).boxed())
    }
}

impl Stream for ResponseBody {
    type Item = TransportResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx)
    }
}

/// Request to send through a `RoundTripper`.  Bodies are fully buffered so they can be replayed.
pub type TransportRequest = http::Request<Bytes>;

/// Response received through a `RoundTripper`.
pub type TransportResponse = http::Response<ResponseBody>;

/// Sends a request to a server and returns its response.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    /// Sends `request` and waits for the response headers, giving up when `ctx` is done.
    ///
    /// The body of the response is streamed and is not subject to `ctx` unless made cancellable.
    async fn round_trip(
        &self,
        ctx: &Context,
        request: TransportRequest,
    ) -> TransportResult<TransportResponse>;
}

#[async_trait]
impl<T: RoundTripper + ?Sized> RoundTripper for Arc<T> {
    async fn round_trip(
        &self,
        ctx: &Context,
        request: TransportRequest,
    ) -> TransportResult<TransportResponse> {
        self.as_ref().round_trip(ctx, request).await
    }
}

/// Converts a `reqwest` error into a `TransportError`.
fn reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_body() || e.is_request() {
        TransportError::ConnectionClosed(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Round-tripper that talks to a server over the network.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    /// Client that owns the connection pool.
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport that issues requests through `client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoundTripper for ReqwestTransport {
    async fn round_trip(
        &self,
        ctx: &Context,
        request: TransportRequest,
    ) -> TransportResult<TransportResponse> {
        let (parts, body) = request.into_parts();
        let url = reqwest::Url::parse(&parts.uri.to_string())
            .map_err(|e| TransportError::InvalidRequest(format!("Bad URL {}: {}", parts.uri, e)))?;
        let request = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(body)
            .build()
            .map_err(reqwest_error)?;

        debug!("Sending {} {}", request.method(), request.url());
        let response = tokio::select! {
            e = ctx.done() => return Err(TransportError::Context(e)),
            response = self.client.execute(request) => response.map_err(reqwest_error)?,
        };

        let mut builder = http::Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(response.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let body = ResponseBody::new(response.bytes_stream().map(|chunk| chunk.map_err(reqwest_error)));
        builder.body(body).map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Round-tripper that serves requests in-process with a `Handler`.
///
/// Useful to exercise clients against handlers without going through the network.
#[derive(Clone)]
pub struct HandlerTransport {
    /// Handler that serves all requests.
    handler: BoxedHandler,
}

impl HandlerTransport {
    /// Creates a transport that sends all requests to `handler`.
    pub fn new<H: Handler>(handler: H) -> Self {
        Self { handler: Arc::new(handler) }
    }
}

#[async_trait]
impl RoundTripper for HandlerTransport {
    async fn round_trip(
        &self,
        ctx: &Context,
        request: TransportRequest,
    ) -> TransportResult<TransportResponse> {
        if let Some(e) = ctx.err() {
            return Err(TransportError::Context(e));
        }

        let request = request.map(Body::from);
        let response = tokio::select! {
            e = ctx.done() => return Err(TransportError::Context(e)),
            response = self.handler.call(request) => response,
        };

        let (parts, body) = response.into_parts();
        let chunks = body
            .into_data_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::ConnectionClosed(e.to_string())));
        Ok(http::Response::from_parts(parts, ResponseBody::new(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Request, handler_fn};
    use http::{Method, StatusCode};
    use std::time::Duration;

    fn request(method: Method, uri: &str, body: &'static str) -> TransportRequest {
        http::Request::builder().method(method).uri(uri).body(Bytes::from(body)).unwrap()
    }

    #[test]
    fn test_is_transient() {
        assert!(TransportError::ConnectionClosed("x".to_owned()).is_transient());
        assert!(TransportError::Timeout("x".to_owned()).is_transient());
        assert!(!TransportError::Context(ContextError::Canceled).is_transient());
        assert!(!TransportError::InvalidRequest("x".to_owned()).is_transient());
        assert!(!TransportError::Other("x".to_owned()).is_transient());
    }

    #[tokio::test]
    async fn test_response_body_bytes() {
        let body = ResponseBody::new(stream::iter(vec![
            Ok(Bytes::from("abc")),
            Ok(Bytes::from("")),
            Ok(Bytes::from("def")),
        ]));
        assert_eq!(Bytes::from("abcdef"), body.bytes().await.unwrap());

        let body = ResponseBody::new(stream::iter(vec![
            Ok(Bytes::from("abc")),
            Err(TransportError::ConnectionClosed("reset".to_owned())),
        ]));
        match body.bytes().await {
            Err(TransportError::ConnectionClosed(e)) => assert_eq!("reset", e),
            e => panic!("Unexpected result {:?}", e.map(|_| ())),
        }

        assert!(ResponseBody::empty().bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_response_body_cancellable() {
        let (ctx, handle) = Context::background().with_cancel();
        let mut body = ResponseBody::new(
            stream::iter(vec![Ok(Bytes::from("first"))]).chain(stream::pending()),
        )
        .cancellable(&ctx);

        assert_eq!(Bytes::from("first"), body.next().await.unwrap().unwrap());
        handle.cancel();
        match body.next().await {
            Some(Err(TransportError::Context(ContextError::Canceled))) => (),
            e => panic!("Unexpected chunk {:?}", e.map(|e| e.map(|_| ()))),
        }
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_handler_transport() {
        let transport = HandlerTransport::new(handler_fn(|request: Request| async move {
            let method = request.method().clone();
            let path = request.uri().path().to_owned();
            let body = axum::body::to_bytes(request.into_body(), 1024).await.unwrap();
            (StatusCode::ACCEPTED, format!("{} {} {}", method, path, String::from_utf8_lossy(&body)))
        }));

        let response = transport
            .round_trip(&Context::background(), request(Method::PUT, "http://localhost/a/b", "hello"))
            .await
            .unwrap();
        assert_eq!(StatusCode::ACCEPTED, response.status());
        assert_eq!(Bytes::from("PUT /a/b hello"), response.into_body().bytes().await.unwrap());
    }

    #[tokio::test]
    async fn test_handler_transport_honors_context() {
        let transport = HandlerTransport::new(handler_fn(|_request: Request| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "never"
        }));

        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();
        match transport.round_trip(&ctx, request(Method::GET, "/", "")).await {
            Err(TransportError::Context(ContextError::Canceled)) => (),
            e => panic!("Unexpected result {:?}", e.map(|r| r.status())),
        }

        let ctx = Context::background().with_timeout(Duration::from_millis(1));
        match transport.round_trip(&ctx, request(Method::GET, "/", "")).await {
            Err(TransportError::Context(ContextError::DeadlineExceeded)) => (),
            e => panic!("Unexpected result {:?}", e.map(|r| r.status())),
        }
    }
}
