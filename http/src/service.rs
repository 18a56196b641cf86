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

//! Handler abstraction shared by routers, resources and plain functions.

use crate::codec::{CodecRegistry, Negotiated};
use crate::errors::RestError;
use crate::router::Router;
use axum::response::IntoResponse;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::error;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tower::ServiceExt;

/// Type of the requests received by handlers.
pub type Request = http::Request<axum::body::Body>;

/// Type of the responses produced by handlers.
pub type Response = axum::response::Response;

/// Future returned by handlers.
pub type HandlerFuture = BoxFuture<'static, Response>;

/// Something that can answer HTTP requests.
pub trait Handler: Send + Sync + 'static {
    /// Processes `request` and returns the future response.
    fn call(&self, request: Request) -> HandlerFuture;

    /// Returns this handler as a `Router` if it is one, so that routers can be merged when
    /// registered under each other.
    fn as_router(&self) -> Option<&Router> {
        None
    }
}

/// Shared, type-erased handler.
pub type BoxedHandler = Arc<dyn Handler>;

/// Function that wraps a handler into another handler.
pub type Middleware = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync>;

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn call(&self, request: Request) -> HandlerFuture {
        (**self).call(request)
    }

    fn as_router(&self) -> Option<&Router> {
        (**self).as_router()
    }
}

impl Handler for axum::Router {
    fn call(&self, request: Request) -> HandlerFuture {
        let router = self.clone();
        Box::pin(async move {
            match router.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            }
        })
    }
}

/// Adapter to use an async function as a `Handler`.
pub struct HandlerFn<F>(F);

/// Creates a handler out of an async function.
pub fn handler_fn<F, Fut, R>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    HandlerFn(f)
}

impl<F, Fut, R> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, request: Request) -> HandlerFuture {
        let fut = (self.0)(request);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// Creates a middleware out of a function that wraps handlers.
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Converts the payload of a panic into the error to report to the caller.
pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> RestError {
    let message = if let Some(e) = payload.downcast_ref::<RestError>() {
        return e.clone();
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic".to_owned()
    };
    RestError::InternalServerError(message)
}

/// Runs `serve` on `request` and turns any panic into an error response.
///
/// The error response is encoded with the codec requested by the client, if known.
pub(crate) fn call_recovering<F>(serve: F, request: Request) -> HandlerFuture
where
    F: FnOnce(Request) -> HandlerFuture,
{
    let instance = request.uri().path().to_owned();
    let negotiated = Negotiated::for_response_to(request.headers(), &CodecRegistry::default());

    let render = move |payload: Box<dyn Any + Send>| {
        let e = panic_to_error(payload);
        error!("Recovered from panic while serving {}: {}", instance, e);
        e.into_negotiated_response(&negotiated, &instance)
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| serve(request))) {
        Ok(fut) => Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(response) => response,
                Err(payload) => render(payload),
            }
        }),
        Err(payload) => {
            let response = render(payload);
            Box::pin(async move { response })
        }
    }
}

/// Handler that recovers from panics in the wrapped handler.
pub struct Recover<H>(H);

/// Wraps `handler` so that panics become error responses instead of dropped connections.
pub fn recover<H: Handler>(handler: H) -> Recover<H> {
    Recover(handler)
}

impl<H: Handler> Handler for Recover<H> {
    fn call(&self, request: Request) -> HandlerFuture {
        call_recovering(|request| self.0.call(request), request)
    }
}
