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

//! Path-based router built on a trie of literal and parameterized segments.
//!
//! Routes are registered against path patterns where segments that start with `:` capture
//! parameters.  When a request comes in, the router walks the trie one segment at a time:
//!
//! 1.  A literal child that matches the segment exactly wins over a parameterized child.
//!
//! 1.  A parameterized child records the percent-decoded segment under every name that was used
//!     for it, so `/users/:id` and `/users/:user_id` can coexist and both see the value.
//!
//! 1.  Middleware registered at every traversed node is collected.  The earliest registered
//!     middleware ends up as the outermost wrapper.
//!
//! Once the walk stops, the handler registered for the request method at the final node serves
//! the request, then the default handler of the node (which also handles any path that remains),
//! and then the deepest `ServeMux` that matched along the way with its prefix stripped.  If there
//! is none, the request fails with `path-not-found`.
//!
//! Routers registered under other routers are merged into them instead of being nested, so the
//! trie is always walked from a single root.

use crate::codec::{CodecRegistry, Negotiated};
use crate::errors::RestError;
use crate::mux::ServeMux;
use crate::routing::{RoutingContext, clean_path};
use crate::service::{BoxedHandler, Handler, HandlerFuture, Middleware, Request, Response, call_recovering};
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{Method, Uri};
use log::debug;
use percent_encoding::percent_decode_str;
use restkit_core::context::PathParams;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};

/// Shared reference to a node of the trie.
type NodeRef = Arc<RwLock<Node>>;

/// Child of a node that matches any segment.
#[derive(Clone)]
struct DynamicChild {
    /// Names under which the segment value is recorded, in registration order.
    names: Vec<String>,

    /// The child node.
    node: NodeRef,
}

/// A node of the routing trie.
#[derive(Default)]
struct Node {
    /// Children keyed by the literal segment that leads to them.
    literals: HashMap<String, NodeRef>,

    /// Child that matches any segment not matched by `literals`.
    dynamic: Option<DynamicChild>,

    /// Pattern-based handlers for paths below this node.
    mux: Option<ServeMux>,

    /// Handlers for requests that end at this node, keyed by method.
    methods: HashMap<Method, BoxedHandler>,

    /// Handler for any request that ends at this node or below it without a better match.
    default: Option<BoxedHandler>,

    /// Middleware to apply to requests that traverse this node.
    middlewares: Vec<Middleware>,
}

/// Locks `node` for reading.  Poisoning is ignored because nodes are never left half-updated.
fn read(node: &NodeRef) -> RwLockReadGuard<'_, Node> {
    node.read().unwrap_or_else(PoisonError::into_inner)
}

/// Locks `node` for writing.  Poisoning is ignored because nodes are never left half-updated.
fn write(node: &NodeRef) -> RwLockWriteGuard<'_, Node> {
    node.write().unwrap_or_else(PoisonError::into_inner)
}

/// Merges all routes in `source` into `target`.
///
/// Panics if both nodes define a handler for the same method, a default handler, or a handler
/// for the same mux pattern.
fn merge(target: &NodeRef, source: &NodeRef) {
    if Arc::ptr_eq(target, source) {
        return;
    }

    let (literals, dynamic, mux, methods, default, middlewares) = {
        let source = read(source);
        (
            source.literals.clone(),
            source.dynamic.clone(),
            source.mux.clone(),
            source.methods.clone(),
            source.default.clone(),
            source.middlewares.clone(),
        )
    };

    let mut pending = vec![];
    {
        let mut target = write(target);

        for (segment, child) in literals {
            match target.literals.get(&segment) {
                Some(existing) => pending.push((existing.clone(), child)),
                None => {
                    target.literals.insert(segment, child);
                }
            }
        }

        if let Some(source_dynamic) = dynamic {
            match target.dynamic.as_mut() {
                Some(target_dynamic) => {
                    for name in source_dynamic.names {
                        if !target_dynamic.names.contains(&name) {
                            target_dynamic.names.push(name);
                        }
                    }
                    pending.push((target_dynamic.node.clone(), source_dynamic.node));
                }
                None => target.dynamic = Some(source_dynamic),
            }
        }

        if let Some(mux) = mux {
            target.mux.get_or_insert_with(ServeMux::default).merge(&mux);
        }

        for (method, handler) in methods {
            assert!(!target.methods.contains_key(&method), "Handler for {} already registered", method);
            target.methods.insert(method, handler);
        }

        if let Some(default) = default {
            assert!(target.default.is_none(), "Default handler already registered");
            target.default = Some(default);
        }

        target.middlewares.extend(middlewares);
    }

    for (target, source) in pending {
        merge(&target, &source);
    }
}

/// Percent-decodes a path segment, keeping it verbatim if it does not decode to valid UTF-8.
fn decode_segment(segment: &str) -> String {
    match percent_decode_str(segment).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => segment.to_owned(),
    }
}

/// Replaces the path of `uri` with `path`, keeping its query.
fn replace_path(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_owned(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}

/// Mux handler that matched during a walk, with the state of the walk at its node.
struct Fallback {
    /// The handler.
    handler: BoxedHandler,

    /// Routing state at the node that owns the mux.
    rc: RoutingContext,

    /// Path parameters captured until the node that owns the mux.
    params: PathParams,

    /// Number of middlewares collected until the node that owns the mux.
    middlewares: usize,
}

/// Tree of handlers keyed by path.
///
/// Routers are cheap to clone and all clones share the same routes.  Routes can be added while the
/// router is serving requests.
#[derive(Clone, Default)]
pub struct Router {
    /// Node that corresponds to the root path of this router.
    root: NodeRef,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for `path`, creating any missing nodes along the way.
    fn node_at(&self, path: &str) -> NodeRef {
        let mut node = self.root.clone();
        for segment in clean_path(path).split('/').filter(|s| !s.is_empty()) {
            let next = {
                let mut guard = write(&node);
                match segment.strip_prefix(':') {
                    Some(name) => {
                        let dynamic = guard.dynamic.get_or_insert_with(|| DynamicChild {
                            names: vec![],
                            node: NodeRef::default(),
                        });
                        if !dynamic.names.iter().any(|n| n == name) {
                            dynamic.names.push(name.to_owned());
                        }
                        dynamic.node.clone()
                    }
                    None => guard.literals.entry(segment.to_owned()).or_default().clone(),
                }
            };
            node = next;
        }
        node
    }

    /// Registers `handler` to serve `method` requests for exactly `path`.
    ///
    /// Panics if there already is a handler for the same method and path.
    pub fn on<H: Handler>(&self, method: Method, path: &str, handler: H) -> &Self {
        let node = self.node_at(path);
        let mut node = write(&node);
        assert!(
            !node.methods.contains_key(&method),
            "Handler for {} {} already registered",
            method,
            clean_path(path)
        );
        node.methods.insert(method, Arc::new(handler));
        self
    }

    /// Registers a `CONNECT` handler for `path`.
    pub fn connect<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::CONNECT, path, handler)
    }

    /// Registers a `DELETE` handler for `path`.
    pub fn delete<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::DELETE, path, handler)
    }

    /// Registers a `GET` handler for `path`.
    pub fn get<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::GET, path, handler)
    }

    /// Registers a `HEAD` handler for `path`.
    pub fn head<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::HEAD, path, handler)
    }

    /// Registers an `OPTIONS` handler for `path`.
    pub fn options<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::OPTIONS, path, handler)
    }

    /// Registers a `PATCH` handler for `path`.
    pub fn patch<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::PATCH, path, handler)
    }

    /// Registers a `POST` handler for `path`.
    pub fn post<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::POST, path, handler)
    }

    /// Registers a `PUT` handler for `path`.
    pub fn put<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::PUT, path, handler)
    }

    /// Registers a `TRACE` handler for `path`.
    pub fn trace<H: Handler>(&self, path: &str, handler: H) -> &Self {
        self.on(Method::TRACE, path, handler)
    }

    /// Registers `handler` for `pattern`.
    ///
    /// Routers are merged into the node for `pattern`.  Any other handler is registered in the mux
    /// of this router's root, where `pattern` follows the `ServeMux` matching rules.
    pub fn handle<H: Handler>(&self, pattern: &str, handler: H) -> &Self {
        if let Some(router) = handler.as_router() {
            merge(&self.node_at(pattern), &router.root);
            return self;
        }
        write(&self.root).mux.get_or_insert_with(ServeMux::default).handle(pattern, handler);
        self
    }

    /// Registers `handler` as the default handler for `path` and anything below it.
    ///
    /// Routers are merged into the node for `path` instead.  Panics if `path` already has a
    /// default handler.
    pub fn mount<H: Handler>(&self, path: &str, handler: H) -> &Self {
        let node = self.node_at(path);
        if let Some(router) = handler.as_router() {
            merge(&node, &router.root);
            return self;
        }
        let mut node = write(&node);
        assert!(node.default.is_none(), "Default handler for {} already registered", path);
        node.default = Some(Arc::new(handler));
        self
    }

    /// Registers a RESTful resource under `name`.  Same as `mount`.
    pub fn resource<H: Handler>(&self, name: &str, handler: H) -> &Self {
        self.mount(name, handler)
    }

    /// Returns a view of this router rooted at `path`.
    ///
    /// Routes registered on the view are visible through this router under `path`.
    pub fn sub(&self, path: &str) -> Router {
        Router { root: self.node_at(path) }
    }

    /// Calls `block` with a view of this router rooted at `path`.
    pub fn namespace<F: FnOnce(&Router)>(&self, path: &str, block: F) -> &Self {
        block(&self.sub(path));
        self
    }

    /// Appends `middlewares` to the middleware that applies to all requests that reach this
    /// router's root.
    pub fn use_middleware<M: IntoIterator<Item = Middleware>>(&self, middlewares: M) -> &Self {
        write(&self.root).middlewares.extend(middlewares);
        self
    }

    /// Converts this router into an `axum::Router` so that it can be served with `axum::serve`.
    pub fn into_axum(self) -> axum::Router {
        axum::Router::new().fallback_service(self)
    }

    /// Resolves the handler for `request` and calls it.
    fn route(&self, mut request: Request) -> HandlerFuture {
        let mut rc = RoutingContext::from_request(&request);
        let mut params = PathParams::from_extensions(request.extensions());
        let mut middlewares: Vec<Middleware> = vec![];
        let mut fallback: Option<Fallback> = None;

        let mut node = self.root.clone();
        let selected = loop {
            let guard = read(&node);
            middlewares.extend(guard.middlewares.iter().cloned());
            if let Some(handler) = guard.mux.as_ref().and_then(|mux| mux.lookup(rc.path_left())) {
                fallback = Some(Fallback {
                    handler: handler.clone(),
                    rc: rc.clone(),
                    params: params.clone(),
                    middlewares: middlewares.len(),
                });
            }

            let Some(segment) = rc.peek() else {
                break guard.methods.get(request.method()).or(guard.default.as_ref()).cloned();
            };
            let next = if let Some(child) = guard.literals.get(segment) {
                child.clone()
            } else if let Some(dynamic) = guard.dynamic.as_ref() {
                let value = decode_segment(segment);
                for name in &dynamic.names {
                    params = params.with(name.as_str(), value.as_str());
                }
                dynamic.node.clone()
            } else {
                break guard.default.clone();
            };
            drop(guard);
            rc.shift();
            node = next;
        };

        let handler = match (selected, fallback) {
            (Some(handler), _) => handler,
            (None, Some(fallback)) => {
                if let Some(uri) = replace_path(request.uri(), fallback.rc.path_left()) {
                    *request.uri_mut() = uri;
                }
                rc = fallback.rc;
                params = fallback.params;
                middlewares.truncate(fallback.middlewares);
                fallback.handler
            }
            (None, None) => {
                debug!("No route for {} {}", request.method(), rc.request_uri());
                let negotiated =
                    Negotiated::for_response_to(request.headers(), &CodecRegistry::default());
                let e = RestError::PathNotFound(rc.request_uri().to_owned());
                let response = e.into_negotiated_response(&negotiated, rc.request_uri());
                return Box::pin(async move { response });
            }
        };

        request.extensions_mut().insert(rc);
        request.extensions_mut().insert(params);
        let handler = middlewares.iter().rev().fold(handler, |handler, middleware| middleware(handler));
        handler.call(request)
    }
}

impl Handler for Router {
    fn call(&self, request: Request) -> HandlerFuture {
        call_recovering(|request| self.route(request), request)
    }

    fn as_router(&self) -> Option<&Router> {
        Some(self)
    }
}

impl tower::Service<Request> for Router {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        Box::pin(Handler::call(self, request).map(Ok))
    }
}
