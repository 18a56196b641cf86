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

//! RESTful resource handler built on top of CRUD operations.
//!
//! A `RestHandler` serves a collection of entities of type `E` identified by values of type `I`.
//! Once mounted under a path, it answers the following requests relative to that path:
//!
//! | Method         | Path     | Operation    | Success status |
//! |----------------|----------|--------------|----------------|
//! | `POST`         | `/`      | Create       | 201            |
//! | `GET`          | `/`      | Index        | 200            |
//! | `DELETE`       | `/`      | Destroy all  | 204            |
//! | `GET`          | `/:id`   | Show         | 200            |
//! | `PUT`, `PATCH` | `/:id`   | Update       | 204            |
//! | `DELETE`       | `/:id`   | Destroy      | 204            |
//! | any            | `/:id/*` | Nested routes | (delegated)   |
//!
//! Operations that are not configured answer with `rest-method-not-allowed`.  `PATCH` has the same
//! replace semantics as `PUT`.

use crate::codec::{Codec, CodecRegistry, ListEncoder, Negotiated};
use crate::errors::{RestError, RestResult};
use crate::ids::{IdAccessor, IdConverter};
use crate::mapping::{IdentityMapping, Mapping, MappingTable};
use crate::routing::RoutingContext;
use crate::service::{
    BoxedHandler, Handler, HandlerFuture, Request, Response, call_recovering, panic_to_error,
};
use axum::body::Body;
use axum::response::IntoResponse;
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, StatusCode};
use log::{debug, error, warn};
use percent_encoding::percent_decode_str;
use restkit_core::context::Context;
use restkit_core::crud::{CrudCapabilities, CrudError, CrudResult, EntityStream};
use restkit_core::env::get_optional_var;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::future::Future;
use std::sync::Arc;

/// Default maximum size of request bodies.
pub const DEFAULT_BODY_READ_LIMIT: usize = 16 * 1024 * 1024;

/// Configuration options for a `RestHandler`.
#[derive(Clone, Debug, PartialEq)]
pub struct RestHandlerOptions {
    /// Maximum number of bytes to accept in request bodies.
    pub body_read_limit: usize,
}

impl Default for RestHandlerOptions {
    fn default() -> Self {
        Self { body_read_limit: DEFAULT_BODY_READ_LIMIT }
    }
}

impl RestHandlerOptions {
    /// Creates a new set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_BODY_READ_LIMIT`.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        let defaults = Self::default();
        Ok(Self {
            body_read_limit: get_optional_var::<usize>(prefix, "BODY_READ_LIMIT")?
                .unwrap_or(defaults.body_read_limit),
        })
    }
}

/// Query parameters of the request being served, available to operations through the context.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestQuery(pub Vec<(String, String)>);

impl RequestQuery {
    /// Returns the query parameters attached to `ctx`, if any.
    pub fn from_context(ctx: &Context) -> Option<&RequestQuery> {
        ctx.get::<RequestQuery>()
    }

    /// Returns the first value of the parameter `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }
}

/// Operation that stores a new entity and returns it as stored.
pub type CreateFn<E> = Arc<dyn Fn(Context, E) -> BoxFuture<'static, CrudResult<E>> + Send + Sync>;

/// Operation that lists all entities.
pub type IndexFn<E> = Arc<dyn Fn(Context) -> EntityStream<E> + Send + Sync>;

/// Operation that looks up an entity by its identifier.
pub type ShowFn<E, I> =
    Arc<dyn Fn(Context, I) -> BoxFuture<'static, CrudResult<Option<E>>> + Send + Sync>;

/// Operation that replaces an existing entity.
pub type UpdateFn<E> = Arc<dyn Fn(Context, E) -> BoxFuture<'static, CrudResult<()>> + Send + Sync>;

/// Operation that deletes an entity by its identifier.
pub type DestroyFn<I> = Arc<dyn Fn(Context, I) -> BoxFuture<'static, CrudResult<()>> + Send + Sync>;

/// Operation that deletes all entities.
pub type DestroyAllFn = Arc<dyn Fn(Context) -> BoxFuture<'static, CrudResult<()>> + Send + Sync>;

/// Hook that prepares the context of collection requests.
pub type CollectionContextFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, RestResult<Context>> + Send + Sync>;

/// Hook that prepares the context of requests for a single resource.
pub type ResourceContextFn<I> =
    Arc<dyn Fn(Context, I) -> BoxFuture<'static, RestResult<Context>> + Send + Sync>;

/// Function that renders errors into responses, replacing the default problem documents.
pub type ErrorHandlerFn = Arc<dyn Fn(RestError, &Negotiated, &str) -> Response + Send + Sync>;

/// Function that records a parsed identifier in the context.
type IdKeyFn<I> = Arc<dyn Fn(&Context, &I) -> Context + Send + Sync>;

/// The set of operations exposed by a resource.  Missing operations are not allowed.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Default(bound = ""))]
pub struct Operations<E, I> {
    /// Serves `POST /`.
    pub create: Option<CreateFn<E>>,

    /// Serves `GET /`.
    pub index: Option<IndexFn<E>>,

    /// Serves `GET /:id` and verifies existence before updates and deletions.
    pub show: Option<ShowFn<E, I>>,

    /// Serves `PUT /:id` and `PATCH /:id`.
    pub update: Option<UpdateFn<E>>,

    /// Serves `DELETE /:id`.
    pub destroy: Option<DestroyFn<I>>,

    /// Serves `DELETE /`.
    pub destroy_all: Option<DestroyAllFn>,
}

impl<E, I> Operations<E, I>
where
    E: Send + 'static,
    I: Send + Sync + 'static,
{
    /// Fills any unset operation with the matching capability of `repo`.
    pub fn with_crud<R: CrudCapabilities<E, I>>(mut self, repo: Arc<R>) -> Self {
        if self.create.is_none() {
            if let Some(creator) = repo.clone().creator() {
                self.create = Some(Arc::new(move |ctx: Context, entity: E| -> BoxFuture<'static, CrudResult<E>> {
                    let creator = creator.clone();
                    Box::pin(async move { creator.create(&ctx, entity).await })
                }));
            }
        }

        if self.index.is_none() {
            if let Some(finder) = repo.clone().all_finder() {
                self.index = Some(Arc::new(move |ctx: Context| finder.find_all(&ctx)));
            }
        }

        if self.show.is_none() {
            if let Some(finder) = repo.clone().by_id_finder() {
                self.show = Some(Arc::new(move |ctx: Context, id: I| -> BoxFuture<'static, CrudResult<Option<E>>> {
                    let finder = finder.clone();
                    Box::pin(async move { finder.find_by_id(&ctx, &id).await })
                }));
            }
        }

        if self.update.is_none() {
            if let Some(updater) = repo.clone().updater() {
                self.update = Some(Arc::new(move |ctx: Context, entity: E| -> BoxFuture<'static, CrudResult<()>> {
                    let updater = updater.clone();
                    Box::pin(async move { updater.update(&ctx, entity).await })
                }));
            }
        }

        if self.destroy.is_none() {
            if let Some(deleter) = repo.clone().by_id_deleter() {
                self.destroy = Some(Arc::new(move |ctx: Context, id: I| -> BoxFuture<'static, CrudResult<()>> {
                    let deleter = deleter.clone();
                    Box::pin(async move { deleter.delete_by_id(&ctx, &id).await })
                }));
            }
        }

        if self.destroy_all.is_none() {
            if let Some(deleter) = repo.all_deleter() {
                self.destroy_all = Some(Arc::new(move |ctx: Context| -> BoxFuture<'static, CrudResult<()>> {
                    let deleter = deleter.clone();
                    Box::pin(async move { deleter.delete_all(&ctx).await })
                }));
            }
        }

        self
    }
}

/// Reads `body` in full unless it exceeds `limit` bytes.
async fn read_body(body: Body, limit: usize) -> RestResult<Bytes> {
    let too_large = || RestError::RequestEntityTooLarge(format!("Body exceeds {} bytes", limit));

    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| RestError::InvalidRequestBody(format!("Cannot read body: {}", e)))?;
        if buffer.len() + chunk.len() > limit {
            return Err(too_large());
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Builds a response with `status` whose body is of type `media_type`.
fn respond(status: StatusCode, media_type: &str, body: Body) -> Response {
    (status, [(CONTENT_TYPE, media_type.to_owned())], body).into_response()
}

/// Maps `entity` into a document and appends it to the list being encoded in `dst`.
fn encode_entity<E>(
    mapping: &dyn Mapping<E>,
    ctx: &Context,
    encoder: &mut dyn ListEncoder,
    entity: E,
    dst: &mut BytesMut,
) -> Result<(), String> {
    let dto = mapping.to_dto(ctx, entity).map_err(|e| e.to_string())?;
    encoder.encode(&dto, dst).map_err(|e| e.to_string())
}

/// State of the body stream of an index response.
struct IndexStream<E> {
    /// Remaining entities to encode.
    entities: EntityStream<E>,

    /// Encoder for the list.
    encoder: Box<dyn ListEncoder>,

    /// Mapping for the response media type.
    mapping: Arc<dyn Mapping<E>>,

    /// Context of the request.
    ctx: Context,

    /// Whether the list has been closed.
    done: bool,
}

impl<E: Send + 'static> IndexStream<E> {
    /// Encodes the next entity, or closes the list if there are no more entities or if fetching
    /// or encoding fails.  Returns `None` once the list has been closed.
    ///
    /// The response status has already been sent by the time this runs, so panics while fetching
    /// or encoding an entity are caught here and truncate the list like any other failure.
    async fn next_chunk(mut self) -> Option<(Result<Bytes, Infallible>, Self)> {
        if self.done {
            return None;
        }

        let mut chunk = BytesMut::new();
        match AssertUnwindSafe(self.entities.next()).catch_unwind().await {
            Ok(Some(Ok(entity))) => {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    encode_entity(
                        self.mapping.as_ref(),
                        &self.ctx,
                        self.encoder.as_mut(),
                        entity,
                        &mut chunk,
                    )
                }));
                match result {
                    Ok(Ok(())) => (),
                    Ok(Err(e)) => {
                        warn!("Aborting list after failing to encode entity: {}", e);
                        self.close(&mut chunk);
                    }
                    Err(payload) => {
                        error!(
                            "Aborting list after panic while encoding entity: {}",
                            panic_to_error(payload)
                        );
                        self.close(&mut chunk);
                    }
                }
            }
            Ok(Some(Err(e))) => {
                warn!("Aborting list after failing to fetch entity: {}", e);
                self.close(&mut chunk);
            }
            Ok(None) => self.close(&mut chunk),
            Err(payload) => {
                error!(
                    "Aborting list after panic while fetching entity: {}",
                    panic_to_error(payload)
                );
                self.close(&mut chunk);
            }
        }
        Some((Ok(chunk.freeze()), self))
    }

    /// Emits the closing framing of the list and releases the entities stream.
    fn close(&mut self, dst: &mut BytesMut) {
        self.encoder.close(dst);
        self.entities = stream::empty().boxed();
        self.done = true;
    }
}

/// Handler for a RESTful resource over entities of type `E` identified by `I`.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct RestHandler<E, I> {
    /// Operations exposed by the resource.
    ops: Operations<E, I>,

    /// Entity to document mappings.
    mappings: MappingTable<E>,

    /// Codecs that take precedence over the default registry.
    codecs: Arc<CodecRegistry>,

    /// Converter between identifiers and path segments.
    ids: IdConverter<I>,

    /// Accessor to assign identifiers to entities received for updates.
    id_accessor: IdAccessor<E, I>,

    /// Records parsed identifiers in the context, if configured.
    id_key: Option<IdKeyFn<I>>,

    /// Name of the path parameter under which to record identifiers, if any.
    id_path_param: Option<String>,

    /// Hook to prepare the context of collection requests.
    collection_context: Option<CollectionContextFn>,

    /// Hook to prepare the context of resource requests.
    resource_context: Option<ResourceContextFn<I>>,

    /// Handler for paths below a resource, such as `/:id/children`.
    resource_routes: Option<BoxedHandler>,

    /// Maximum number of bytes to accept in request bodies.
    body_read_limit: usize,

    /// Custom renderer for errors.
    error_handler: Option<ErrorHandlerFn>,
}

impl<E, I> RestHandler<E, I>
where
    E: Serialize + DeserializeOwned + Send + 'static,
    I: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a handler without operations whose documents are the serde representation of the
    /// entities and whose identifiers live in the `id` field.
    pub fn new() -> Self {
        Self::with_mapping(IdentityMapping, IdAccessor::by_field("id"))
    }
}

impl<E, I> Default for RestHandler<E, I>
where
    E: Serialize + DeserializeOwned + Send + 'static,
    I: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, I> RestHandler<E, I>
where
    E: Send + 'static,
    I: Clone + Send + Sync + 'static,
{
    /// Creates a handler without operations that uses `mapping` for all media types and
    /// `id_accessor` to assign identifiers to entities.
    pub fn with_mapping<M: Mapping<E> + 'static>(mapping: M, id_accessor: IdAccessor<E, I>) -> Self {
        Self {
            ops: Operations::default(),
            mappings: MappingTable::new(Arc::new(mapping)),
            codecs: Arc::new(CodecRegistry::default()),
            ids: IdConverter::default(),
            id_accessor,
            id_key: None,
            id_path_param: None,
            collection_context: None,
            resource_context: None,
            resource_routes: None,
            body_read_limit: DEFAULT_BODY_READ_LIMIT,
            error_handler: None,
        }
    }

    /// Replaces all operations with `ops`.
    pub fn with_operations(mut self, ops: Operations<E, I>) -> Self {
        self.ops = ops;
        self
    }

    /// Fills any unset operation with the matching capability of `repo`.
    pub fn with_crud<R: CrudCapabilities<E, I>>(mut self, repo: Arc<R>) -> Self {
        self.ops = self.ops.with_crud(repo);
        self
    }

    /// Sets the create operation.
    pub fn with_create<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CrudResult<E>> + Send + 'static,
    {
        self.ops.create = Some(Arc::new(move |ctx: Context, entity: E| -> BoxFuture<'static, CrudResult<E>> {
            Box::pin(f(ctx, entity))
        }));
        self
    }

    /// Sets the index operation.
    pub fn with_index<F>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> EntityStream<E> + Send + Sync + 'static,
    {
        self.ops.index = Some(Arc::new(f));
        self
    }

    /// Sets the show operation.
    pub fn with_show<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CrudResult<Option<E>>> + Send + 'static,
    {
        self.ops.show = Some(Arc::new(move |ctx: Context, id: I| -> BoxFuture<'static, CrudResult<Option<E>>> {
            Box::pin(f(ctx, id))
        }));
        self
    }

    /// Sets the update operation.
    pub fn with_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CrudResult<()>> + Send + 'static,
    {
        self.ops.update = Some(Arc::new(move |ctx: Context, entity: E| -> BoxFuture<'static, CrudResult<()>> {
            Box::pin(f(ctx, entity))
        }));
        self
    }

    /// Sets the destroy operation.
    pub fn with_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CrudResult<()>> + Send + 'static,
    {
        self.ops.destroy = Some(Arc::new(move |ctx: Context, id: I| -> BoxFuture<'static, CrudResult<()>> {
            Box::pin(f(ctx, id))
        }));
        self
    }

    /// Sets the destroy-all operation.
    pub fn with_destroy_all<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CrudResult<()>> + Send + 'static,
    {
        self.ops.destroy_all = Some(Arc::new(move |ctx: Context| -> BoxFuture<'static, CrudResult<()>> {
            Box::pin(f(ctx))
        }));
        self
    }

    /// Registers `codec` for `media_type` in this handler only, taking precedence over the
    /// default registry.
    pub fn with_codec(mut self, media_type: &str, codec: Arc<dyn Codec>) -> Self {
        Arc::make_mut(&mut self.codecs).register(media_type, codec);
        self
    }

    /// Uses `mapping` for documents of type `media_type`.
    pub fn with_media_mapping<M: Mapping<E> + 'static>(mut self, media_type: &str, mapping: M) -> Self {
        self.mappings.insert(media_type, Arc::new(mapping));
        self
    }

    /// Sets the converter between identifiers and path segments.
    pub fn with_id_converter(mut self, ids: IdConverter<I>) -> Self {
        self.ids = ids;
        self
    }

    /// Records the identifier of every resource request in the context as the value returned by
    /// `wrap`, which operations can later retrieve with `Context::get`.
    pub fn with_id_key<K, F>(mut self, wrap: F) -> Self
    where
        K: Clone + Send + Sync + 'static,
        F: Fn(I) -> K + Send + Sync + 'static,
    {
        self.id_key = Some(Arc::new(move |ctx: &Context, id: &I| ctx.with_value(wrap(id.clone()))));
        self
    }

    /// Records the decoded identifier segment of every resource request as the path parameter
    /// `name`, which makes it available to nested routes and clients.
    pub fn with_id_path_param<S: Into<String>>(mut self, name: S) -> Self {
        self.id_path_param = Some(name.into());
        self
    }

    /// Sets the hook that prepares the context of collection requests.
    pub fn with_collection_context<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RestResult<Context>> + Send + 'static,
    {
        self.collection_context = Some(Arc::new(move |ctx: Context| -> BoxFuture<'static, RestResult<Context>> {
            Box::pin(f(ctx))
        }));
        self
    }

    /// Sets the hook that prepares the context of resource requests.
    pub fn with_resource_context<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RestResult<Context>> + Send + 'static,
    {
        self.resource_context = Some(Arc::new(move |ctx: Context, id: I| -> BoxFuture<'static, RestResult<Context>> {
            Box::pin(f(ctx, id))
        }));
        self
    }

    /// Delegates requests for paths below a resource to `handler`.
    pub fn with_resource_routes<H: Handler>(mut self, handler: H) -> Self {
        self.resource_routes = Some(Arc::new(handler));
        self
    }

    /// Applies the configuration in `opts`.
    pub fn with_options(mut self, opts: RestHandlerOptions) -> Self {
        self.body_read_limit = opts.body_read_limit;
        self
    }

    /// Sets the maximum number of bytes to accept in request bodies.
    pub fn with_body_read_limit(mut self, limit: usize) -> Self {
        self.body_read_limit = limit;
        self
    }

    /// Replaces the default rendering of errors as problem documents.
    pub fn with_error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(RestError, &Negotiated, &str) -> Response + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(f));
        self
    }

    /// Converts a persistence error into the error to report to the caller.
    fn crud_error(&self, e: CrudError) -> RestError {
        if let CrudError::BackendError(ref message) = e {
            error!("Backend error: {}", message);
        }
        RestError::from(e)
    }

    /// Serves `request`, rendering any failure as an error response.
    async fn serve(self, request: Request) -> Response {
        let request_codec = Negotiated::for_request(request.headers(), &self.codecs);
        let response_codec = Negotiated::for_response(request.headers(), &self.codecs, &request_codec);
        let instance = request.uri().path().to_owned();

        match self.dispatch(request, &request_codec, &response_codec).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request for {} failed: {}", instance, e);
                match self.error_handler.as_ref() {
                    Some(handler) => handler(e, &response_codec, &instance),
                    None => e.into_negotiated_response(&response_codec, &instance),
                }
            }
        }
    }

    /// Routes `request` to the collection or resource operations.
    async fn dispatch(
        &self,
        mut request: Request,
        request_codec: &Negotiated,
        response_codec: &Negotiated,
    ) -> RestResult<Response> {
        let mut rc = RoutingContext::from_request(&request);
        let query = request
            .uri()
            .query()
            .and_then(|query| serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok())
            .unwrap_or_default();
        let mut ctx =
            Context::from_extensions(request.extensions().clone()).with_value(RequestQuery(query));

        let Some(raw_id) = rc.shift() else {
            if let Some(hook) = self.collection_context.as_ref() {
                ctx = hook(ctx).await?;
            }
            return match *request.method() {
                Method::POST => self.create(ctx, request, request_codec, response_codec).await,
                Method::GET => self.index(ctx, response_codec).await,
                Method::DELETE => self.destroy_all(ctx, response_codec).await,
                _ => Err(not_allowed(&request)),
            };
        };

        let decoded = percent_decode_str(&raw_id).decode_utf8().map(|id| id.into_owned());
        let raw_id = decoded.unwrap_or(raw_id);
        let id = self.ids.parse(&raw_id).map_err(|e| RestError::MalformedIdInPath(e.to_string()))?;
        if let Some(name) = self.id_path_param.as_ref() {
            ctx = ctx.with_path_param(name.as_str(), raw_id.as_str());
        }
        if let Some(id_key) = self.id_key.as_ref() {
            ctx = id_key(&ctx, &id);
        }
        if let Some(hook) = self.resource_context.as_ref() {
            ctx = hook(ctx, id.clone()).await?;
        }

        if !rc.is_exhausted() {
            let Some(routes) = self.resource_routes.as_ref() else {
                return Err(RestError::PathNotFound(rc.request_uri().to_owned()));
            };
            let mut extensions = ctx.into_extensions();
            extensions.insert(rc);
            *request.extensions_mut() = extensions;
            return Ok(routes.call(request).await);
        }

        match *request.method() {
            Method::GET => self.show(ctx, id, response_codec).await,
            Method::PUT | Method::PATCH => self.update(ctx, id, request, request_codec, response_codec).await,
            Method::DELETE => self.destroy(ctx, id, response_codec).await,
            _ => Err(not_allowed(&request)),
        }
    }

    /// Reads the body of `request` and decodes it into a document.
    async fn read_dto(&self, request: Request, negotiated: &Negotiated) -> RestResult<serde_json::Value> {
        let declared = request
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared.is_some_and(|length| length > self.body_read_limit) {
            return Err(RestError::RequestEntityTooLarge(format!(
                "Body exceeds {} bytes",
                self.body_read_limit
            )));
        }

        let body = read_body(request.into_body(), self.body_read_limit).await?;
        negotiated.codec.unmarshal(&body).map_err(|e| RestError::InvalidRequestBody(e.to_string()))
    }

    /// Converts a received document into an entity.
    fn from_dto(&self, ctx: &Context, dto: serde_json::Value, negotiated: &Negotiated) -> RestResult<E> {
        self.mappings
            .get(&negotiated.media_type)
            .from_dto(ctx, dto)
            .map_err(|e| RestError::InvalidRequestBody(e.to_string()))
    }

    /// Builds a response with `status` that carries `entity`.
    fn respond_entity(
        &self,
        ctx: &Context,
        status: StatusCode,
        entity: E,
        negotiated: &Negotiated,
    ) -> RestResult<Response> {
        let dto = self
            .mappings
            .get(&negotiated.media_type)
            .to_dto(ctx, entity)
            .map_err(|e| RestError::InternalServerError(e.to_string()))?;
        let body = negotiated
            .codec
            .marshal(&dto)
            .map_err(|e| RestError::InternalServerError(e.to_string()))?;
        Ok(respond(status, &negotiated.media_type, Body::from(body)))
    }

    /// Fails with `EntityNotFound` if the resource `id` does not exist and existence can be checked.
    async fn check_exists(&self, ctx: &Context, id: &I) -> RestResult<()> {
        if let Some(show) = self.ops.show.as_ref() {
            if show(ctx.clone(), id.clone()).await.map_err(|e| self.crud_error(e))?.is_none() {
                return Err(RestError::EntityNotFound(self.describe_id(id)));
            }
        }
        Ok(())
    }

    /// Formats `id` for error messages.
    fn describe_id(&self, id: &I) -> String {
        self.ids.format(id).unwrap_or_default()
    }

    /// Serves `POST /`.
    async fn create(
        &self,
        ctx: Context,
        request: Request,
        request_codec: &Negotiated,
        response_codec: &Negotiated,
    ) -> RestResult<Response> {
        let Some(create) = self.ops.create.as_ref() else {
            return Err(not_allowed(&request));
        };

        let dto = self.read_dto(request, request_codec).await?;
        let entity = self.from_dto(&ctx, dto, request_codec)?;
        let created = create(ctx.clone(), entity).await.map_err(|e| self.crud_error(e))?;
        self.respond_entity(&ctx, StatusCode::CREATED, created, response_codec)
    }

    /// Serves `GET /` by streaming the entities as they are produced.
    async fn index(&self, ctx: Context, negotiated: &Negotiated) -> RestResult<Response> {
        let Some(index) = self.ops.index.as_ref() else {
            return Err(RestError::MethodNotAllowed("GET".to_owned()));
        };
        let mut encoder = match negotiated.codec.streaming() {
            Some(streaming) => streaming.list_encoder(),
            None => {
                return Err(RestError::NotAcceptable(format!(
                    "Cannot encode lists as {}",
                    negotiated.media_type
                )));
            }
        };
        let mapping = self.mappings.get(&negotiated.media_type).clone();

        let mut entities = index(ctx.clone());
        let mut head = BytesMut::new();
        match entities.next().await {
            None => {
                encoder.close(&mut head);
                return Ok(respond(StatusCode::OK, &negotiated.media_type, Body::from(head.freeze())));
            }
            Some(Err(e)) => {
                error!("Cannot fetch first entity: {}", e);
                return Err(RestError::InternalServerError(e.to_string()));
            }
            Some(Ok(entity)) => {
                encode_entity(mapping.as_ref(), &ctx, encoder.as_mut(), entity, &mut head)
                    .map_err(RestError::InternalServerError)?;
            }
        }

        let rest = IndexStream { entities, encoder, mapping, ctx, done: false };
        let body = stream::once(future::ready(Ok::<_, Infallible>(head.freeze())))
            .chain(stream::unfold(rest, IndexStream::next_chunk));
        Ok(respond(StatusCode::OK, &negotiated.media_type, Body::from_stream(body)))
    }

    /// Serves `DELETE /`.
    async fn destroy_all(&self, ctx: Context, negotiated: &Negotiated) -> RestResult<Response> {
        let Some(destroy_all) = self.ops.destroy_all.as_ref() else {
            return Err(RestError::MethodNotAllowed("DELETE".to_owned()));
        };
        destroy_all(ctx).await.map_err(|e| self.crud_error(e))?;
        Ok(respond(StatusCode::NO_CONTENT, &negotiated.media_type, Body::empty()))
    }

    /// Serves `GET /:id`.
    async fn show(&self, ctx: Context, id: I, negotiated: &Negotiated) -> RestResult<Response> {
        let Some(show) = self.ops.show.as_ref() else {
            return Err(RestError::MethodNotAllowed("GET".to_owned()));
        };
        let description = self.describe_id(&id);
        match show(ctx.clone(), id).await.map_err(|e| self.crud_error(e))? {
            Some(entity) => self.respond_entity(&ctx, StatusCode::OK, entity, negotiated),
            None => Err(RestError::EntityNotFound(description)),
        }
    }

    /// Serves `PUT /:id` and `PATCH /:id`.
    async fn update(
        &self,
        ctx: Context,
        id: I,
        request: Request,
        request_codec: &Negotiated,
        response_codec: &Negotiated,
    ) -> RestResult<Response> {
        let Some(update) = self.ops.update.as_ref() else {
            return Err(not_allowed(&request));
        };

        let dto = self.read_dto(request, request_codec).await?;
        self.check_exists(&ctx, &id).await?;
        let mut entity = self.from_dto(&ctx, dto, request_codec)?;
        let description = self.describe_id(&id);
        self.id_accessor
            .set(&mut entity, id)
            .map_err(|e| RestError::InternalServerError(format!("Cannot set ID: {}", e)))?;
        update(ctx, entity).await.map_err(|e| match e {
            CrudError::NotFound(_) => RestError::EntityNotFound(description),
            e => self.crud_error(e),
        })?;
        Ok(respond(StatusCode::NO_CONTENT, &response_codec.media_type, Body::empty()))
    }

    /// Serves `DELETE /:id`.
    async fn destroy(&self, ctx: Context, id: I, negotiated: &Negotiated) -> RestResult<Response> {
        let Some(destroy) = self.ops.destroy.as_ref() else {
            return Err(RestError::MethodNotAllowed("DELETE".to_owned()));
        };

        self.check_exists(&ctx, &id).await?;
        let description = self.describe_id(&id);
        destroy(ctx, id).await.map_err(|e| match e {
            CrudError::NotFound(_) => RestError::EntityNotFound(description),
            e => self.crud_error(e),
        })?;
        Ok(respond(StatusCode::NO_CONTENT, &negotiated.media_type, Body::empty()))
    }
}

/// Builds the error for a request whose method is not supported.
fn not_allowed(request: &Request) -> RestError {
    RestError::MethodNotAllowed(request.method().to_string())
}

impl<E, I> Handler for RestHandler<E, I>
where
    E: Send + 'static,
    I: Clone + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        let handler = self.clone();
        call_recovering(move |request| Box::pin(handler.serve(request)), request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DtoMapping;
    use crate::media;
    use crate::router::Router;
    use crate::service::handler_fn;
    use crate::testutils::*;
    use http::header::CONTENT_LENGTH;
    use restkit_core::context::PathParams;
    use restkit_core::crud::Creator;
    use restkit_core::crud::testutils::{Identifiable, MemoryRepository};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Foo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        foo: String,
        bar: String,
        baz: String,
    }

    impl Identifiable<String> for Foo {
        fn id(&self) -> Option<String> {
            self.id.clone()
        }

        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Note {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        text: String,
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Counter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        name: String,
        count: i64,
        enabled: bool,
    }

    impl Identifiable<i64> for Counter {
        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Label {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        label: String,
    }

    fn foo(id: Option<&str>, foo: &str) -> Foo {
        Foo { id: id.map(str::to_owned), foo: foo.to_owned(), bar: "b".to_owned(), baz: "z".to_owned() }
    }

    fn new_repo() -> Arc<MemoryRepository<Foo, String>> {
        Arc::new(MemoryRepository::new(|n| format!("foo-{}", n)))
    }

    async fn new_repo_with(names: &[&str]) -> Arc<MemoryRepository<Foo, String>> {
        let repo = new_repo();
        for name in names {
            repo.create(&Context::background(), foo(None, name)).await.unwrap();
        }
        repo
    }

    fn new_handler(repo: Arc<MemoryRepository<Foo, String>>) -> RestHandler<Foo, String> {
        RestHandler::new().with_crud(repo)
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let handler = new_handler(new_repo());

        let created: Foo = OneShotBuilder::new(handler.clone(), (Method::POST, "/"))
            .send_json(json!({"foo": "f", "bar": "b", "baz": "z"}))
            .await
            .expect_status(StatusCode::CREATED)
            .expect_content_type(media::JSON)
            .expect_json()
            .await;
        assert_eq!(foo(Some("foo-1"), "f"), created);

        let shown: Foo = OneShotBuilder::new(handler.clone(), (Method::GET, "/foo-1"))
            .send_empty()
            .await
            .expect_json()
            .await;
        assert_eq!(created, shown);

        OneShotBuilder::new(handler.clone(), (Method::PUT, "/foo-1"))
            .send_json(json!({"id": "foo-1", "foo": "f2", "bar": "b", "baz": "z"}))
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_content_type(media::JSON)
            .expect_empty()
            .await;

        let shown: Foo = OneShotBuilder::new(handler.clone(), (Method::GET, "/foo-1"))
            .send_empty()
            .await
            .expect_json()
            .await;
        assert_eq!(foo(Some("foo-1"), "f2"), shown);

        OneShotBuilder::new(handler.clone(), (Method::DELETE, "/foo-1"))
            .send_empty()
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_empty()
            .await;

        let problem = OneShotBuilder::new(handler.clone(), (Method::GET, "/foo-1"))
            .send_empty()
            .await
            .expect_status(StatusCode::NOT_FOUND)
            .expect_content_type(media::PROBLEM_JSON)
            .expect_problem("entity-not-found")
            .await;
        assert_eq!("/foo-1", problem.instance);
    }

    #[tokio::test]
    async fn test_destroy_twice() {
        let handler = new_handler(new_repo_with(&["a"]).await);

        OneShotBuilder::new(handler.clone(), (Method::DELETE, "/foo-1"))
            .send_empty()
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_empty()
            .await;

        OneShotBuilder::new(handler, (Method::DELETE, "/foo-1"))
            .send_empty()
            .await
            .expect_status(StatusCode::NOT_FOUND)
            .expect_problem("entity-not-found")
            .await;
    }

    #[tokio::test]
    async fn test_destroy_all() {
        let repo = new_repo_with(&["a", "b"]).await;
        let handler = new_handler(repo.clone());

        OneShotBuilder::new(handler, (Method::DELETE, "/"))
            .send_empty()
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_empty()
            .await;

        assert!(repo.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_already_exists() {
        let handler = new_handler(new_repo_with(&["a"]).await);

        OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_json(foo(Some("foo-1"), "other"))
            .await
            .expect_status(StatusCode::CONFLICT)
            .expect_problem("entity-already-exists")
            .await;
    }

    #[tokio::test]
    async fn test_create_invalid_bodies() {
        let handler = new_handler(new_repo());

        OneShotBuilder::new(handler.clone(), (Method::POST, "/"))
            .send_text("this is not json")
            .await
            .expect_status(StatusCode::BAD_REQUEST)
            .expect_problem("invalid-request-body")
            .await;

        OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_json(json!({"foo": 3}))
            .await
            .expect_status(StatusCode::BAD_REQUEST)
            .expect_problem("invalid-request-body")
            .await;
    }

    #[tokio::test]
    async fn test_create_with_form() {
        let handler = new_handler(new_repo());

        let body = OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_form([("foo", "f"), ("bar", "b"), ("baz", "z")])
            .await
            .expect_status(StatusCode::CREATED)
            .expect_content_type(media::FORM)
            .take_body_as_text()
            .await;
        let mut fields = serde_urlencoded::from_str::<Vec<(String, String)>>(&body).unwrap();
        fields.sort();
        assert_eq!(
            vec![
                ("bar".to_owned(), "b".to_owned()),
                ("baz".to_owned(), "z".to_owned()),
                ("foo".to_owned(), "f".to_owned()),
                ("id".to_owned(), "foo-1".to_owned()),
            ],
            fields
        );
    }

    #[tokio::test]
    async fn test_create_with_form_typed_fields() {
        let repo = Arc::new(MemoryRepository::new(|n| n as i64));
        let handler = RestHandler::<Counter, i64>::new().with_crud(repo.clone());

        let body = OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_form([("name", "3"), ("count", "-7"), ("enabled", "true")])
            .await
            .expect_status(StatusCode::CREATED)
            .expect_content_type(media::FORM)
            .take_body_as_text()
            .await;
        let exp_counter = Counter { id: Some(1), name: "3".to_owned(), count: -7, enabled: true };
        assert_eq!(exp_counter, serde_urlencoded::from_str::<Counter>(&body).unwrap());
        assert_eq!(vec![exp_counter], repo.all().await);
    }

    #[tokio::test]
    async fn test_create_with_form_bad_field_type() {
        let repo = Arc::new(MemoryRepository::new(|n| n as i64));
        let handler = RestHandler::<Counter, i64>::new().with_crud(repo.clone());

        OneShotBuilder::new(handler, (Method::POST, "/"))
            .with_accept(media::JSON)
            .send_form([("name", "x"), ("count", "many"), ("enabled", "true")])
            .await
            .expect_status(StatusCode::BAD_REQUEST)
            .expect_problem("invalid-request-body")
            .await;
        assert!(repo.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_media_mapping_applies_to_its_media_type() {
        let repo = new_repo();
        let handler = new_handler(repo.clone()).with_media_mapping(
            media::NDJSON,
            DtoMapping::new(
                |_ctx: &Context, foo: Foo| Ok(Label { id: foo.id, label: foo.foo }),
                |_ctx: &Context, label: Label| {
                    Ok(Foo { id: label.id, foo: label.label, bar: "b".to_owned(), baz: "z".to_owned() })
                },
            ),
        );

        let body = OneShotBuilder::new(handler.clone(), (Method::POST, "/"))
            .with_accept(media::NDJSON)
            .send_bytes(media::NDJSON, r#"{"label": "l"}"#)
            .await
            .expect_status(StatusCode::CREATED)
            .expect_content_type(media::NDJSON)
            .take_body_as_text()
            .await;
        assert_eq!(
            Label { id: Some("foo-1".to_owned()), label: "l".to_owned() },
            serde_json::from_str::<Label>(&body).unwrap()
        );
        assert_eq!(vec![foo(Some("foo-1"), "l")], repo.all().await);

        let body = OneShotBuilder::new(handler.clone(), (Method::GET, "/"))
            .with_accept(media::NDJSON)
            .send_empty()
            .await
            .expect_status(StatusCode::OK)
            .take_body_as_text()
            .await;
        let labels =
            body.lines().map(|line| serde_json::from_str::<Label>(line).unwrap()).collect::<Vec<Label>>();
        assert_eq!(vec![Label { id: Some("foo-1".to_owned()), label: "l".to_owned() }], labels);

        let shown: Foo = OneShotBuilder::new(handler, (Method::GET, "/foo-1"))
            .with_accept(media::JSON)
            .send_empty()
            .await
            .expect_status(StatusCode::OK)
            .expect_json()
            .await;
        assert_eq!(foo(Some("foo-1"), "l"), shown);
    }

    #[tokio::test]
    async fn test_create_unknown_media_type_falls_back_to_json() {
        let handler = new_handler(new_repo());

        let created: Foo = OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_bytes("application/x-unknown", serde_json::to_vec(&foo(None, "f")).unwrap())
            .await
            .expect_status(StatusCode::CREATED)
            .expect_content_type(media::JSON)
            .expect_json()
            .await;
        assert_eq!(foo(Some("foo-1"), "f"), created);
    }

    #[tokio::test]
    async fn test_create_accept_selects_response_codec() {
        let handler = new_handler(new_repo());

        let body = OneShotBuilder::new(handler, (Method::POST, "/"))
            .with_accept("text/html, application/x-ndjson")
            .send_json(foo(None, "f"))
            .await
            .expect_status(StatusCode::CREATED)
            .expect_content_type(media::NDJSON)
            .take_body_as_text()
            .await;
        assert_eq!(foo(Some("foo-1"), "f"), serde_json::from_str::<Foo>(&body).unwrap());
    }

    #[tokio::test]
    async fn test_body_read_limit_boundary() {
        let body = serde_json::to_vec(&foo(None, "f")).unwrap();

        let handler = new_handler(new_repo()).with_body_read_limit(body.len());
        OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_bytes(media::JSON, body.clone())
            .await
            .expect_status(StatusCode::CREATED)
            .verify();

        let repo = new_repo();
        let handler = new_handler(repo.clone()).with_body_read_limit(body.len() - 1);
        OneShotBuilder::new(handler, (Method::POST, "/"))
            .send_bytes(media::JSON, body)
            .await
            .expect_status(StatusCode::PAYLOAD_TOO_LARGE)
            .expect_problem("request-entity-too-large")
            .await;
        assert!(repo.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_body_read_limit_declared_length() {
        let handler = new_handler(new_repo()).with_body_read_limit(10);

        OneShotBuilder::new(handler, (Method::PUT, "/foo-1"))
            .with_header(CONTENT_LENGTH, "1000")
            .send_bytes(media::JSON, "{}")
            .await
            .expect_status(StatusCode::PAYLOAD_TOO_LARGE)
            .expect_problem("request-entity-too-large")
            .await;
    }

    #[tokio::test]
    async fn test_index_json() {
        let repo = new_repo_with(&["a", "b", "c"]).await;
        let handler = new_handler(repo.clone());

        let foos: Vec<Foo> = OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_accept(media::JSON)
            .send_empty()
            .await
            .expect_content_type(media::JSON)
            .expect_list()
            .await;
        assert_eq!(
            vec![foo(Some("foo-1"), "a"), foo(Some("foo-2"), "b"), foo(Some("foo-3"), "c")],
            foos
        );
        assert_eq!(0, repo.open_streams());
    }

    #[tokio::test]
    async fn test_index_ndjson() {
        let handler = new_handler(new_repo_with(&["a", "b", "c"]).await);

        let body = OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_accept(media::NDJSON)
            .send_empty()
            .await
            .expect_content_type(media::NDJSON)
            .take_body_as_text()
            .await;
        let foos = body
            .lines()
            .map(|line| serde_json::from_str::<Foo>(line).unwrap())
            .map(|foo| foo.foo)
            .collect::<Vec<String>>();
        assert_eq!(vec!["a", "b", "c"], foos);
    }

    #[tokio::test]
    async fn test_index_empty() {
        let handler = new_handler(new_repo());

        let body = OneShotBuilder::new(handler.clone(), (Method::GET, "/"))
            .send_empty()
            .await
            .expect_content_type(media::JSON)
            .take_body_as_text()
            .await;
        assert_eq!("[]", body);

        OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_accept(media::NDJSON)
            .send_empty()
            .await
            .expect_content_type(media::NDJSON)
            .expect_empty()
            .await;
    }

    #[tokio::test]
    async fn test_index_error_on_first_item() {
        let repo = new_repo_with(&["a"]).await;
        repo.inject_find_all_error(0, CrudError::BackendError("Database is down".to_owned())).await;
        let handler = new_handler(repo.clone());

        let problem = OneShotBuilder::new(handler, (Method::GET, "/"))
            .send_empty()
            .await
            .expect_status(StatusCode::INTERNAL_SERVER_ERROR)
            .expect_problem("internal-server-error")
            .await;
        assert!(problem.detail.contains("Database is down"));
        assert_eq!(0, repo.open_streams());
    }

    #[tokio::test]
    async fn test_index_error_after_some_items() {
        let repo = new_repo_with(&["a", "b", "c"]).await;
        repo.inject_find_all_error(2, CrudError::BackendError("Database is down".to_owned())).await;
        let handler = new_handler(repo.clone());

        let foos: Vec<Foo> = OneShotBuilder::new(handler, (Method::GET, "/"))
            .send_empty()
            .await
            .expect_list()
            .await;
        assert_eq!(vec![foo(Some("foo-1"), "a"), foo(Some("foo-2"), "b")], foos);
        assert_eq!(0, repo.open_streams());
    }

    #[tokio::test]
    async fn test_index_not_acceptable() {
        let handler = new_handler(new_repo_with(&["a"]).await);

        OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_accept(media::FORM)
            .send_empty()
            .await
            .expect_status(StatusCode::NOT_ACCEPTABLE)
            .expect_content_type(media::FORM)
            .expect_text("type=not-acceptable")
            .await;
    }

    #[tokio::test]
    async fn test_index_sees_query() {
        let handler = RestHandler::<Foo, String>::new().with_index(|ctx: Context| {
            let name = RequestQuery::from_context(&ctx)
                .and_then(|query| query.get("name"))
                .unwrap_or("none")
                .to_owned();
            stream::iter(vec![Ok(foo(None, &name))]).boxed()
        });

        let foos: Vec<Foo> = OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_query([("name", "given")])
            .send_empty()
            .await
            .expect_list()
            .await;
        assert_eq!(vec![foo(None, "given")], foos);
    }

    #[tokio::test]
    async fn test_update_patch_and_missing_id() {
        let repo = new_repo_with(&["a"]).await;
        let handler = new_handler(repo.clone());

        OneShotBuilder::new(handler, (Method::PATCH, "/foo-1"))
            .send_json(json!({"foo": "patched", "bar": "b", "baz": "z"}))
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_empty()
            .await;

        assert_eq!(vec![foo(Some("foo-1"), "patched")], repo.all().await);
    }

    #[tokio::test]
    async fn test_update_not_found() {
        let repo = new_repo_with(&["a"]).await;
        let handler = new_handler(repo.clone());

        OneShotBuilder::new(handler, (Method::PUT, "/foo-7"))
            .send_json(foo(None, "x"))
            .await
            .expect_status(StatusCode::NOT_FOUND)
            .expect_problem("entity-not-found")
            .await;

        assert_eq!(vec![foo(Some("foo-1"), "a")], repo.all().await);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let handler = RestHandler::<Foo, String>::new()
            .with_index(|_ctx: Context| stream::empty().boxed());

        for (method, uri) in [
            (Method::POST, "/"),
            (Method::PUT, "/"),
            (Method::DELETE, "/"),
            (Method::GET, "/foo-1"),
            (Method::PUT, "/foo-1"),
            (Method::DELETE, "/foo-1"),
            (Method::OPTIONS, "/foo-1"),
        ] {
            OneShotBuilder::new(handler.clone(), (method, uri))
                .send_empty()
                .await
                .expect_status(StatusCode::METHOD_NOT_ALLOWED)
                .expect_problem("rest-method-not-allowed")
                .await;
        }
    }

    #[tokio::test]
    async fn test_malformed_id() {
        let handler = RestHandler::<Note, i64>::new().with_show(|_ctx: Context, id: i64| async move {
            Ok(Some(Note { id: Some(id), text: "hello".to_owned() }))
        });

        let note: Note = OneShotBuilder::new(handler.clone(), (Method::GET, "/42"))
            .send_empty()
            .await
            .expect_json()
            .await;
        assert_eq!(Note { id: Some(42), text: "hello".to_owned() }, note);

        let problem = OneShotBuilder::new(handler, (Method::GET, "/abc"))
            .send_empty()
            .await
            .expect_status(StatusCode::BAD_REQUEST)
            .expect_problem("malformed-id-in-path")
            .await;
        assert!(problem.detail.contains("Invalid i64 'abc'"), "{}", problem.detail);
    }

    #[tokio::test]
    async fn test_resource_routes() {
        let routes = handler_fn(|request: Request| async move {
            let params = PathParams::from_extensions(request.extensions());
            let rc = RoutingContext::from_request(&request);
            format!("{}|{}", params.get("foo_id").unwrap_or("none"), rc.path_left())
        });
        let handler = RestHandler::<Foo, String>::new()
            .with_id_path_param("foo_id")
            .with_resource_routes(routes);

        let body = OneShotBuilder::new(handler, (Method::POST, "/foo%201/notes/3"))
            .send_empty()
            .await
            .take_body_as_text()
            .await;
        assert_eq!("foo 1|/notes/3", body);
    }

    #[tokio::test]
    async fn test_resource_routes_missing() {
        let handler = new_handler(new_repo_with(&["a"]).await);

        OneShotBuilder::new(handler, (Method::GET, "/foo-1/notes"))
            .send_empty()
            .await
            .expect_status(StatusCode::NOT_FOUND)
            .expect_problem("path-not-found")
            .await;
    }

    #[tokio::test]
    async fn test_nested_resources_in_routers() {
        let notes = RestHandler::<Note, i64>::new().with_index(|ctx: Context| {
            let owner = ctx.path_param("foo_id").unwrap_or("none").to_owned();
            stream::iter(vec![Ok(Note { id: Some(1), text: owner })]).boxed()
        });
        let routes = Router::new();
        routes.resource("/notes", notes);

        let foos = new_handler(new_repo_with(&["a"]).await)
            .with_id_path_param("foo_id")
            .with_resource_routes(routes);
        let router = Router::new();
        router.resource("/foos", foos);

        let shown: Foo = OneShotBuilder::new(router.clone(), (Method::GET, "/foos/foo-1"))
            .send_empty()
            .await
            .expect_json()
            .await;
        assert_eq!(foo(Some("foo-1"), "a"), shown);

        let notes: Vec<Note> = OneShotBuilder::new(router, (Method::GET, "/foos/foo-1/notes"))
            .send_empty()
            .await
            .expect_list()
            .await;
        assert_eq!(vec![Note { id: Some(1), text: "foo-1".to_owned() }], notes);
    }

    #[derive(Clone)]
    struct FooId(String);

    #[derive(Clone)]
    struct Tenant(String);

    #[tokio::test]
    async fn test_context_hooks() {
        let handler = RestHandler::<Foo, String>::new()
            .with_collection_context(|_ctx: Context| async {
                Err::<Context, _>(RestError::Forbidden("Cannot list".to_owned()))
            })
            .with_resource_context(|ctx: Context, id: String| async move {
                Ok::<_, RestError>(ctx.with_value(Tenant(format!("tenant-of-{}", id))))
            })
            .with_id_key(FooId)
            .with_show(|ctx: Context, _id: String| async move {
                let id = ctx.get::<FooId>().map(|id| id.0.clone());
                let tenant = ctx.get::<Tenant>().map(|tenant| tenant.0.clone()).unwrap_or_default();
                Ok::<_, CrudError>(Some(Foo { id, foo: tenant, bar: "b".to_owned(), baz: "z".to_owned() }))
            });

        let problem = OneShotBuilder::new(handler.clone(), (Method::GET, "/"))
            .send_empty()
            .await
            .expect_status(StatusCode::FORBIDDEN)
            .expect_problem("forbidden")
            .await;
        assert_eq!("Cannot list", problem.detail);

        let shown: Foo = OneShotBuilder::new(handler, (Method::GET, "/x"))
            .send_empty()
            .await
            .expect_json()
            .await;
        assert_eq!(foo(Some("x"), "tenant-of-x"), shown);
    }

    #[tokio::test]
    async fn test_error_handler() {
        let handler = new_handler(new_repo()).with_error_handler(
            |e: RestError, negotiated: &Negotiated, instance: &str| {
                let body = format!("{}|{}|{}", e.code(), negotiated.media_type, instance);
                (StatusCode::IM_A_TEAPOT, body).into_response()
            },
        );

        let body = OneShotBuilder::new(handler, (Method::GET, "/missing"))
            .send_empty()
            .await
            .expect_status(StatusCode::IM_A_TEAPOT)
            .take_body_as_text()
            .await;
        assert_eq!("entity-not-found|application/json|/missing", body);
    }

    #[tokio::test]
    async fn test_panic_recovery() {
        let handler = RestHandler::<Foo, String>::new().with_show(|_ctx: Context, id: String| async move {
            if id == "boom" {
                panic!("Exploded while showing");
            }
            Ok::<Option<Foo>, CrudError>(None)
        });

        let problem = OneShotBuilder::new(handler, (Method::GET, "/boom"))
            .send_empty()
            .await
            .expect_status(StatusCode::INTERNAL_SERVER_ERROR)
            .expect_problem("internal-server-error")
            .await;
        assert_eq!("Exploded while showing", problem.detail);
    }

    #[tokio::test]
    async fn test_index_panic_while_fetching_truncates_list() {
        let handler = RestHandler::<Note, i64>::new().with_index(|_ctx: Context| {
            stream::iter(vec![1, 2, 3])
                .map(|n| {
                    if n == 2 {
                        panic!("Exploded while listing");
                    }
                    Ok(Note { id: Some(n), text: "a".to_owned() })
                })
                .boxed()
        });

        let body = OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_accept(media::JSON)
            .send_empty()
            .await
            .expect_status(StatusCode::OK)
            .take_body_as_text()
            .await;
        assert_eq!(r#"[{"id":1,"text":"a"}]"#, body);
    }

    #[tokio::test]
    async fn test_index_panic_while_encoding_truncates_list() {
        let handler = new_handler(new_repo_with(&["a", "b", "c"]).await).with_media_mapping(
            media::NDJSON,
            DtoMapping::new(
                |_ctx: &Context, foo: Foo| {
                    if foo.foo == "b" {
                        panic!("Exploded while mapping");
                    }
                    Ok(Label { id: foo.id, label: foo.foo })
                },
                |_ctx: &Context, label: Label| Ok(foo(label.id.as_deref(), &label.label)),
            ),
        );

        let body = OneShotBuilder::new(handler, (Method::GET, "/"))
            .with_accept(media::NDJSON)
            .send_empty()
            .await
            .expect_status(StatusCode::OK)
            .take_body_as_text()
            .await;
        assert_eq!("{\"id\":\"foo-1\",\"label\":\"a\"}\n", body);
    }

    #[test]
    fn test_options_from_env() {
        temp_env::with_var("RESTKIT_BODY_READ_LIMIT", Some("1024"), || {
            let opts = RestHandlerOptions::from_env("RESTKIT").unwrap();
            assert_eq!(RestHandlerOptions { body_read_limit: 1024 }, opts);
        });

        temp_env::with_var_unset("RESTKIT_BODY_READ_LIMIT", || {
            let opts = RestHandlerOptions::from_env("RESTKIT").unwrap();
            assert_eq!(RestHandlerOptions::default(), opts);
        });

        temp_env::with_var("RESTKIT_BODY_READ_LIMIT", Some("lots"), || {
            RestHandlerOptions::from_env("RESTKIT").unwrap_err();
        });
    }
}
