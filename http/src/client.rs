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

//! Client for RESTful resources served by a `RestHandler`.
//!
//! The client speaks the same wire contract as the handler: it encodes entities with the same
//! mappings and codecs and translates response statuses back into domain errors.

use crate::codec::{Codec, CodecError, CodecRegistry, ListDecoder, Negotiated, decode_list};
use crate::errors::{ProblemDetails, RestError};
use crate::ids::{IdAccessor, IdConverter, IdError};
use crate::mapping::{IdentityMapping, Mapping, MappingError, MappingTable, deserialize_dto};
use crate::media;
use crate::transport::{ResponseBody, RoundTripper, TransportError, TransportResponse};
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use log::debug;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use restkit_core::context::{Context, ContextError};
use restkit_core::env::{get_optional_var, get_required_var};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Characters to escape when placing a value in a single path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Client-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server refused to create an entity because it already exists.
    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    /// A document could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The context of the operation was cancelled or expired.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// An identifier could not be formatted.
    #[error(transparent)]
    Id(#[from] IdError),

    /// An entity could not be converted to or from its document.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// The entity to update has no identifier.
    #[error("Entity has no ID")]
    MissingId,

    /// The base URL refers to a path parameter that the context does not have.
    #[error("Missing path parameter '{0}'")]
    MissingParam(String),

    /// The entity does not exist.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// The server returned a list in a media type that cannot be decoded as a list.
    #[error("Cannot decode lists of type {0}")]
    NotStreamable(String),

    /// The request could not be delivered or the response could not be read.
    #[error(transparent)]
    Transport(TransportError),

    /// The server returned a status that the operation does not expect.
    #[error("Unexpected response with status {status} from {url}: {body}")]
    UnexpectedResponse {
        /// Status of the response.
        status: StatusCode,

        /// URL of the request.
        url: String,

        /// Body of the response, possibly lossily converted to text.
        body: String,
    },
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Context(e) => ClientError::Context(e),
            e => ClientError::Transport(e),
        }
    }
}

/// Result type for this module.
pub type ClientResult<T> = Result<T, ClientError>;

/// Stream of entities returned by listing operations.
pub type ClientStream<E> = BoxStream<'static, ClientResult<E>>;

/// Configuration options for a `RestClient`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// URL of the collection, which may contain `:name` segments to fill from the context.
    pub base_url: String,

    /// Media type to use for requests and to ask for in responses.
    pub media_type: String,

    /// Whether to read lists in full before returning their first entity.
    pub disable_streaming: bool,
}

impl ClientOptions {
    /// Creates options for the collection at `base_url` with default settings.
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            media_type: media::JSON.to_owned(),
            disable_streaming: false,
        }
    }

    /// Creates a new set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_BASE_URL`, `<prefix>_MEDIA_TYPE` and
    /// `<prefix>_DISABLE_STREAMING`.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            base_url: get_required_var::<String>(prefix, "BASE_URL")?,
            media_type: get_optional_var::<String>(prefix, "MEDIA_TYPE")?
                .unwrap_or_else(|| media::JSON.to_owned()),
            disable_streaming: get_optional_var::<bool>(prefix, "DISABLE_STREAMING")?
                .unwrap_or(false),
        })
    }
}

/// Replaces the `:name` segments of `pattern` with the escaped path parameters in `ctx`.
fn expand_url(pattern: &str, ctx: &Context) -> ClientResult<String> {
    let mut segments = Vec::new();
    for segment in pattern.split('/') {
        match segment.strip_prefix(':') {
            Some(name) => {
                let value = ctx
                    .path_param(name)
                    .ok_or_else(|| ClientError::MissingParam(name.to_owned()))?;
                segments.push(utf8_percent_encode(value, SEGMENT).to_string());
            }
            None => segments.push(segment.to_owned()),
        }
    }
    Ok(segments.join("/"))
}

/// Builds the error for a response whose status the operation cannot handle.
async fn unexpected(url: String, response: TransportResponse) -> ClientError {
    let status = response.status();
    let body = match response.into_body().bytes().await {
        Ok(body) => String::from_utf8_lossy(&body).into_owned(),
        Err(e) => format!("<unreadable body: {}>", e),
    };
    ClientError::UnexpectedResponse { status, url, body }
}

/// Function that prepares the context of every operation.
type ContextHookFn = Arc<dyn Fn(Context) -> Context + Send + Sync>;

/// Incremental reader of the entities in a list response.
struct ListReader<E> {
    /// Body of the response.
    body: ResponseBody,

    /// Decoder for the list.
    decoder: Box<dyn ListDecoder>,

    /// Bytes received and not yet decoded.
    buffer: BytesMut,

    /// Mapping for the response media type.
    mapping: Arc<dyn Mapping<E>>,

    /// Context of the operation.
    ctx: Context,

    /// Whether the body has been fully received.
    eof: bool,

    /// Whether an error has been returned, which ends the list.
    failed: bool,
}

impl<E: Send + 'static> ListReader<E> {
    /// Decodes the next entity, reading more of the body as necessary.
    async fn next_entity(mut self) -> Option<(ClientResult<E>, Self)> {
        if self.failed {
            return None;
        }

        loop {
            let decoded = if self.eof {
                self.decoder.decode_eof(&mut self.buffer)
            } else {
                self.decoder.decode(&mut self.buffer)
            };
            match decoded {
                Ok(Some(dto)) => {
                    let entity = self.mapping.from_dto(&self.ctx, dto).map_err(ClientError::from);
                    return Some(self.emit(entity));
                }
                Ok(None) if self.eof => return None,
                Ok(None) => (),
                Err(e) => return Some(self.emit(Err(e.into()))),
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(self.emit(Err(e.into()))),
                None => self.eof = true,
            }
        }
    }

    /// Prepares `result` to be returned, releasing the body if it is an error.
    fn emit(mut self, result: ClientResult<E>) -> (ClientResult<E>, Self) {
        if result.is_err() {
            self.failed = true;
            self.body = ResponseBody::empty();
        }
        (result, self)
    }
}

/// Client for a collection of entities of type `E` identified by `I`.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct RestClient<E, I> {
    /// URL of the collection, possibly with `:name` segments.
    base_url: String,

    /// Round-tripper that carries the requests.
    transport: Arc<dyn RoundTripper>,

    /// Media type to use for requests and to ask for in responses.
    media_type: String,

    /// Codecs that take precedence over the default registry.
    codecs: Arc<CodecRegistry>,

    /// Entity to document mappings.
    mappings: Arc<MappingTable<E>>,

    /// Converter between identifiers and path segments.
    ids: IdConverter<I>,

    /// Accessor to the identifiers of entities to update.
    id_accessor: IdAccessor<E, I>,

    /// Hook to prepare the context of every operation.
    context_hook: Option<ContextHookFn>,

    /// Whether to read lists in full before returning their first entity.
    disable_streaming: bool,
}

impl<E, I> RestClient<E, I>
where
    E: Serialize + DeserializeOwned + Send + 'static,
    I: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a client for the collection at `base_url` whose documents are the serde
    /// representation of the entities and whose identifiers live in the `id` field.
    pub fn new<S: Into<String>, T: RoundTripper + 'static>(base_url: S, transport: T) -> Self {
        Self::with_mapping(base_url, transport, IdentityMapping, IdAccessor::by_field("id"))
    }
}

impl<E, I> RestClient<E, I>
where
    E: Send + 'static,
    I: Clone + Send + Sync + 'static,
{
    /// Creates a client for the collection at `base_url` that uses `mapping` for all media types
    /// and `id_accessor` to find the identifiers of entities.
    pub fn with_mapping<S, T, M>(
        base_url: S,
        transport: T,
        mapping: M,
        id_accessor: IdAccessor<E, I>,
    ) -> Self
    where
        S: Into<String>,
        T: RoundTripper + 'static,
        M: Mapping<E> + 'static,
    {
        Self {
            base_url: base_url.into(),
            transport: Arc::new(transport),
            media_type: media::JSON.to_owned(),
            codecs: Arc::new(CodecRegistry::default()),
            mappings: Arc::new(MappingTable::new(Arc::new(mapping))),
            ids: IdConverter::default(),
            id_accessor,
            context_hook: None,
            disable_streaming: false,
        }
    }

    /// Applies the configuration in `opts`.
    pub fn with_options(self, opts: ClientOptions) -> Self {
        let mut client = self.with_media_type(&opts.media_type);
        client.base_url = opts.base_url;
        client.disable_streaming = opts.disable_streaming;
        client
    }

    /// Sets the media type to use for requests and to ask for in responses.
    pub fn with_media_type(mut self, media_type: &str) -> Self {
        self.media_type = media::canonical(media_type);
        self
    }

    /// Registers `codec` for `media_type` in this client only.
    pub fn with_codec(mut self, media_type: &str, codec: Arc<dyn Codec>) -> Self {
        Arc::make_mut(&mut self.codecs).register(media_type, codec);
        self
    }

    /// Uses `mapping` for documents of type `media_type`.
    pub fn with_media_mapping<M: Mapping<E> + 'static>(mut self, media_type: &str, mapping: M) -> Self {
        Arc::make_mut(&mut self.mappings).insert(media_type, Arc::new(mapping));
        self
    }

    /// Sets the converter between identifiers and path segments.
    pub fn with_id_converter(mut self, ids: IdConverter<I>) -> Self {
        self.ids = ids;
        self
    }

    /// Sets the accessor to the identifiers of entities.
    pub fn with_id_accessor(mut self, id_accessor: IdAccessor<E, I>) -> Self {
        self.id_accessor = id_accessor;
        self
    }

    /// Sets a hook to prepare the context of every operation, for example to provide the path
    /// parameters that the base URL needs.
    pub fn with_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(Context) -> Context + Send + Sync + 'static,
    {
        self.context_hook = Some(Arc::new(hook));
        self
    }

    /// Makes `find_all` read lists in full before returning their first entity.
    pub fn with_disable_streaming(mut self, disable: bool) -> Self {
        self.disable_streaming = disable;
        self
    }

    /// Returns the context to use for an operation invoked with `ctx`.
    fn prepare(&self, ctx: &Context) -> Context {
        match self.context_hook.as_ref() {
            Some(hook) => hook(ctx.clone()),
            None => ctx.clone(),
        }
    }

    /// Computes the URL of the collection.
    fn collection_url(&self, ctx: &Context) -> ClientResult<String> {
        expand_url(&self.base_url, ctx)
    }

    /// Computes the URL of the resource `id`.
    fn resource_url(&self, ctx: &Context, id: &I) -> ClientResult<String> {
        let base = self.collection_url(ctx)?;
        let id = self.ids.format(id)?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), utf8_percent_encode(&id, SEGMENT)))
    }

    /// Returns the codec for request bodies.
    fn codec(&self) -> Negotiated {
        Negotiated::lookup_or_json(&self.media_type, &self.codecs)
    }

    /// Returns the codec for a response body with `headers`.
    fn response_codec(&self, headers: &HeaderMap) -> Negotiated {
        match media::content_type(headers) {
            Some(media_type) => Negotiated::lookup_or_json(&media_type, &self.codecs),
            None => self.codec(),
        }
    }

    /// Encodes `entity` as a request body.
    fn encode(&self, ctx: &Context, entity: E) -> ClientResult<Bytes> {
        let negotiated = self.codec();
        let dto = self.mappings.get(&negotiated.media_type).to_dto(ctx, entity)?;
        Ok(negotiated.codec.marshal(&dto)?)
    }

    /// Reads and decodes the entity in the body of `response`.
    async fn read_entity(&self, ctx: &Context, response: TransportResponse) -> ClientResult<E> {
        let (parts, body) = response.into_parts();
        let body = body.cancellable(ctx).bytes().await?;
        let negotiated = self.response_codec(&parts.headers);
        let dto = negotiated.codec.unmarshal(&body)?;
        Ok(self.mappings.get(&negotiated.media_type).from_dto(ctx, dto)?)
    }

    /// Decodes the problem document in `response` into the error it describes, if any.
    async fn problem_error(&self, response: TransportResponse) -> Option<RestError> {
        let (parts, body) = response.into_parts();
        let body = body.bytes().await.ok()?;
        let dto = self.response_codec(&parts.headers).codec.unmarshal(&body).ok()?;
        deserialize_dto::<ProblemDetails>(dto).ok()?.to_error()
    }

    /// Sends a `method` request to `url` with an optional `body`.
    async fn send(
        &self,
        ctx: &Context,
        method: Method,
        url: &str,
        body: Option<Bytes>,
    ) -> ClientResult<TransportResponse> {
        let media_type = self.codec().media_type;
        debug!("Sending {} {}", method, url);
        let request = http::Request::builder()
            .method(method)
            .uri(url)
            .header(CONTENT_TYPE, media_type.as_str())
            .header(ACCEPT, media_type.as_str())
            .body(body.unwrap_or_default())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(self.transport.round_trip(ctx, request).await?)
    }

    /// Creates `entity` and returns it as stored by the server.
    pub async fn create(&self, ctx: &Context, entity: E) -> ClientResult<E> {
        let ctx = self.prepare(ctx);
        let url = self.collection_url(&ctx)?;
        let body = self.encode(&ctx, entity)?;
        let response = self.send(&ctx, Method::POST, &url, Some(body)).await?;
        match response.status() {
            status if status.is_success() => self.read_entity(&ctx, response).await,
            StatusCode::CONFLICT => match self.problem_error(response).await {
                Some(RestError::EntityAlreadyExists(detail)) if !detail.is_empty() => {
                    Err(ClientError::AlreadyExists(detail))
                }
                _ => Err(ClientError::AlreadyExists(url)),
            },
            _ => Err(unexpected(url, response).await),
        }
    }

    /// Looks up the entity `id`.  Returns `None` if it does not exist.
    pub async fn find_by_id(&self, ctx: &Context, id: &I) -> ClientResult<Option<E>> {
        let ctx = self.prepare(ctx);
        let url = self.resource_url(&ctx, id)?;
        let response = self.send(&ctx, Method::GET, &url, None).await?;
        match response.status() {
            status if status.is_success() => Ok(Some(self.read_entity(&ctx, response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected(url, response).await),
        }
    }

    /// Lists all entities as they arrive from the server.
    ///
    /// The request is sent when the stream is first polled.  Dropping the stream closes the
    /// response.
    pub fn find_all(&self, ctx: &Context) -> ClientStream<E> {
        let client = self.clone();
        let ctx = self.prepare(ctx);
        stream::once(async move { client.open_list(ctx).await })
            .flat_map(|result| match result {
                Ok(entities) => entities,
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .boxed()
    }

    /// Sends the request for `find_all` and prepares to read the list in its response.
    async fn open_list(self, ctx: Context) -> ClientResult<ClientStream<E>> {
        let url = self.collection_url(&ctx)?;
        let response = self.send(&ctx, Method::GET, &url, None).await?;
        if !response.status().is_success() {
            return Err(unexpected(url, response).await);
        }

        let (parts, body) = response.into_parts();
        let negotiated = self.response_codec(&parts.headers);
        let Some(streaming) = negotiated.codec.streaming() else {
            return Err(ClientError::NotStreamable(negotiated.media_type));
        };
        let mut decoder = streaming.list_decoder();
        let mapping = self.mappings.get(&negotiated.media_type).clone();
        let body = body.cancellable(&ctx);

        if self.disable_streaming {
            let data = body.bytes().await?;
            let entities = decode_list(decoder.as_mut(), &data)?
                .into_iter()
                .map(|dto| mapping.from_dto(&ctx, dto))
                .collect::<Result<Vec<E>, MappingError>>()?;
            return Ok(stream::iter(entities.into_iter().map(Ok)).boxed());
        }

        let reader = ListReader {
            body,
            decoder,
            buffer: BytesMut::new(),
            mapping,
            ctx,
            eof: false,
            failed: false,
        };
        Ok(stream::unfold(reader, ListReader::next_entity).boxed())
    }

    /// Looks up the entities in `ids` one at a time, in order.
    ///
    /// The stream ends after the first error.  Missing entities are reported as `NotFound`.
    pub fn find_by_ids(&self, ctx: &Context, ids: Vec<I>) -> ClientStream<E> {
        let state = Some((self.clone(), ctx.clone(), ids.into_iter()));
        stream::unfold(state, |state| async move {
            let (client, ctx, mut ids) = state?;
            let id = ids.next()?;
            match client.find_by_id(&ctx, &id).await {
                Ok(Some(entity)) => Some((Ok(entity), Some((client, ctx, ids)))),
                Ok(None) => {
                    let id = client.ids.format(&id).unwrap_or_default();
                    Some((Err(ClientError::NotFound(id)), None))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Replaces the stored entity that has the same identifier as `entity`.
    pub async fn update(&self, ctx: &Context, entity: E) -> ClientResult<()> {
        let ctx = self.prepare(ctx);
        let id = self.id_accessor.get(&entity).ok_or(ClientError::MissingId)?;
        let url = self.resource_url(&ctx, &id)?;
        let body = self.encode(&ctx, entity)?;
        let response = self.send(&ctx, Method::PUT, &url, Some(body)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(self.ids.format(&id)?)),
            _ => Err(unexpected(url, response).await),
        }
    }

    /// Deletes the entity `id`.
    pub async fn delete_by_id(&self, ctx: &Context, id: &I) -> ClientResult<()> {
        let ctx = self.prepare(ctx);
        let url = self.resource_url(&ctx, id)?;
        let response = self.send(&ctx, Method::DELETE, &url, None).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(self.ids.format(id)?)),
            _ => Err(unexpected(url, response).await),
        }
    }

    /// Deletes all entities.
    pub async fn delete_all(&self, ctx: &Context) -> ClientResult<()> {
        let ctx = self.prepare(ctx);
        let url = self.collection_url(&ctx)?;
        let response = self.send(&ctx, Method::DELETE, &url, None).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(url, response).await)
        }
    }
}
