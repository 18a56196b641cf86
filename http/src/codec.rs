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

//! Codecs that translate between wire bytes and generic `serde_json::Value` documents.
//!
//! Codecs are looked up by media type.  Resources and clients consult their own registry first,
//! then the process-wide default registry, and finally fall back to JSON.  Streaming codecs can also
//! encode and decode lists incrementally, which is what makes it possible to serve and consume
//! collections without buffering them in full.

use crate::media;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

mod form;
mod json;
mod jsonstream;

pub use form::FormCodec;
pub use json::JsonCodec;
pub use jsonstream::JsonStreamCodec;

/// Errors raised while encoding or decoding documents.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Indicates that the input bytes are not a valid document.
    #[error("Cannot decode: {0}")]
    Decode(String),

    /// Indicates that a value cannot be represented in the target format.
    #[error("Cannot encode: {0}")]
    Encode(String),
}

/// Result type for this module.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encoder and decoder of single documents.
pub trait Codec: Send + Sync {
    /// Encodes a single `value`.
    fn marshal(&self, value: &Value) -> CodecResult<Bytes>;

    /// Decodes a single value from `data`.
    fn unmarshal(&self, data: &[u8]) -> CodecResult<Value>;

    /// Returns the list-encoding capabilities of this codec, if it has any.
    fn streaming(&self) -> Option<&dyn StreamingCodec> {
        None
    }
}

/// Codecs that can encode and decode lists one element at a time.
pub trait StreamingCodec: Codec {
    /// Creates an encoder for a new list.
    fn list_encoder(&self) -> Box<dyn ListEncoder>;

    /// Creates a decoder for a new list.
    fn list_decoder(&self) -> Box<dyn ListDecoder>;
}

/// Incremental encoder of a list of values.
pub trait ListEncoder: Send {
    /// Appends the encoding of `value` to `dst`, including any framing that precedes it.
    fn encode(&mut self, value: &Value, dst: &mut BytesMut) -> CodecResult<()>;

    /// Appends the closing framing of the list to `dst`.
    ///
    /// Calling this more than once has no further effect.
    fn close(&mut self, dst: &mut BytesMut);
}

/// Incremental decoder of a list of values.
///
/// The caller appends bytes to a buffer as they arrive and repeatedly calls `decode` to consume
/// complete values from its front.  Once no more bytes will arrive, `decode_eof` must be called
/// until it returns `None` to flush trailing values and to validate that the list was complete.
pub trait ListDecoder: Send {
    /// Consumes the next complete value from `src`.  Returns `None` if more bytes are needed.
    fn decode(&mut self, src: &mut BytesMut) -> CodecResult<Option<Value>>;

    /// Consumes the next value from `src` knowing that no more bytes will arrive.  Returns `None`
    /// once the list has been fully consumed.
    fn decode_eof(&mut self, src: &mut BytesMut) -> CodecResult<Option<Value>>;
}

/// Decodes all values of a complete, buffered list using `decoder`.
pub fn decode_list(decoder: &mut dyn ListDecoder, data: &[u8]) -> CodecResult<Vec<Value>> {
    let mut src = BytesMut::from(data);
    let mut values = vec![];
    while let Some(value) = decoder.decode_eof(&mut src)? {
        values.push(value);
    }
    Ok(values)
}

/// Collection of codecs indexed by their canonical media type.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    /// Mapping of canonical media types to their codecs.
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Registers `codec` to handle `media_type`.
    ///
    /// Panics if the media type already has a codec, as that indicates a setup bug.
    pub fn register<S: AsRef<str>>(&mut self, media_type: S, codec: Arc<dyn Codec>) {
        let media_type = media::canonical(media_type.as_ref());
        let previous = self.codecs.insert(media_type.clone(), codec);
        assert!(previous.is_none(), "Codec for {} already registered", media_type);
    }

    /// Same as `register` but consumes and returns the registry for chaining.
    pub fn with<S: AsRef<str>>(mut self, media_type: S, codec: Arc<dyn Codec>) -> Self {
        self.register(media_type, codec);
        self
    }

    /// Returns the codec for `media_type`, if registered.
    pub fn get(&self, media_type: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(media_type).or_else(|| self.codecs.get(&media::canonical(media_type)))
    }
}

/// Returns the process-wide registry with the built-in codecs.
pub fn default_registry() -> &'static CodecRegistry {
    static REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let json: Arc<dyn Codec> = Arc::new(JsonCodec::default());
        let stream: Arc<dyn Codec> = Arc::new(JsonStreamCodec::default());
        CodecRegistry::default()
            .with(media::JSON, json.clone())
            .with(media::PROBLEM_JSON, json)
            .with(media::NDJSON, stream.clone())
            .with(media::STREAM_JSON, stream.clone())
            .with(media::JSON_STREAM, stream)
            .with(media::FORM, Arc::new(FormCodec::default()))
    })
}

/// A media type paired with the codec selected for it.
#[derive(Clone)]
pub struct Negotiated {
    /// Canonical media type to advertise in `Content-Type`.
    pub media_type: String,

    /// Codec that handles `media_type`.
    pub codec: Arc<dyn Codec>,
}

impl Negotiated {
    /// Returns the JSON codec, used when nothing else matches.
    pub fn json() -> Self {
        Self { media_type: media::JSON.to_owned(), codec: Arc::new(JsonCodec::default()) }
    }

    /// Looks up `media_type` in `local` and then in the default registry.
    pub fn lookup(media_type: &str, local: &CodecRegistry) -> Option<Self> {
        let media_type = media::canonical(media_type);
        let codec = local.get(&media_type).or_else(|| default_registry().get(&media_type))?;
        Some(Self { media_type, codec: codec.clone() })
    }

    /// Same as `lookup` but falls back to JSON for unknown media types.
    pub fn lookup_or_json(media_type: &str, local: &CodecRegistry) -> Self {
        Self::lookup(media_type, local).unwrap_or_else(Self::json)
    }

    /// Picks the codec for the body of a request based on its `Content-Type`.
    pub fn for_request(headers: &HeaderMap, local: &CodecRegistry) -> Self {
        match media::content_type(headers) {
            Some(media_type) => Self::lookup_or_json(&media_type, local),
            None => Self::json(),
        }
    }

    /// Picks the codec for a response based on the `Accept` header of its request.
    ///
    /// The first acceptable entry with a known codec wins.  If there is none, the response uses the
    /// same codec as the `request`.
    pub fn for_response(headers: &HeaderMap, local: &CodecRegistry, request: &Negotiated) -> Self {
        media::accept_candidates(headers)
            .iter()
            .find_map(|candidate| Self::lookup(candidate, local))
            .unwrap_or_else(|| request.clone())
    }

    /// Picks the codec for a response to a request with `headers`, considering both its
    /// `Accept` and `Content-Type` headers.
    pub fn for_response_to(headers: &HeaderMap, local: &CodecRegistry) -> Self {
        let request = Self::for_request(headers, local);
        Self::for_response(headers, local, &request)
    }
}
