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

//! Conversions between entities and the documents exchanged on the wire.

use restkit_core::context::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Errors raised while mapping entities to and from documents.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// Indicates that a received document does not describe a valid entity.
    #[error("{0}")]
    FromDto(String),

    /// Indicates that an entity cannot be represented as a document.
    #[error("{0}")]
    ToDto(String),
}

/// Result type for this module.
pub type MappingResult<T> = Result<T, MappingError>;

/// Translates entities of type `E` to and from generic documents.
pub trait Mapping<E>: Send + Sync {
    /// Converts `entity` into the document to send on the wire.
    fn to_dto(&self, ctx: &Context, entity: E) -> MappingResult<Value>;

    /// Converts a document received from the wire into an entity.
    fn from_dto(&self, ctx: &Context, dto: Value) -> MappingResult<E>;
}

/// Returns the fields of `dto` if it is a flat object whose values are all strings.
fn string_fields(dto: &Value) -> Option<Vec<(&str, &str)>> {
    let Value::Object(fields) = dto else {
        return None;
    };
    fields.iter().map(|(key, value)| value.as_str().map(|value| (key.as_str(), value))).collect()
}

/// Deserializes the document `dto` into `D`.
///
/// Documents read from forms carry every value as a string.  When `D` wants other scalar types
/// for those fields, the strings are parsed the way form decoding does.
pub fn deserialize_dto<D: DeserializeOwned>(dto: Value) -> MappingResult<D> {
    let form = string_fields(&dto).and_then(|fields| serde_urlencoded::to_string(fields).ok());
    match serde_json::from_value::<D>(dto) {
        Ok(dto) => Ok(dto),
        Err(e) => match form {
            Some(form) => serde_urlencoded::from_str::<D>(&form)
                .map_err(|_| MappingError::FromDto(e.to_string())),
            None => Err(MappingError::FromDto(e.to_string())),
        },
    }
}

/// Mapping that uses the entity's own serde representation as its document.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityMapping;

impl<E> Mapping<E> for IdentityMapping
where
    E: Serialize + DeserializeOwned,
{
    fn to_dto(&self, _ctx: &Context, entity: E) -> MappingResult<Value> {
        serde_json::to_value(entity).map_err(|e| MappingError::ToDto(e.to_string()))
    }

    fn from_dto(&self, _ctx: &Context, dto: Value) -> MappingResult<E> {
        deserialize_dto(dto)
    }
}

/// Type of the function that converts an entity into its DTO.
type ToDtoFn<E, D> = dyn Fn(&Context, E) -> Result<D, String> + Send + Sync;

/// Type of the function that converts a DTO into its entity.
type FromDtoFn<E, D> = dyn Fn(&Context, D) -> Result<E, String> + Send + Sync;

/// Mapping that goes through an intermediate data transfer object of type `D`.
///
/// The documents on the wire are the serde representation of `D`.
pub struct DtoMapping<E, D> {
    /// Entity to DTO conversion.
    to: Box<ToDtoFn<E, D>>,

    /// DTO to entity conversion.
    from: Box<FromDtoFn<E, D>>,

    /// Marker to carry the entity and DTO types.
    _phantom: PhantomData<fn(E, D)>,
}

impl<E, D> DtoMapping<E, D> {
    /// Creates a mapping from a pair of conversion functions.
    pub fn new<T, F>(to: T, from: F) -> Self
    where
        T: Fn(&Context, E) -> Result<D, String> + Send + Sync + 'static,
        F: Fn(&Context, D) -> Result<E, String> + Send + Sync + 'static,
    {
        Self { to: Box::new(to), from: Box::new(from), _phantom: PhantomData }
    }
}

impl<E, D> Mapping<E> for DtoMapping<E, D>
where
    D: Serialize + DeserializeOwned,
{
    fn to_dto(&self, ctx: &Context, entity: E) -> MappingResult<Value> {
        let dto = (self.to)(ctx, entity).map_err(MappingError::ToDto)?;
        serde_json::to_value(dto).map_err(|e| MappingError::ToDto(e.to_string()))
    }

    fn from_dto(&self, ctx: &Context, dto: Value) -> MappingResult<E> {
        let dto = deserialize_dto::<D>(dto)?;
        (self.from)(ctx, dto).map_err(MappingError::FromDto)
    }
}

/// A default mapping plus overrides for specific media types.
pub struct MappingTable<E> {
    /// Mapping used for media types without an override.
    default: Arc<dyn Mapping<E>>,

    /// Overrides keyed by canonical media type.
    by_media_type: HashMap<String, Arc<dyn Mapping<E>>>,
}

impl<E> Clone for MappingTable<E> {
    fn clone(&self) -> Self {
        Self { default: self.default.clone(), by_media_type: self.by_media_type.clone() }
    }
}

impl<E> MappingTable<E> {
    /// Creates a table that uses `default` for all media types.
    pub fn new(default: Arc<dyn Mapping<E>>) -> Self {
        Self { default, by_media_type: HashMap::default() }
    }

    /// Overrides the mapping for `media_type`.
    pub fn insert(&mut self, media_type: &str, mapping: Arc<dyn Mapping<E>>) {
        self.by_media_type.insert(crate::media::canonical(media_type), mapping);
    }

    /// Returns the mapping to use for `media_type`.
    pub fn get(&self, media_type: &str) -> &Arc<dyn Mapping<E>> {
        self.by_media_type.get(media_type).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, FormCodec};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Entity {
        id: u32,
        secret: String,
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct PublicDto {
        id: u32,
    }

    fn public_mapping() -> DtoMapping<Entity, PublicDto> {
        DtoMapping::new(
            |_ctx, e: Entity| Ok(PublicDto { id: e.id }),
            |_ctx, d: PublicDto| {
                if d.id == 0 {
                    return Err("ID cannot be zero".to_owned());
                }
                Ok(Entity { id: d.id, secret: String::new() })
            },
        )
    }

    #[test]
    fn test_identity_mapping() {
        let ctx = Context::background();
        let entity = Entity { id: 3, secret: "s".to_owned() };
        let dto = IdentityMapping.to_dto(&ctx, entity).unwrap();
        assert_eq!(json!({"id": 3, "secret": "s"}), dto);

        let entity: Entity = IdentityMapping.from_dto(&ctx, dto).unwrap();
        assert_eq!(Entity { id: 3, secret: "s".to_owned() }, entity);

        let err = Mapping::<Entity>::from_dto(&IdentityMapping, &ctx, json!({"id": "x"}))
            .unwrap_err();
        assert!(matches!(err, MappingError::FromDto(_)));
    }

    #[test]
    fn test_dto_mapping() {
        let ctx = Context::background();
        let mapping = public_mapping();

        let dto = mapping.to_dto(&ctx, Entity { id: 5, secret: "hidden".to_owned() }).unwrap();
        assert_eq!(json!({"id": 5}), dto);

        let entity = mapping.from_dto(&ctx, json!({"id": 7, "secret": "ignored"})).unwrap();
        assert_eq!(Entity { id: 7, secret: String::new() }, entity);

        match mapping.from_dto(&ctx, json!({"id": 0})) {
            Err(MappingError::FromDto(e)) => assert_eq!("ID cannot be zero", e),
            r => panic!("Unexpected result {:?}", r),
        }
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Counter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        name: String,
        count: i64,
        enabled: bool,
    }

    #[test]
    fn test_form_documents_round_trip() {
        let ctx = Context::background();
        let codec = FormCodec::default();

        for counter in [
            Counter { id: Some(1), name: "x".to_owned(), count: 3, enabled: true },
            Counter { id: None, name: "3".to_owned(), count: -7, enabled: false },
        ] {
            let dto = IdentityMapping.to_dto(&ctx, counter.clone()).unwrap();
            let decoded = codec.unmarshal(&codec.marshal(&dto).unwrap()).unwrap();
            let counter2: Counter = IdentityMapping.from_dto(&ctx, decoded).unwrap();
            assert_eq!(counter, counter2);
        }
    }

    #[test]
    fn test_form_documents_invalid_fields() {
        let ctx = Context::background();
        let dto = json!({"name": "x", "count": "three", "enabled": "true"});
        match Mapping::<Counter>::from_dto(&IdentityMapping, &ctx, dto) {
            Err(MappingError::FromDto(e)) => assert!(e.contains("invalid type"), "{}", e),
            r => panic!("Unexpected result {:?}", r),
        }
    }

    #[test]
    fn test_mapping_table() {
        let ctx = Context::background();
        let mut table = MappingTable::<Entity>::new(Arc::new(IdentityMapping));
        table.insert("Application/X-Public", Arc::new(public_mapping()));

        let entity = || Entity { id: 1, secret: "s".to_owned() };
        assert_eq!(
            json!({"id": 1, "secret": "s"}),
            table.get("application/json").to_dto(&ctx, entity()).unwrap()
        );
        assert_eq!(json!({"id": 1}), table.get("application/x-public").to_dto(&ctx, entity()).unwrap());
    }
}
