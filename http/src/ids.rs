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

//! Conversions between entity identifiers and their textual form in URLs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Errors raised while converting identifiers.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum IdError {
    /// Indicates that a textual identifier is not valid for the identifier type.
    #[error("{0}")]
    Invalid(String),

    /// Indicates that the identifier type has no default textual form.
    #[error("No ID conversion available for {0}")]
    NotImplemented(&'static str),
}

/// Result type for this module.
pub type IdResult<T> = Result<T, IdError>;

/// Type of the function that renders an identifier.
type FormatFn<I> = dyn Fn(&I) -> IdResult<String> + Send + Sync;

/// Type of the function that parses an identifier.
type ParseFn<I> = dyn Fn(&str) -> IdResult<I> + Send + Sync;

/// Renders identifiers of type `I` into path segments and parses them back.
///
/// The default converter supports `String` and the signed integer types, using base 10 for the
/// latter.  Any other type must provide its own functions, for example with `from_str_display`.
pub struct IdConverter<I> {
    /// Identifier to text conversion.
    format: Arc<FormatFn<I>>,

    /// Text to identifier conversion.
    parse: Arc<ParseFn<I>>,
}

impl<I> Clone for IdConverter<I> {
    fn clone(&self) -> Self {
        Self { format: self.format.clone(), parse: self.parse.clone() }
    }
}

impl<I> IdConverter<I> {
    /// Creates a converter from a pair of conversion functions.
    pub fn new<F, P>(format: F, parse: P) -> Self
    where
        F: Fn(&I) -> IdResult<String> + Send + Sync + 'static,
        P: Fn(&str) -> IdResult<I> + Send + Sync + 'static,
    {
        Self { format: Arc::new(format), parse: Arc::new(parse) }
    }

    /// Renders `id` as text.
    pub fn format(&self, id: &I) -> IdResult<String> {
        (self.format)(id)
    }

    /// Parses `raw` into an identifier.
    pub fn parse(&self, raw: &str) -> IdResult<I> {
        (self.parse)(raw)
    }
}

impl<I> IdConverter<I>
where
    I: FromStr + fmt::Display + 'static,
    I::Err: fmt::Display,
{
    /// Creates a converter that relies on the `FromStr` and `Display` implementations of `I`.
    pub fn from_str_display() -> Self {
        Self::new(
            |id: &I| Ok(id.to_string()),
            |raw| raw.parse::<I>().map_err(|e| IdError::Invalid(e.to_string())),
        )
    }
}

impl<I: 'static> Default for IdConverter<I> {
    fn default() -> Self {
        Self::new(format_by_kind::<I>, parse_by_kind::<I>)
    }
}

/// Renders `id` based on its runtime type.
fn format_by_kind<I: 'static>(id: &I) -> IdResult<String> {
    let id = id as &dyn Any;
    if let Some(id) = id.downcast_ref::<String>() {
        return Ok(id.clone());
    }

    macro_rules! format_int {
        ( $($ty:ty),* ) => {
            $(
                if let Some(id) = id.downcast_ref::<$ty>() {
                    return Ok(id.to_string());
                }
            )*
        }
    }
    format_int!(i8, i16, i32, i64, i128, isize);

    Err(IdError::NotImplemented(type_name::<I>()))
}

/// Parses `raw` into an identifier based on the runtime type `I`.
fn parse_by_kind<I: 'static>(raw: &str) -> IdResult<I> {
    let id: Box<dyn Any> = if TypeId::of::<I>() == TypeId::of::<String>() {
        Box::new(raw.to_owned())
    } else {
        macro_rules! parse_int {
            ( $($ty:ty),* ) => {
                'parsed: {
                    $(
                        if TypeId::of::<I>() == TypeId::of::<$ty>() {
                            let id = raw.parse::<$ty>().map_err(|e| {
                                IdError::Invalid(format!("Invalid {} '{}': {}", stringify!($ty), raw, e))
                            })?;
                            break 'parsed Box::new(id) as Box<dyn Any>;
                        }
                    )*
                    return Err(IdError::NotImplemented(type_name::<I>()));
                }
            }
        }
        parse_int!(i8, i16, i32, i64, i128, isize)
    };

    id.downcast::<I>().map(|id| *id).map_err(|_| IdError::NotImplemented(type_name::<I>()))
}

/// Type of the function that extracts the identifier of an entity.
type GetIdFn<E, I> = dyn Fn(&E) -> Option<I> + Send + Sync;

/// Type of the function that assigns the identifier of an entity.
type SetIdFn<E, I> = dyn Fn(&mut E, I) -> IdResult<()> + Send + Sync;

/// Reads and writes the identifier of an entity.
pub struct IdAccessor<E, I> {
    /// Getter for the identifier.
    get: Arc<GetIdFn<E, I>>,

    /// Setter for the identifier.
    set: Arc<SetIdFn<E, I>>,
}

impl<E, I> Clone for IdAccessor<E, I> {
    fn clone(&self) -> Self {
        Self { get: self.get.clone(), set: self.set.clone() }
    }
}

impl<E, I> IdAccessor<E, I> {
    /// Creates an accessor from a getter and a setter.
    pub fn new<G, S>(get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<I> + Send + Sync + 'static,
        S: Fn(&mut E, I) -> IdResult<()> + Send + Sync + 'static,
    {
        Self { get: Arc::new(get), set: Arc::new(set) }
    }

    /// Returns the identifier of `entity`, if it has one.
    pub fn get(&self, entity: &E) -> Option<I> {
        (self.get)(entity)
    }

    /// Sets the identifier of `entity` to `id`.
    pub fn set(&self, entity: &mut E, id: I) -> IdResult<()> {
        (self.set)(entity, id)
    }
}

impl<E, I> IdAccessor<E, I>
where
    E: Serialize + DeserializeOwned,
    I: Serialize + DeserializeOwned,
{
    /// Creates an accessor that manipulates the serialized field `name` of the entity.
    ///
    /// A missing or null field means that the entity has no identifier.
    pub fn by_field(name: &'static str) -> Self {
        Self::new(
            move |entity: &E| {
                let value = serde_json::to_value(entity).ok()?;
                let id = value.get(name)?;
                if id.is_null() {
                    return None;
                }
                serde_json::from_value(id.clone()).ok()
            },
            move |entity: &mut E, id: I| {
                let mut value = serde_json::to_value(&*entity)
                    .map_err(|e| IdError::Invalid(e.to_string()))?;
                let Some(fields) = value.as_object_mut() else {
                    return Err(IdError::Invalid(format!(
                        "Cannot set field {} in a non-object entity",
                        name
                    )));
                };
                let id = serde_json::to_value(id).map_err(|e| IdError::Invalid(e.to_string()))?;
                fields.insert(name.to_owned(), id);
                *entity = serde_json::from_value(value).map_err(|e| IdError::Invalid(e.to_string()))?;
                Ok(())
            },
        )
    }
}
