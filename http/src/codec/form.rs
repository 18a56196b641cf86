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

//! HTML form codec for flat documents.

use super::{Codec, CodecError, CodecResult};
use bytes::Bytes;
use serde_json::{Map, Value};

/// Codec for `application/x-www-form-urlencoded`.
///
/// Only objects whose fields are scalars can be encoded.  Decoded fields are always strings and
/// `mapping::deserialize_dto` parses them into the field types of the target DTO.  Lists cannot be
/// encoded, which makes collections unavailable in this media type.
#[derive(Default)]
pub struct FormCodec {}

impl Codec for FormCodec {
    fn marshal(&self, value: &Value) -> CodecResult<Bytes> {
        let Value::Object(fields) = value else {
            return Err(CodecError::Encode("Only objects can be form-encoded".to_owned()));
        };

        let mut pairs = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let value = match value {
                Value::Null => String::new(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(CodecError::Encode(format!(
                        "Field {} is not a scalar and cannot be form-encoded",
                        key
                    )));
                }
            };
            pairs.push((key.as_str(), value));
        }

        serde_urlencoded::to_string(pairs)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn unmarshal(&self, data: &[u8]) -> CodecResult<Value> {
        let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(data)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let mut fields = Map::new();
        for (key, value) in pairs {
            fields.insert(key, Value::String(value));
        }
        Ok(Value::Object(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_marshal() {
        let codec = FormCodec::default();
        let bytes = codec.marshal(&json!({"a": "x y", "b": 3, "c": true, "d": null})).unwrap();
        assert_eq!("a=x+y&b=3&c=true&d=", String::from_utf8(bytes.to_vec()).unwrap());
    }

    #[test]
    fn test_marshal_errors() {
        let codec = FormCodec::default();
        codec.marshal(&json!([1, 2])).unwrap_err();
        codec.marshal(&json!({"a": {"b": 1}})).unwrap_err();
    }

    #[test]
    fn test_unmarshal() {
        let codec = FormCodec::default();
        assert_eq!(
            json!({"a": "x y", "b": "3"}),
            codec.unmarshal(b"a=x+y&b=3").unwrap()
        );
        assert_eq!(json!({}), codec.unmarshal(b"").unwrap());
    }

    #[test]
    fn test_not_streaming() {
        assert!(FormCodec::default().streaming().is_none());
    }
}
