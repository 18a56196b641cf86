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

//! JSON codec whose lists are regular JSON arrays.

use super::{Codec, CodecError, CodecResult, ListDecoder, ListEncoder, StreamingCodec};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

/// Drops any leading JSON whitespace from `src`.
fn skip_whitespace(src: &mut BytesMut) {
    let n = src.iter().take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r')).count();
    src.advance(n);
}

/// Consumes one complete JSON value from the front of `src`, skipping leading whitespace.
///
/// Returns `None` if `src` does not hold a complete value yet.  A number that runs until the end
/// of the buffer is only considered complete at `eof` because more digits may still arrive.
pub(super) fn next_value(src: &mut BytesMut, eof: bool) -> CodecResult<Option<Value>> {
    skip_whitespace(src);
    if src.is_empty() {
        return Ok(None);
    }

    let (value, offset) = {
        let mut values = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => (value, values.byte_offset()),
            Some(Err(e)) if e.is_eof() && !eof => return Ok(None),
            Some(Err(e)) => return Err(CodecError::Decode(e.to_string())),
            None => return Ok(None),
        }
    };
    if offset == src.len() && !eof && value.is_number() {
        return Ok(None);
    }
    src.advance(offset);
    Ok(Some(value))
}

/// Serializes `value` as JSON.  List encoders serialize before touching their output so that a
/// failure never leaves a partial element behind.
pub(super) fn encode_value(value: &Value) -> CodecResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Codec for `application/json`.
#[derive(Default)]
pub struct JsonCodec {}

impl Codec for JsonCodec {
    fn marshal(&self, value: &Value) -> CodecResult<Bytes> {
        encode_value(value).map(Bytes::from)
    }

    fn unmarshal(&self, data: &[u8]) -> CodecResult<Value> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn streaming(&self) -> Option<&dyn StreamingCodec> {
        Some(self)
    }
}

impl StreamingCodec for JsonCodec {
    fn list_encoder(&self) -> Box<dyn ListEncoder> {
        Box::new(ArrayEncoder::default())
    }

    fn list_decoder(&self) -> Box<dyn ListDecoder> {
        Box::new(ArrayDecoder::default())
    }
}

/// Encodes a list as a JSON array, emitting the opening bracket with the first element.
#[derive(Default)]
struct ArrayEncoder {
    /// Whether the opening bracket has been written.
    started: bool,

    /// Whether the closing bracket has been written.
    closed: bool,
}

impl ListEncoder for ArrayEncoder {
    fn encode(&mut self, value: &Value, dst: &mut BytesMut) -> CodecResult<()> {
        if self.closed {
            return Err(CodecError::Encode("List already closed".to_owned()));
        }
        let encoded = encode_value(value)?;
        dst.put_u8(if self.started { b',' } else { b'[' });
        dst.put_slice(&encoded);
        self.started = true;
        Ok(())
    }

    fn close(&mut self, dst: &mut BytesMut) {
        if self.closed {
            return;
        }
        if !self.started {
            dst.put_u8(b'[');
            self.started = true;
        }
        dst.put_u8(b']');
        self.closed = true;
    }
}

/// Position of an `ArrayDecoder` within the array.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum ArrayState {
    /// Waiting for the opening bracket.
    #[default]
    Start,

    /// After the opening bracket: expecting a value or the closing bracket.
    First,

    /// After a value: expecting a comma or the closing bracket.
    AfterValue,

    /// After a comma: expecting a value.
    BeforeValue,

    /// After the closing bracket.
    Done,
}

/// Decodes the elements of a JSON array as they arrive.
#[derive(Default)]
struct ArrayDecoder {
    /// Current position within the array.
    state: ArrayState,
}

impl ArrayDecoder {
    /// Common implementation of `decode` and `decode_eof`.
    fn next(&mut self, src: &mut BytesMut, eof: bool) -> CodecResult<Option<Value>> {
        loop {
            skip_whitespace(src);
            let Some(&byte) = src.first() else {
                if eof && self.state != ArrayState::Done {
                    return Err(CodecError::Decode("Unexpected end of JSON array".to_owned()));
                }
                return Ok(None);
            };

            match self.state {
                ArrayState::Start => {
                    if byte != b'[' {
                        return Err(CodecError::Decode(format!(
                            "Expected JSON array but found '{}'",
                            byte as char
                        )));
                    }
                    src.advance(1);
                    self.state = ArrayState::First;
                }

                ArrayState::First | ArrayState::AfterValue if byte == b']' => {
                    src.advance(1);
                    self.state = ArrayState::Done;
                }

                ArrayState::AfterValue => {
                    if byte != b',' {
                        return Err(CodecError::Decode(format!(
                            "Expected ',' or ']' but found '{}'",
                            byte as char
                        )));
                    }
                    src.advance(1);
                    self.state = ArrayState::BeforeValue;
                }

                ArrayState::First | ArrayState::BeforeValue => {
                    return match next_value(src, eof)? {
                        Some(value) => {
                            self.state = ArrayState::AfterValue;
                            Ok(Some(value))
                        }
                        None if eof => {
                            Err(CodecError::Decode("Unexpected end of JSON array".to_owned()))
                        }
                        None => Ok(None),
                    };
                }

                ArrayState::Done => {
                    return Err(CodecError::Decode(format!(
                        "Unexpected '{}' after JSON array",
                        byte as char
                    )));
                }
            }
        }
    }
}

impl ListDecoder for ArrayDecoder {
    fn decode(&mut self, src: &mut BytesMut) -> CodecResult<Option<Value>> {
        self.next(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> CodecResult<Option<Value>> {
        self.next(src, true)
    }
}
