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

//! JSON codec whose lists are newline-delimited sequences of values.

use super::json::{JsonCodec, encode_value, next_value};
use super::{Codec, CodecResult, ListDecoder, ListEncoder, StreamingCodec};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

/// Codec for `application/x-ndjson` and its aliases.
///
/// Single documents are plain JSON.
#[derive(Default)]
pub struct JsonStreamCodec {
    /// Codec for single documents.
    single: JsonCodec,
}

impl Codec for JsonStreamCodec {
    fn marshal(&self, value: &Value) -> CodecResult<Bytes> {
        self.single.marshal(value)
    }

    fn unmarshal(&self, data: &[u8]) -> CodecResult<Value> {
        self.single.unmarshal(data)
    }

    fn streaming(&self) -> Option<&dyn StreamingCodec> {
        Some(self)
    }
}

impl StreamingCodec for JsonStreamCodec {
    fn list_encoder(&self) -> Box<dyn ListEncoder> {
        Box::new(LinesEncoder {})
    }

    fn list_decoder(&self) -> Box<dyn ListDecoder> {
        Box::new(LinesDecoder {})
    }
}

/// Writes one JSON value per line.  Lists have no framing.
struct LinesEncoder {}

impl ListEncoder for LinesEncoder {
    fn encode(&mut self, value: &Value, dst: &mut BytesMut) -> CodecResult<()> {
        let encoded = encode_value(value)?;
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }

    fn close(&mut self, _dst: &mut BytesMut) {}
}

/// Reads whitespace-separated JSON values.
struct LinesDecoder {}

impl ListDecoder for LinesDecoder {
    fn decode(&mut self, src: &mut BytesMut) -> CodecResult<Option<Value>> {
        next_value(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> CodecResult<Option<Value>> {
        next_value(src, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_list;
    use serde_json::json;

    #[test]
    fn test_list_encoder() {
        let mut encoder = JsonStreamCodec::default().list_encoder();
        let mut dst = BytesMut::new();
        encoder.close(&mut dst);
        assert!(dst.is_empty());

        encoder.encode(&json!({"a": 1}), &mut dst).unwrap();
        encoder.encode(&json!(2), &mut dst).unwrap();
        encoder.close(&mut dst);
        assert_eq!("{\"a\":1}\n2\n", String::from_utf8(dst.to_vec()).unwrap());
    }

    #[test]
    fn test_list_decoder_partial_lines() {
        let mut decoder = JsonStreamCodec::default().list_decoder();
        let mut src = BytesMut::from(&b"{\"a\":1}\n{\"b\""[..]);
        assert_eq!(Some(json!({"a": 1})), decoder.decode(&mut src).unwrap());
        assert_eq!(None, decoder.decode(&mut src).unwrap());

        src.put_slice(b":2}\n3");
        assert_eq!(Some(json!({"b": 2})), decoder.decode(&mut src).unwrap());
        assert_eq!(None, decoder.decode(&mut src).unwrap());
        assert_eq!(Some(json!(3)), decoder.decode_eof(&mut src).unwrap());
        assert_eq!(None, decoder.decode_eof(&mut src).unwrap());
    }

    #[test]
    fn test_list_decoder_errors() {
        let mut decoder = JsonStreamCodec::default().list_decoder();
        decode_list(decoder.as_mut(), b"{\"a\":1}\n{").unwrap_err();

        let mut decoder = JsonStreamCodec::default().list_decoder();
        decode_list(decoder.as_mut(), b"1\n]").unwrap_err();
    }

    #[test]
    fn test_list_decoder_empty() {
        let mut decoder = JsonStreamCodec::default().list_decoder();
        assert!(decode_list(decoder.as_mut(), b"").unwrap().is_empty());
        let mut decoder = JsonStreamCodec::default().list_decoder();
        assert!(decode_list(decoder.as_mut(), b"\n \n").unwrap().is_empty());
    }
}
