use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SerializeKind;
use crate::protocol::error::Result;
use crate::protocol::{Request, Response};

/// Codec for encoding/decoding RPC message bodies.
///
/// The variant is chosen once at startup from [`SerializeKind`] and shared by
/// every connection of a server or client; it is never negotiated per call.
///
/// # Example
///
/// ```
/// use warprpc_common::config::SerializeKind;
/// use warprpc_common::protocol::{Request, RpcValue};
/// use warprpc_common::transport::Codec;
///
/// let codec = Codec::new(SerializeKind::Binary);
/// let request = Request::new(1, "Echo", "echo", vec![RpcValue::from("hi")]);
///
/// let encoded = codec.encode_request(&request).unwrap();
/// let decoded = codec.decode_request(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Compact postcard encoding
    Binary(BinaryCodec),
    /// JSON encoding, readable and usable from other languages
    Json(JsonCodec),
}

impl Codec {
    pub fn new(kind: SerializeKind) -> Self {
        match kind {
            SerializeKind::Binary => Codec::Binary(BinaryCodec),
            SerializeKind::Json => Codec::Json(JsonCodec),
        }
    }

    pub fn kind(&self) -> SerializeKind {
        match self {
            Codec::Binary(_) => SerializeKind::Binary,
            Codec::Json(_) => SerializeKind::Json,
        }
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Binary(_) => BinaryCodec::serialize(value),
            Codec::Json(_) => JsonCodec::serialize(value),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::Binary(_) => BinaryCodec::deserialize(data),
            Codec::Json(_) => JsonCodec::deserialize(data),
        }
    }

    pub fn encode_request(&self, request: &Request) -> Result<Vec<u8>> {
        self.serialize(request)
    }

    pub fn decode_request(&self, data: &[u8]) -> Result<Request> {
        self.deserialize(data)
    }

    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        self.serialize(response)
    }

    pub fn decode_response(&self, data: &[u8]) -> Result<Response> {
        self.deserialize(data)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(SerializeKind::default())
    }
}

/// Postcard codec.
///
/// Postcard is not self-describing, which is why requests carry explicit
/// argument type descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(value)?)
    }

    pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(postcard::from_bytes(data)?)
    }
}

/// JSON codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorKind, RpcValue};
    use std::collections::BTreeMap;

    fn sample_request() -> Request {
        let mut nested = BTreeMap::new();
        nested.insert("array".to_string(), RpcValue::List(vec![
            RpcValue::Int(1),
            RpcValue::Str("four".to_string()),
            RpcValue::Null,
        ]));
        nested.insert("number".to_string(), RpcValue::Float(42.5));
        nested.insert("raw".to_string(), RpcValue::Bytes(vec![0, 1, 2, 255]));
        Request::new(
            77,
            "Complex",
            "complex_method",
            vec![RpcValue::Map(nested), RpcValue::Bool(true)],
        )
    }

    #[test]
    fn test_binary_codec_complex_request() {
        let codec = Codec::new(SerializeKind::Binary);
        let request = sample_request();
        let decoded = codec.decode_request(&codec.encode_request(&request).unwrap()).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_json_codec_complex_request() {
        let codec = Codec::new(SerializeKind::Json);
        let request = sample_request();
        let decoded = codec.decode_request(&codec.encode_request(&request).unwrap()).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_error_response_survives_both_codecs() {
        let response = Response::error(5, ErrorKind::Dispatch, "Test error message");
        for kind in [SerializeKind::Binary, SerializeKind::Json] {
            let codec = Codec::new(kind);
            let decoded = codec.decode_response(&codec.encode_response(&response).unwrap()).unwrap();
            assert_eq!(response, decoded);
        }
    }

    #[test]
    fn test_json_output_is_readable() {
        let request = Request::new(1, "Echo", "echo", vec![RpcValue::from("hello")]);
        let encoded = JsonCodec::serialize(&request).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("\"service\":\"Echo\""));
        assert!(text.contains("hello"));
    }

    #[test]
    fn test_codec_kind() {
        assert_eq!(Codec::new(SerializeKind::Json).kind(), SerializeKind::Json);
        assert_eq!(Codec::new(SerializeKind::Binary).kind(), SerializeKind::Binary);
    }

    #[test]
    fn test_binary_garbage_is_serialization_error() {
        let codec = Codec::new(SerializeKind::Binary);
        let err = codec.decode_response(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_json_garbage_is_serialization_error() {
        let codec = Codec::new(SerializeKind::Json);
        let err = codec.decode_request(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
