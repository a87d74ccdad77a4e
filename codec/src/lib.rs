//! Payload codec: the bidirectional mapping between an in-memory call
//! specification (or a handler's return value) and the opaque byte blobs
//! the task store persists.
//!
//! This is the sole extension seam for alternative representations: the
//! store and the worker never look inside the bytes. Any [`Codec`] whose
//! round-trip is observationally faithful and whose failures surface as
//! [`CodecError`] is acceptable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A handler invocation as carried through the queue: the registered
/// handler name plus its positional and keyword arguments, and an optional
/// free-form context map for anything the producer wants to ride along.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSpec {
    pub handler: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub context: Map<String, Value>,
}

impl CallSpec {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

pub trait Codec: Send + Sync {
    fn encode_call(&self, call: &CallSpec) -> CodecResult<Vec<u8>>;
    fn decode_call(&self, raw: &[u8]) -> CodecResult<CallSpec>;
    fn encode_value(&self, value: &Value) -> CodecResult<Vec<u8>>;
    fn decode_value(&self, raw: &[u8]) -> CodecResult<Value>;
}

/// The default codec: plain JSON bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_call(&self, call: &CallSpec) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(call).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_call(&self, raw: &[u8]) -> CodecResult<CallSpec> {
        serde_json::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_value(&self, value: &Value) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_value(&self, raw: &[u8]) -> CodecResult<Value> {
        serde_json::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_round_trip() {
        let codec = JsonCodec;
        let mut kwargs = Map::new();
        kwargs.insert("retries".to_string(), json!(3));

        let call = CallSpec::new("resize_image")
            .with_args(vec![json!("s3://bucket/cat.png"), json!([640, 480])])
            .with_kwargs(kwargs);

        let raw = codec.encode_call(&call).unwrap();
        assert_eq!(codec.decode_call(&raw).unwrap(), call);
    }

    #[test]
    fn value_round_trip() {
        let codec = JsonCodec;
        for value in [
            Value::Null,
            json!(5),
            json!("text"),
            json!({"nested": {"list": [1, 2, 3]}}),
        ] {
            let raw = codec.encode_value(&value).unwrap();
            assert_eq!(codec.decode_value(&raw).unwrap(), value);
        }
    }

    #[test]
    fn empty_value_blob_is_accepted() {
        // An encoded value may legitimately be tiny; null is 4 bytes.
        let codec = JsonCodec;
        let raw = codec.encode_value(&Value::Null).unwrap();
        assert!(!raw.is_empty());
        assert_eq!(codec.decode_value(&raw).unwrap(), Value::Null);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let codec = JsonCodec;
        let err = codec.decode_call(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        let err = codec.decode_value(b"{truncated").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn missing_fields_default() {
        // Producers may omit kwargs/context entirely.
        let codec = JsonCodec;
        let call = codec.decode_call(br#"{"handler": "ping"}"#).unwrap();
        assert_eq!(call.handler, "ping");
        assert!(call.args.is_empty());
        assert!(call.kwargs.is_empty());
        assert!(call.context.is_empty());
    }
}
