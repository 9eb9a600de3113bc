//! Pluggable serialization for persisted job messages.
//!
//! The scheduler never commits to a wire format: everything that reaches
//! the durable store goes through a [`Serializer`]. The default is plain
//! JSON; [`GzJsonSerializer`] trades CPU for smaller blobs when argument
//! payloads get large. Binary data inside a payload is carried as a
//! base64-tagged object so it survives the JSON round trip.

use crate::error::SerializeError;
use base64::Engine as _;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use std::io::{Read as _, Write as _};

/// Byte-oriented value serializer used for durable job records.
///
/// Implementations must round-trip the JSON value domain: null, booleans,
/// integers, floats, strings, ordered sequences, and string-keyed maps.
/// Raw bytes are represented with [`encode_bytes`] / [`decode_bytes`].
pub trait Serializer: Send + Sync {
    fn dumpb(&self, value: &Value) -> Result<Vec<u8>, SerializeError>;
    fn loadb(&self, bytes: &[u8]) -> Result<Value, SerializeError>;
}

/// Plain JSON serializer, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dumpb(&self, value: &Value) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(value).map_err(|error| SerializeError::Encode(error.to_string()))
    }

    fn loadb(&self, bytes: &[u8]) -> Result<Value, SerializeError> {
        serde_json::from_slice(bytes).map_err(|error| SerializeError::Decode(error.to_string()))
    }
}

/// Gzip-compressed JSON serializer.
#[derive(Debug, Clone, Copy)]
pub struct GzJsonSerializer {
    level: u32,
}

impl GzJsonSerializer {
    /// Compression level 0-9; the default is 6.
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for GzJsonSerializer {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl Serializer for GzJsonSerializer {
    fn dumpb(&self, value: &Value) -> Result<Vec<u8>, SerializeError> {
        let raw =
            serde_json::to_vec(value).map_err(|error| SerializeError::Encode(error.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish())
            .map_err(|error| SerializeError::Encode(error.to_string()))
    }

    fn loadb(&self, bytes: &[u8]) -> Result<Value, SerializeError> {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|error| SerializeError::Decode(error.to_string()))?;
        serde_json::from_slice(&raw).map_err(|error| SerializeError::Decode(error.to_string()))
    }
}

const BYTES_KEY: &str = "$bytes";

/// Encode raw bytes as a base64-tagged JSON object.
pub fn encode_bytes(data: &[u8]) -> Value {
    json!({ BYTES_KEY: base64::engine::general_purpose::STANDARD.encode(data) })
}

/// Decode a value produced by [`encode_bytes`]; `None` if it is not one.
pub fn decode_bytes(value: &Value) -> Option<Vec<u8>> {
    let encoded = value.as_object()?.get(BYTES_KEY)?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_values() -> Vec<Value> {
        vec![
            Value::Null,
            json!(true),
            json!(false),
            json!(123),
            json!(123.45),
            json!("hello"),
            json!([1, "a", null, [2, "b", true]]),
            json!({"a": 1, "b": null, "nested": {"c": [1, 2, 3]}}),
            encode_bytes(b"world"),
        ]
    }

    #[test]
    fn test_json_round_trip() {
        let serializer = JsonSerializer;
        for value in round_trip_values() {
            let encoded = serializer.dumpb(&value).unwrap();
            assert_eq!(serializer.loadb(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_gz_json_round_trip() {
        let serializer = GzJsonSerializer::default();
        for value in round_trip_values() {
            let encoded = serializer.dumpb(&value).unwrap();
            assert_eq!(serializer.loadb(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let value = encode_bytes(b"\x00\x01\xfe\xff");
        assert_eq!(decode_bytes(&value).unwrap(), b"\x00\x01\xfe\xff");
        assert_eq!(decode_bytes(&json!("plain string")), None);
    }

    #[test]
    fn test_loadb_rejects_garbage() {
        assert!(JsonSerializer.loadb(b"not json").is_err());
        assert!(GzJsonSerializer::default().loadb(b"not gzip").is_err());
    }
}
