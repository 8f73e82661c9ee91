//! Serialization adapter for opaque call arguments and results.
//!
//! The worker itself never inspects argument payloads; it carries them
//! as [`Blob`]s (base64 on the wire) and hands them to the guest
//! driver untouched. The JSON value helpers are the default codec used
//! by the driver protocol and by tests.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque adapter-encoded bytes, serialized as a base64 string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(encoded).map(Blob)
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Blob::from_base64(&encoded).map_err(D::Error::custom)
    }
}

/// Encode a JSON value into its transportable byte form.
pub fn encode_value(value: &serde_json::Value) -> serde_json::Result<Blob> {
    serde_json::to_vec(value).map(Blob)
}

/// Decode a transported payload back into a JSON value.
pub fn decode_value(blob: &Blob) -> serde_json::Result<serde_json::Value> {
    serde_json::from_slice(blob.as_bytes())
}
