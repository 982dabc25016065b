//! Serializer contract used for snapshot payloads.

use serde::{Serialize, de::DeserializeOwned};

/// Converts values to and from bytes.
pub trait Codec: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns a codec-specific error when `value` cannot be encoded.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error>;

    /// # Errors
    ///
    /// Returns a codec-specific error when `bytes` do not decode as `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_rejects_mismatched_payload() {
        let bytes = JsonCodec.serialize(&"not a number").unwrap();
        assert!(JsonCodec.deserialize::<u32>(&bytes).is_err());
    }
}
