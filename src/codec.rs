//! Key and value codecs.
//!
//! Keys and values cross the message bus as opaque byte strings; the endpoint
//! never inspects them. A [`Codec`] pair (one for keys, one for values) is
//! supplied when a storage is built. [`BincodeCodec`] covers any
//! serde-serializable type and is the default choice.

use crate::error::CodecError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Encodes and decodes one side (keys or values) of a storage's entries.
pub trait Codec<T>: Send + Sync {
    /// Encode a value to bytes.
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Decode a value from bytes.
    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// Bincode-backed codec for serde-serializable types.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Create a new bincode codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BincodeCodec").finish()
    }
}

impl<T> Codec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let codec = BincodeCodec::<String>::new();
        let encoded = codec.encode(&"hello".to_string()).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = BincodeCodec::<u64>::new();
        assert!(codec.decode(&[0xff]).is_err());
    }
}
