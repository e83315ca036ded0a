use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::AppResult;

/// Pluggable payload (de)serialization strategy, selected once at startup
/// and captured by handler registrations. The trait is deliberately not
/// object safe; registration closures monomorphize against the concrete
/// implementation.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> AppResult<Bytes>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> AppResult<T>;
}

/// The default JSON strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> AppResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> AppResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
