//! Payload serialization.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{BusError, Result};

/// Encodes events to message bodies and back.
pub trait BusSerializer: Send + Sync + 'static {
    /// MIME type stamped on published messages.
    fn content_type(&self) -> &'static str;

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON bodies via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl BusSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))
    }
}
