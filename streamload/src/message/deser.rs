//! Decoding of input lines.

use crate::error::LoadError;

use super::model::ProtocolMessage;

/// Decodes one input line into a typed message.
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, line: &str) -> Result<T, LoadError>;
}

/// Decodes the JSON protocol envelope with `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDeserializer;

impl Deserializer<ProtocolMessage> for JsonDeserializer {
    fn deserialize(&self, line: &str) -> Result<ProtocolMessage, LoadError> {
        serde_json::from_str(line).map_err(|e| LoadError::Deserialize(e.to_string()))
    }
}
