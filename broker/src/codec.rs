use crate::errors::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Payload encoding agreed on by both ends of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    /// Binary record encoding. Named fields keep the records self-describing,
    /// so opaque values such as command parameters survive a round trip.
    MessagePack,
}

impl Encoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::MessagePack => "application/msgpack",
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(payload)?),
            Encoding::MessagePack => Ok(rmp_serde::from_slice(payload)?),
        }
    }
}
