//! JSON encoding applied by channels before hand-off to the transport.

use serde::Serialize;
use serde::de::DeserializeOwned;
use servolink_types::LinkError;

use crate::transport::Payload;

pub fn encode<T: Serialize>(msg: &T) -> Result<Payload, LinkError> {
    serde_json::to_vec(msg)
        .map(Payload::from)
        .map_err(|e| LinkError::Codec(format!("encode failed: {e}")))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, LinkError> {
    serde_json::from_slice(payload).map_err(|e| LinkError::Codec(format!("decode failed: {e}")))
}
