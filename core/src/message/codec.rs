// Envelope codec: JSON wire format with size limits to prevent abuse

use super::types::{Envelope, EnvelopeKind};
use serde_json::Value;
use thiserror::Error;

/// Maximum encoded envelope size: 256 KB
/// This prevents memory exhaustion from malicious oversized frames.
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;

/// Maximum plaintext accepted for a DATA payload: 64 KB
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("Unknown envelope kind: {0}")]
    UnknownKind(String),
}

/// Serialize an Envelope to wire bytes.
///
/// Envelopes hold only strings, integers and byte vectors, so serialization
/// cannot fail for any value of the type.
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    serde_json::to_vec(envelope).unwrap_or_default()
}

/// Deserialize wire bytes to an Envelope
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(DecodeError::Malformed(format!(
            "envelope too large: {} bytes (max {})",
            bytes.len(),
            MAX_ENVELOPE_SIZE
        )));
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decode an already parsed JSON object.
///
/// The kind is checked before the rest of the shape so that a well-formed
/// frame of a newer kind is reported as `UnknownKind`, not `Malformed`.
pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("envelope is not an object".to_string()))?;

    let kind = match object.get("kind") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(DecodeError::Malformed("kind is not a string".to_string())),
        None => return Err(DecodeError::Malformed("missing field `kind`".to_string())),
    };

    if !EnvelopeKind::WIRE_NAMES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}
