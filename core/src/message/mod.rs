// Message module: envelope types and wire codec

pub mod types;
pub mod codec;

pub use types::{
    new_message_id, now_ms, EncryptedPayload, Envelope, EnvelopeBody, EnvelopeKind,
    DEFAULT_MAX_HOPS,
};
pub use codec::{decode_envelope, decode_value, encode_envelope, DecodeError, MAX_ENVELOPE_SIZE, MAX_PAYLOAD_SIZE};
