// Envelope types, the unit of routing on the mesh
//
// DATA envelopes carry an encrypted payload; ACK and READ are control frames
// that reference a DATA envelope by id. All three share the hop/TTL/path
// fields so the router forwards them through the same path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default per-message hop budget
pub const DEFAULT_MAX_HOPS: u32 = 10;

/// Current unix time in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a fresh envelope id: creation time plus a random suffix.
pub fn new_message_id(now_ms: u64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", now_ms, &suffix[..12])
}

/// Which variant an envelope is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "DATA")]
    Data,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "READ")]
    Read,
}

impl EnvelopeKind {
    /// Wire names, in declaration order
    pub const WIRE_NAMES: [&'static str; 3] = ["DATA", "ACK", "READ"];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Data => "DATA",
            EnvelopeKind::Ack => "ACK",
            EnvelopeKind::Read => "READ",
        }
    }

    /// Control frames confirm a DATA envelope instead of carrying content
    pub fn is_control(&self) -> bool {
        !matches!(self, EnvelopeKind::Data)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypted payload of a DATA envelope.
///
/// Both fields travel as standard base64 strings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// ChaCha20-Poly1305 ciphertext including the 16-byte tag
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce, fresh for every encryption
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// Kind-specific part of an envelope, tagged by `kind` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EnvelopeBody {
    #[serde(rename = "DATA")]
    Data { payload: EncryptedPayload },
    #[serde(rename = "ACK", rename_all = "camelCase")]
    Ack { correlation_id: String },
    #[serde(rename = "READ", rename_all = "camelCase")]
    Read { correlation_id: String },
}

/// A routable envelope; what actually goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Globally unique id, immutable once created
    pub id: String,
    /// Originating device
    pub from: String,
    /// Destination device
    pub to: String,
    /// Creation time (unix ms), origin of the TTL
    pub created_at: u64,
    /// Relays traversed so far
    pub hop_count: u32,
    /// Hop budget fixed at creation
    pub max_hops: u32,
    /// Devices that already relayed this exact envelope
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    fn new(from: String, to: String, body: EnvelopeBody, max_hops: u32, now_ms: u64) -> Self {
        Self {
            id: new_message_id(now_ms),
            from,
            to,
            created_at: now_ms,
            hop_count: 0,
            max_hops,
            path: Vec::new(),
            body,
        }
    }

    /// Create a DATA envelope around an already encrypted payload
    pub fn data(
        from: String,
        to: String,
        payload: EncryptedPayload,
        max_hops: u32,
        now_ms: u64,
    ) -> Self {
        Self::new(from, to, EnvelopeBody::Data { payload }, max_hops, now_ms)
    }

    /// Create an ACK confirming receipt of `correlation_id`
    pub fn ack(from: String, to: String, correlation_id: String, max_hops: u32, now_ms: u64) -> Self {
        Self::new(from, to, EnvelopeBody::Ack { correlation_id }, max_hops, now_ms)
    }

    /// Create a READ confirming `correlation_id` was presented to the user
    pub fn read(from: String, to: String, correlation_id: String, max_hops: u32, now_ms: u64) -> Self {
        Self::new(from, to, EnvelopeBody::Read { correlation_id }, max_hops, now_ms)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.body {
            EnvelopeBody::Data { .. } => EnvelopeKind::Data,
            EnvelopeBody::Ack { .. } => EnvelopeKind::Ack,
            EnvelopeBody::Read { .. } => EnvelopeKind::Read,
        }
    }

    /// Payload of a DATA envelope
    pub fn payload(&self) -> Option<&EncryptedPayload> {
        match &self.body {
            EnvelopeBody::Data { payload } => Some(payload),
            _ => None,
        }
    }

    /// Id of the DATA envelope a control frame refers to
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.body {
            EnvelopeBody::Ack { correlation_id } | EnvelopeBody::Read { correlation_id } => {
                Some(correlation_id)
            }
            EnvelopeBody::Data { .. } => None,
        }
    }

    /// True once `created_at + ttl` lies strictly before `now_ms`
    pub fn is_expired(&self, ttl: Duration, now_ms: u64) -> bool {
        self.created_at.saturating_add(ttl.as_millis() as u64) < now_ms
    }

    /// True when no relay may forward this envelope any further
    pub fn hop_budget_exhausted(&self) -> bool {
        self.hop_count >= self.max_hops
    }

    /// Whether `device_id` already relayed this envelope
    pub fn relayed_by(&self, device_id: &str) -> bool {
        self.path.iter().any(|id| id == device_id)
    }

    /// The copy `relay_id` transmits: one more hop, relay appended to path.
    /// The original value is left untouched.
    pub fn next_hop(&self, relay_id: &str) -> Envelope {
        let mut next = self.clone();
        next.hop_count = next.hop_count.saturating_add(1);
        next.path.push(relay_id.to_string());
        next
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
