//! Core value types shared across the mesh.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// SHA3-256 digest.
pub type Hash = [u8; 32];

/// Raw ML-DSA-65 public key bytes.
pub type PublicKey = Vec<u8>;

/// Detached ML-DSA-65 signature bytes.
pub type Signature = Vec<u8>;

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stable peer identity: SHA3-256 of the peer's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for logs: first 8 bytes, hex.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// Identifier of one completion request. Generated fresh per request;
/// rendered as hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn parse(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// One auction round is addressed by fingerprint plus broadcast sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuctionKey {
    pub fingerprint: Fingerprint,
    pub sequence: u32,
}

impl AuctionKey {
    pub fn new(fingerprint: Fingerprint, sequence: u32) -> Self {
        Self { fingerprint, sequence }
    }
}

impl fmt::Display for AuctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.fingerprint, self.sequence)
    }
}

/// A draft received from a scout for one auction round.
#[derive(Debug, Clone)]
pub struct Draft {
    pub peer_id: PeerId,
    pub sequence: u32,
    /// Candidate tokens as text; tokenised by the verifier on arrival.
    pub tokens: Vec<String>,
    pub latency_ms: f32,
    pub is_verification_answer: bool,
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One prompt message from the façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// The last user turn, used for verification-prompt classification.
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}
