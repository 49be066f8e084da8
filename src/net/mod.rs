//! Mesh networking layer.

pub mod handshake;
pub mod message;
pub mod rate_limit;
pub mod registry;
pub mod serde_safe;
pub mod transport;
pub mod types;

pub use handshake::{reconnect_loop, RetryInfo};
pub use message::{DraftTokens, EnvelopeError, Frame, SignedEnvelope, WorkRequest, WorkResult};
pub use rate_limit::{IngressAbuseLimiter, TokenBucket};
pub use registry::{PeerRecord, PeerRegistry, RegistryStats, MAX_HANDSHAKE_FAILURES};
pub use serde_safe::{from_bytes, to_bytes, BoundedBytes, BoundedString, BoundedVec};
pub use transport::{Transport, TransportChannels, TransportStats};
pub use types::{
    Topic, DEFAULT_PORT, MAX_DRAFT_TOKENS, MAX_DRAFT_TOKENS_BYTES, MAX_FRAME_SIZE,
    MAX_OUTBOUND_QUEUED_BYTES, MAX_PROMPT_CONTEXT_BYTES, MAX_TOKEN_BYTES, PROTOCOL_VERSION,
};
