//! Wire constants for the mesh protocol.
//!
//! All messages and collections carry explicit size limits so a peer cannot
//! exhaust memory by sending large or many frames. Limits are enforced at
//! deserialization time by the bounded containers in `serde_safe`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version number. Increment on breaking wire format changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default TCP port for a shard node.
pub const DEFAULT_PORT: u16 = 7311;

/// Hard cap on any single frame, including the work/result records.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Per-peer outbound queue bound; overflow drops the oldest frame.
pub const MAX_OUTBOUND_QUEUED_BYTES: usize = 2 * 1024 * 1024;

/// `prompt_context` cap inside a WorkRequest.
pub const MAX_PROMPT_CONTEXT_BYTES: usize = 8 * 1024;

/// Draft token list length cap inside a WorkResult.
pub const MAX_DRAFT_TOKENS: usize = 32;

/// Total bytes across all draft tokens in one WorkResult.
pub const MAX_DRAFT_TOKENS_BYTES: usize = 32 * 1024;

/// A single draft token rendered as text.
pub const MAX_TOKEN_BYTES: usize = 1024;

/// Request id rendered as hex (16 bytes -> 32 chars).
pub const MAX_REQUEST_ID_LEN: usize = 64;

/// ML-DSA-65 detached signature upper bound.
pub const MAX_SIGNATURE_BYTES: usize = 4 * 1024;

/// ML-DSA-65 public key upper bound.
pub const MAX_PUBKEY_BYTES: usize = 2 * 1024;

/// The two pub/sub topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Work,
    WorkResult,
}

impl Topic {
    /// Wire name, as pinned by the protocol.
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Work => "shard-work",
            Topic::WorkResult => "shard-work-result",
        }
    }

    /// Single byte mixed into the signature preimage.
    pub fn byte(&self) -> u8 {
        match self {
            Topic::Work => 0,
            Topic::WorkResult => 1,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wire_names_are_pinned() {
        assert_eq!(Topic::Work.name(), "shard-work");
        assert_eq!(Topic::WorkResult.name(), "shard-work-result");
        assert_ne!(Topic::Work.byte(), Topic::WorkResult.byte());
    }
}
