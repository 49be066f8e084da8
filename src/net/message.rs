//! Frames and pub/sub records with bounded collections.
//!
//! Wire layout: every TCP frame is a u32 little-endian length prefix followed
//! by a postcard-encoded [`Frame`], capped at [`MAX_FRAME_SIZE`]. Published
//! records travel inside a [`SignedEnvelope`] whose detached ML-DSA-65
//! signature covers `[version, topic_byte] ++ payload`; the publisher id
//! embedded in the record must match the envelope key. This is the one
//! verifiable binding between message and publisher — the session layer adds
//! no second one.

use super::serde_safe::{BoundedBytes, BoundedString, BoundedVec};
use super::types::{
    Topic, MAX_DRAFT_TOKENS, MAX_DRAFT_TOKENS_BYTES, MAX_FRAME_SIZE, MAX_PROMPT_CONTEXT_BYTES,
    MAX_PUBKEY_BYTES, MAX_REQUEST_ID_LEN, MAX_SIGNATURE_BYTES, MAX_TOKEN_BYTES, PROTOCOL_VERSION,
};
use crate::crypto::{self, Keypair};
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DraftTokens = BoundedVec<BoundedString<MAX_TOKEN_BYTES>, MAX_DRAFT_TOKENS>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unsupported envelope version {0}")]
    Version(u8),
    #[error("signature check failed")]
    BadSignature,
    #[error("publisher id does not match signing key")]
    PublisherMismatch,
    #[error("record rejected: {0}")]
    BadRecord(&'static str),
}

/// Everything that crosses a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in both directions: identifies the peer.
    Hello {
        version: u8,
        pubkey: BoundedBytes<MAX_PUBKEY_BYTES>,
        listen_port: u16,
    },
    Ping {
        sent_at_ms: u64,
    },
    Pong {
        echo: u64,
        replied_at_ms: u64,
    },
    Publish {
        topic: Topic,
        envelope: SignedEnvelope,
    },
}

impl Frame {
    pub fn command(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Publish { .. } => "publish",
        }
    }

    pub fn allowed_pre_handshake(&self) -> bool {
        matches!(self, Frame::Hello { .. } | Frame::Ping { .. } | Frame::Pong { .. })
    }
}

/// A signed pub/sub record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub version: u8,
    pub publisher_pubkey: BoundedBytes<MAX_PUBKEY_BYTES>,
    pub payload: BoundedBytes<MAX_FRAME_SIZE>,
    pub signature: BoundedBytes<MAX_SIGNATURE_BYTES>,
}

fn signing_preimage(version: u8, topic: Topic, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.push(version);
    buf.push(topic.byte());
    buf.extend_from_slice(payload);
    buf
}

impl SignedEnvelope {
    pub fn seal(topic: Topic, payload: Vec<u8>, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&signing_preimage(PROTOCOL_VERSION, topic, &payload));
        Self {
            version: PROTOCOL_VERSION,
            publisher_pubkey: BoundedBytes::new_unchecked(keypair.public_key().clone()),
            payload: BoundedBytes::new_unchecked(payload),
            signature: BoundedBytes::new_unchecked(signature),
        }
    }

    /// Check version and signature; returns the publisher's peer id.
    pub fn verify(&self, topic: Topic) -> Result<PeerId, EnvelopeError> {
        if self.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::Version(self.version));
        }
        let preimage = signing_preimage(self.version, topic, &self.payload);
        crypto::verify(&self.publisher_pubkey, &preimage, &self.signature)
            .map_err(|_| EnvelopeError::BadSignature)?;
        Ok(crypto::peer_id_for(&self.publisher_pubkey))
    }
}

/// One auction round, published on `shard-work`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub request_id: BoundedString<MAX_REQUEST_ID_LEN>,
    pub sequence_id: u32,
    pub prompt_context: BoundedString<MAX_PROMPT_CONTEXT_BYTES>,
    pub min_tokens: u8,
    pub publisher_id: PeerId,
}

impl WorkRequest {
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.min_tokens == 0 || self.min_tokens as usize > MAX_DRAFT_TOKENS {
            return Err(EnvelopeError::BadRecord("min_tokens out of range"));
        }
        Ok(())
    }
}

/// A draft, published on `shard-work-result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub request_id: BoundedString<MAX_REQUEST_ID_LEN>,
    pub sequence_id: u32,
    pub peer_id: PeerId,
    pub draft_tokens: DraftTokens,
    pub latency_ms: f32,
    pub is_verification_answer: bool,
}

impl WorkResult {
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(EnvelopeError::BadRecord("negative latency"));
        }
        let total: usize = self.draft_tokens.iter().map(|t| t.as_str().len()).sum();
        if total > MAX_DRAFT_TOKENS_BYTES {
            return Err(EnvelopeError::BadRecord("draft tokens over size cap"));
        }
        Ok(())
    }
}
