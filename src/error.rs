//! Request-level error taxonomy.
//!
//! Transport-level failures (malformed, oversized, unauthenticated frames)
//! are dropped and counted at ingress; they never surface here. Only the
//! first three variants terminate a request and reach the façade.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// The verifier model adapter failed; fatal for the request.
    #[error("verifier model failed: {0}")]
    VerifierFatal(String),

    /// The façade cancelled the request (or dropped the token stream).
    #[error("request cancelled")]
    Cancelled,

    /// The request exceeded its wall budget.
    #[error("request wall budget exceeded")]
    Timeout,

    /// Pub/sub is unusable; the loop degrades to local-only generation
    /// rather than surfacing this to the caller.
    #[error("transport unavailable")]
    TransportDown,
}
