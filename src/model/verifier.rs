//! Verifier model contract.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The backend itself failed. Fatal for the request using it.
    #[error("model backend failure: {0}")]
    Backend(String),
    /// The blocking worker running the call went away.
    #[error("model worker crashed")]
    Worker,
}

/// Outcome of verifying a draft against the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixVerdict {
    /// Longest draft prefix within the verifier's acceptance envelope.
    pub accepted: Vec<String>,
    /// The verifier's own token at the first mismatch position, if any.
    pub correction: Option<String>,
}

impl PrefixVerdict {
    pub fn accept_all(accepted: Vec<String>) -> Self {
        Self { accepted, correction: None }
    }

    pub fn diverge_at(accepted: Vec<String>, correction: String) -> Self {
        Self { accepted, correction: Some(correction) }
    }
}

/// The heavyweight model that commits tokens.
///
/// Calls are synchronous and potentially CPU-heavy; the node runs them on
/// the blocking worker pool via [`super::VerifierHandle`]. `extend` must be
/// deterministic given the context, which is what makes remote drafts
/// verifiable at all.
pub trait VerifierModel: Send + Sync {
    fn tokenise(&self, text: &str) -> Vec<String>;

    /// Produce the next `n` tokens after `context`.
    fn extend(&self, context: &[String], n: usize) -> Result<Vec<String>, ModelError>;

    /// Walk the draft from position 0, accepting while each draft token
    /// falls inside the verifier's top-`fuzzy_top_k` set at that position
    /// (k = 1 is strict argmax). On the first mismatch the verifier's own
    /// token is returned as the correction and the rest of the draft is
    /// discarded.
    fn verify_prefix(
        &self,
        context: &[String],
        draft: &[String],
        fuzzy_top_k: usize,
    ) -> Result<PrefixVerdict, ModelError>;

    fn stop_tokens(&self) -> Vec<String>;

    /// Stable token id, used only for equality checks.
    fn id_for(&self, token: &str) -> u64;
}
