//! Model adapters.
//!
//! Both model roles are polymorphic over a small sealed set of backends
//! selected at startup from configuration:
//!
//! - `deterministic` / `deterministic:<seed>` — the seeded fallback
//! - `remote:<addr>` — a stub speaking to an external model server
//!
//! Verifier calls are CPU-heavy, so [`VerifierHandle`] runs them on the
//! blocking worker pool and is the only way the async side touches C1.

pub mod deterministic;
pub mod drafter;
pub mod remote;
pub mod verifier;

pub use deterministic::{DeterministicDrafter, DeterministicVerifier};
pub use drafter::DrafterModel;
pub use remote::{RemoteDrafter, RemoteVerifier};
pub use verifier::{ModelError, PrefixVerdict, VerifierModel};

use std::sync::Arc;
use thiserror::Error;

const DEFAULT_SEED: u64 = 0xD06F00D;

#[derive(Error, Debug)]
pub enum BackendSpecError {
    #[error("unknown model backend '{0}' (expected 'deterministic[:<seed>]' or 'remote:<addr>')")]
    Unknown(String),
    #[error("bad backend argument in '{0}': {1}")]
    BadArgument(String, String),
}

/// Build a verifier backend from its configuration string.
pub fn build_verifier(spec: &str) -> Result<Arc<dyn VerifierModel>, BackendSpecError> {
    match parse_spec(spec)? {
        Backend::Deterministic(seed) => Ok(Arc::new(DeterministicVerifier::with_seed(seed))),
        Backend::Remote(addr) => Ok(Arc::new(RemoteVerifier::new(addr))),
    }
}

/// Build a drafter backend from its configuration string.
pub fn build_drafter(spec: &str) -> Result<Arc<dyn DrafterModel>, BackendSpecError> {
    match parse_spec(spec)? {
        Backend::Deterministic(seed) => Ok(Arc::new(DeterministicDrafter::with_seed(seed))),
        Backend::Remote(addr) => Ok(Arc::new(RemoteDrafter::new(addr))),
    }
}

enum Backend {
    Deterministic(u64),
    Remote(std::net::SocketAddr),
}

fn parse_spec(spec: &str) -> Result<Backend, BackendSpecError> {
    if spec == "deterministic" {
        return Ok(Backend::Deterministic(DEFAULT_SEED));
    }
    if let Some(seed) = spec.strip_prefix("deterministic:") {
        let seed = seed
            .parse()
            .map_err(|e| BackendSpecError::BadArgument(spec.to_string(), format!("{}", e)))?;
        return Ok(Backend::Deterministic(seed));
    }
    if let Some(addr) = spec.strip_prefix("remote:") {
        let addr = addr
            .parse()
            .map_err(|e| BackendSpecError::BadArgument(spec.to_string(), format!("{}", e)))?;
        return Ok(Backend::Remote(addr));
    }
    Err(BackendSpecError::Unknown(spec.to_string()))
}

/// Runs verifier calls on the blocking worker pool.
#[derive(Clone)]
pub struct VerifierHandle {
    inner: Arc<dyn VerifierModel>,
}

impl VerifierHandle {
    pub fn new(inner: Arc<dyn VerifierModel>) -> Self {
        Self { inner }
    }

    pub async fn tokenise(&self, text: String) -> Result<Vec<String>, ModelError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.tokenise(&text))
            .await
            .map_err(|_| ModelError::Worker)
    }

    pub async fn extend(&self, context: Vec<String>, n: usize) -> Result<Vec<String>, ModelError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.extend(&context, n))
            .await
            .map_err(|_| ModelError::Worker)?
    }

    pub async fn verify_prefix(
        &self,
        context: Vec<String>,
        draft: Vec<String>,
        fuzzy_top_k: usize,
    ) -> Result<PrefixVerdict, ModelError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.verify_prefix(&context, &draft, fuzzy_top_k))
            .await
            .map_err(|_| ModelError::Worker)?
    }

    pub fn stop_tokens(&self) -> Vec<String> {
        self.inner.stop_tokens()
    }

    pub fn id_for(&self, token: &str) -> u64 {
        self.inner.id_for(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        assert!(build_verifier("deterministic").is_ok());
        assert!(build_verifier("deterministic:99").is_ok());
        assert!(build_drafter("remote:127.0.0.1:9000").is_ok());
        assert!(build_verifier("llama").is_err());
        assert!(build_verifier("remote:notanaddr").is_err());
        assert!(build_drafter("deterministic:notanumber").is_err());
    }

    #[tokio::test]
    async fn handle_runs_on_worker_pool() {
        let handle = VerifierHandle::new(Arc::new(DeterministicVerifier::with_seed(1)));
        let tokens = handle.tokenise("a b c".into()).await.unwrap();
        assert_eq!(tokens.len(), 3);
        let next = handle.extend(tokens, 2).await.unwrap();
        assert_eq!(next.len(), 2);
    }
}
