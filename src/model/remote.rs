//! Remote model stubs.
//!
//! Thin clients speaking length-delimited postcard over TCP to an external
//! model server (the heavy model itself is an external collaborator). Calls
//! are blocking and run on the worker pool like every other model call; each
//! call uses a fresh connection so the stub carries no session state.

use super::drafter::DrafterModel;
use super::verifier::{ModelError, PrefixVerdict, VerifierModel};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
enum ModelRequest {
    Tokenise { text: String },
    Extend { context: Vec<String>, n: u32 },
    VerifyPrefix { context: Vec<String>, draft: Vec<String>, top_k: u32 },
    StopTokens,
    Draft { context: String, k: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
enum ModelResponse {
    Tokens(Vec<String>),
    Verdict { accepted: Vec<String>, correction: Option<String> },
    Error(String),
}

fn call(addr: SocketAddr, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
    let backend = |e: std::io::Error| ModelError::Backend(e.to_string());

    let mut stream = TcpStream::connect_timeout(&addr, CALL_TIMEOUT).map_err(backend)?;
    stream.set_read_timeout(Some(CALL_TIMEOUT)).map_err(backend)?;
    stream.set_write_timeout(Some(CALL_TIMEOUT)).map_err(backend)?;

    let body = postcard::to_allocvec(request).map_err(|e| ModelError::Backend(e.to_string()))?;
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .and_then(|_| stream.write_all(&body))
        .map_err(backend)?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).map_err(backend)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RESPONSE_SIZE {
        return Err(ModelError::Backend(format!("response of {} bytes over cap", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).map_err(backend)?;

    match postcard::from_bytes(&buf).map_err(|e| ModelError::Backend(e.to_string()))? {
        ModelResponse::Error(message) => Err(ModelError::Backend(message)),
        response => Ok(response),
    }
}

fn expect_tokens(response: ModelResponse) -> Result<Vec<String>, ModelError> {
    match response {
        ModelResponse::Tokens(tokens) => Ok(tokens),
        other => Err(ModelError::Backend(format!("unexpected response: {:?}", other))),
    }
}

/// Verifier backed by a remote model server.
pub struct RemoteVerifier {
    addr: SocketAddr,
}

impl RemoteVerifier {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl VerifierModel for RemoteVerifier {
    fn tokenise(&self, text: &str) -> Vec<String> {
        call(self.addr, &ModelRequest::Tokenise { text: text.to_string() })
            .and_then(expect_tokens)
            .unwrap_or_else(|e| {
                debug!("remote tokenise failed, falling back to whitespace: {}", e);
                text.split_whitespace().map(str::to_string).collect()
            })
    }

    fn extend(&self, context: &[String], n: usize) -> Result<Vec<String>, ModelError> {
        expect_tokens(call(
            self.addr,
            &ModelRequest::Extend { context: context.to_vec(), n: n as u32 },
        )?)
    }

    fn verify_prefix(
        &self,
        context: &[String],
        draft: &[String],
        fuzzy_top_k: usize,
    ) -> Result<PrefixVerdict, ModelError> {
        match call(
            self.addr,
            &ModelRequest::VerifyPrefix {
                context: context.to_vec(),
                draft: draft.to_vec(),
                top_k: fuzzy_top_k as u32,
            },
        )? {
            ModelResponse::Verdict { accepted, correction } => {
                Ok(PrefixVerdict { accepted, correction })
            }
            other => Err(ModelError::Backend(format!("unexpected response: {:?}", other))),
        }
    }

    fn stop_tokens(&self) -> Vec<String> {
        call(self.addr, &ModelRequest::StopTokens)
            .and_then(expect_tokens)
            .unwrap_or_default()
    }

    fn id_for(&self, token: &str) -> u64 {
        let digest = crate::crypto::sha3(token.as_bytes());
        u64::from_le_bytes(digest[..8].try_into().unwrap())
    }
}

/// Drafter backed by a remote model server.
pub struct RemoteDrafter {
    addr: SocketAddr,
}

impl RemoteDrafter {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl DrafterModel for RemoteDrafter {
    fn draft(&self, prompt_context: &str, k: usize) -> Vec<String> {
        // Best-effort: any failure is silence, not an error.
        call(
            self.addr,
            &ModelRequest::Draft { context: prompt_context.to_string(), k: k as u32 },
        )
        .and_then(expect_tokens)
        .unwrap_or_default()
    }
}
