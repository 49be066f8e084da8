//! Request façade adapter.
//!
//! The boundary between the HTTP/streaming layer (external) and the
//! speculative loop. A completion job goes in; tokens stream out of a
//! bounded channel (a slow consumer back-pressures the loop through it);
//! a terminal status arrives exactly once when the stream closes. Partial
//! output is never rolled back.

use crate::error::MeshError;
use crate::types::{ChatMessage, Fingerprint};
use tokio::sync::{mpsc, oneshot, watch};

/// Token sink depth; the loop blocks here when the consumer lags.
const SINK_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// 0 means "use the node cap".
    pub max_tokens: usize,
    pub stop_tokens: Vec<String>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: 0,
            stop_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    /// A stop token was emitted or the model signalled end-of-stream.
    Stop,
    /// The token cap was reached.
    Length,
    Error(MeshError),
}

/// Consumer side: stream tokens, then read the terminal status.
pub struct CompletionHandle {
    pub fingerprint: Fingerprint,
    tokens: mpsc::Receiver<String>,
    status: oneshot::Receiver<TerminalStatus>,
    cancel: watch::Sender<bool>,
}

impl CompletionHandle {
    /// Next streamed token; `None` once the loop reached a terminal state.
    pub async fn next_token(&mut self) -> Option<String> {
        self.tokens.recv().await
    }

    /// Ask the loop to stop at its next suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Drain the stream and return everything at once.
    pub async fn collect(mut self) -> (Vec<String>, TerminalStatus) {
        let mut tokens = Vec::new();
        while let Some(token) = self.tokens.recv().await {
            tokens.push(token);
        }
        let status = self
            .status
            .await
            .unwrap_or(TerminalStatus::Error(MeshError::Cancelled));
        (tokens, status)
    }

    /// Terminal status after the token stream has ended.
    pub async fn status(self) -> TerminalStatus {
        self.status
            .await
            .unwrap_or(TerminalStatus::Error(MeshError::Cancelled))
    }
}

/// Producer side, owned by the speculative loop.
pub struct CompletionEmitter {
    tokens: mpsc::Sender<String>,
    status: Option<oneshot::Sender<TerminalStatus>>,
    cancel: watch::Receiver<bool>,
}

impl CompletionEmitter {
    /// Deliver one token. Blocks when the sink is full; fails with
    /// `Cancelled` if the consumer went away or asked to stop.
    pub async fn emit(&mut self, token: &str) -> Result<(), MeshError> {
        if self.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let send = self.tokens.send(token.to_string());
        tokio::select! {
            sent = send => sent.map_err(|_| MeshError::Cancelled),
            _ = self.cancel.changed() => Err(MeshError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Close the stream with a terminal status. Idempotent; only the first
    /// call delivers.
    pub fn finish(&mut self, status: TerminalStatus) {
        if let Some(tx) = self.status.take() {
            let _ = tx.send(status);
        }
    }
}

/// Wire a loop task to its consumer.
pub fn completion_channel(fingerprint: Fingerprint) -> (CompletionEmitter, CompletionHandle) {
    let (token_tx, token_rx) = mpsc::channel(SINK_CAPACITY);
    let (status_tx, status_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (
        CompletionEmitter {
            tokens: token_tx,
            status: Some(status_tx),
            cancel: cancel_rx,
        },
        CompletionHandle {
            fingerprint,
            tokens: token_rx,
            status: status_rx,
            cancel: cancel_tx,
        },
    )
}
