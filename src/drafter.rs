//! Drafter worker.
//!
//! Runs on every scout: consumes the work topic, answers verification
//! prompts from the catalog, runs the drafter model for everything else, and
//! publishes results. Silent on model failure for ordinary work — but a
//! verification prompt is always answered, because silence there reads as a
//! wrong answer once graded.

use crate::catalog::Catalog;
use crate::colocate::ColocationProbe;
use crate::model::DrafterModel;
use crate::net::serde_safe::{BoundedString, BoundedVec};
use crate::net::transport::Transport;
use crate::net::types::{Topic, MAX_DRAFT_TOKENS, MAX_TOKEN_BYTES};
use crate::net::{WorkRequest, WorkResult};
use crate::types::PeerId;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Auction keys remembered for dedup.
const MAX_SEEN_KEYS: usize = 50_000;
const SEEN_EVICTION_BATCH: usize = 5_000;

/// Re-broadcasts of the same `(request, sequence)` must be answered once.
/// FIFO eviction keeps the set bounded no matter how many keys a verifier
/// announces.
struct BoundedKeySet {
    set: HashSet<(String, u32)>,
    order: VecDeque<(String, u32)>,
}

impl BoundedKeySet {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: (String, u32)) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.set.len() >= MAX_SEEN_KEYS {
            for _ in 0..SEEN_EVICTION_BATCH {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct DrafterWorker {
    model: Arc<dyn DrafterModel>,
    transport: Arc<Transport>,
    probe: Arc<ColocationProbe>,
    self_id: PeerId,
    draft_budget: Duration,
}

impl DrafterWorker {
    pub fn new(
        model: Arc<dyn DrafterModel>,
        transport: Arc<Transport>,
        probe: Arc<ColocationProbe>,
        draft_budget: Duration,
    ) -> Self {
        let self_id = transport.self_id();
        Self {
            model,
            transport,
            probe,
            self_id,
            draft_budget,
        }
    }

    /// Consume the work topic until the channel closes.
    pub async fn run(self, mut work_rx: mpsc::Receiver<(PeerId, WorkRequest)>) {
        let mut seen = BoundedKeySet::new();
        while let Some((from, request)) = work_rx.recv().await {
            self.handle(from, request, &mut seen).await;
        }
        debug!("drafter worker stopped: work channel closed");
    }

    async fn handle(&self, from: PeerId, request: WorkRequest, seen: &mut BoundedKeySet) {
        // A scout living next to a verifier recuses itself entirely.
        if self.probe.is_colocated() {
            trace!("ignoring work {}: co-located with a verifier", request.request_id.as_str());
            return;
        }
        if from == self.self_id {
            return;
        }
        if !seen.insert((request.request_id.as_str().to_string(), request.sequence_id)) {
            trace!(
                "ignoring re-broadcast {}#{}",
                request.request_id.as_str(),
                request.sequence_id
            );
            return;
        }

        let started = Instant::now();
        let (tokens, is_verification_answer) =
            match Catalog::classify(request.prompt_context.as_str()) {
                Some(prompt) => (vec![Catalog::canonical_answer(prompt)], true),
                None => {
                    let tokens = self
                        .draft_within_budget(
                            request.prompt_context.as_str().to_string(),
                            request.min_tokens as usize,
                        )
                        .await;
                    if tokens.is_empty() {
                        // Silent on failure: nothing useful to publish.
                        trace!(
                            "no draft for {}#{}",
                            request.request_id.as_str(),
                            request.sequence_id
                        );
                        return;
                    }
                    (tokens, false)
                }
            };

        let latency_ms = started.elapsed().as_secs_f32() * 1000.0;
        let draft_tokens: Vec<BoundedString<MAX_TOKEN_BYTES>> = tokens
            .into_iter()
            .take(MAX_DRAFT_TOKENS)
            .map(|t| BoundedString::truncated(&t))
            .collect();
        let result = WorkResult {
            request_id: request.request_id.clone(),
            sequence_id: request.sequence_id,
            peer_id: self.self_id,
            draft_tokens: BoundedVec::new_unchecked(draft_tokens),
            latency_ms,
            is_verification_answer,
        };
        if result.validate().is_err() {
            warn!("dropping oversize draft for {}", request.request_id.as_str());
            return;
        }
        self.transport.publish(Topic::WorkResult, &result, &[]);
    }

    /// Run the drafter model on the worker pool, bounded by the draft
    /// budget. Overruns and failures both come back empty.
    async fn draft_within_budget(&self, context: String, k: usize) -> Vec<String> {
        let model = self.model.clone();
        let call = tokio::task::spawn_blocking(move || model.draft(&context, k));
        match tokio::time::timeout(self.draft_budget, call).await {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                trace!("draft overran its {:?} budget", self.draft_budget);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_set_dedups() {
        let mut seen = BoundedKeySet::new();
        assert!(seen.insert(("a".into(), 0)));
        assert!(!seen.insert(("a".into(), 0)));
        assert!(seen.insert(("a".into(), 1)));
        assert!(seen.insert(("b".into(), 0)));
    }

    #[test]
    fn key_set_evicts_oldest_at_capacity() {
        let mut seen = BoundedKeySet::new();
        for i in 0..MAX_SEEN_KEYS {
            assert!(seen.insert((i.to_string(), 0)));
        }
        assert!(seen.insert(("one-more".into(), 0)));
        assert!(seen.set.len() <= MAX_SEEN_KEYS);
        // The oldest keys were evicted and can be inserted again.
        assert!(seen.insert(("0".into(), 0)));
    }
}
