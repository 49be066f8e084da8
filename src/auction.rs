//! Auction driver.
//!
//! One per active request. Publishes a `WorkRequest` per round on the work
//! topic and collects at most one usable draft from the inbox before the
//! round deadline. Pre-screening happens here: drafts from banned peers,
//! from ourselves, or carrying the wrong sequence are discarded before they
//! ever reach verification.

use crate::config::MeshConfig;
use crate::inbox::ResultInbox;
use crate::net::registry::PeerRegistry;
use crate::net::serde_safe::BoundedString;
use crate::net::transport::Transport;
use crate::net::types::Topic;
use crate::net::WorkRequest;
use crate::reputation::ReputationLedger;
use crate::types::{AuctionKey, Draft, Fingerprint, PeerId};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

pub struct AuctionDriver {
    transport: Arc<Transport>,
    inbox: Arc<ResultInbox>,
    ledger: Arc<ReputationLedger>,
    registry: Arc<PeerRegistry>,
    fingerprint: Fingerprint,
    self_id: PeerId,
    next_sequence: u32,
    min_tokens: u8,
}

impl AuctionDriver {
    pub fn new(
        transport: Arc<Transport>,
        inbox: Arc<ResultInbox>,
        ledger: Arc<ReputationLedger>,
        registry: Arc<PeerRegistry>,
        fingerprint: Fingerprint,
        config: &MeshConfig,
    ) -> Self {
        let self_id = transport.self_id();
        Self {
            transport,
            inbox,
            ledger,
            registry,
            fingerprint,
            self_id,
            next_sequence: 0,
            min_tokens: config.draft_k,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Publish one round. Returns the sequence id used and how many peers
    /// the request reached (banned peers are skipped at fan-out).
    pub fn broadcast(&mut self, context_tail: &str) -> (u32, usize) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let banned: Vec<PeerId> = self
            .registry
            .connected_peer_ids()
            .into_iter()
            .filter(|id| self.ledger.is_banned(id))
            .collect();

        let request = WorkRequest {
            request_id: BoundedString::truncated(&self.fingerprint.to_string()),
            sequence_id: sequence,
            prompt_context: BoundedString::truncated(context_tail),
            min_tokens: self.min_tokens,
            publisher_id: self.self_id,
        };
        let reached = self.transport.publish(Topic::Work, &request, &banned);
        trace!(
            "auction {}#{} reached {} peer(s)",
            self.fingerprint,
            sequence,
            reached
        );
        (sequence, reached)
    }

    /// First draft for the round that survives pre-screening, or `None` at
    /// the deadline. Later arrivals for the same key stay queued and die
    /// with the fingerprint.
    pub async fn collect(&self, sequence: u32, deadline: Instant) -> Option<Draft> {
        let key = AuctionKey::new(self.fingerprint, sequence);
        loop {
            let draft = self.inbox.pop_until(key, deadline).await?;
            if draft.peer_id == self.self_id {
                debug!("discarding own draft for {}", key);
                continue;
            }
            if draft.sequence != sequence {
                debug!("discarding stale draft for {} (seq {})", key, draft.sequence);
                continue;
            }
            if self.ledger.is_banned(&draft.peer_id) {
                debug!("discarding draft from banned peer {} for {}", draft.peer_id, key);
                continue;
            }
            return Some(draft);
        }
    }

    /// Record a graded verification answer against the ledger. Returns the
    /// ban issued by this update, if the auto-ban policy fired.
    pub fn grade(
        &self,
        peer_id: &PeerId,
        correct: bool,
    ) -> Result<Option<crate::reputation::BanRecord>, crate::reputation::LedgerError> {
        self.ledger.on_verification_result(peer_id, correct)
    }

    /// Free all inbox state for this request.
    pub fn finish(&self) {
        self.inbox.drop_fingerprint(&self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::reputation::BanPolicy;
    use std::time::Duration;

    fn deps() -> (Arc<Transport>, Arc<ResultInbox>, Arc<ReputationLedger>, Arc<PeerRegistry>) {
        let keypair = Arc::new(Keypair::generate());
        let registry = Arc::new(PeerRegistry::new(300));
        let (transport, _channels) =
            Transport::new(keypair, registry.clone(), 0, Duration::from_secs(5));
        let inbox = Arc::new(ResultInbox::new(8, 16));
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = Arc::new(
            ReputationLedger::open(
                &db,
                BanPolicy {
                    min_attempts: 3,
                    accuracy_threshold: 0.7,
                    ban_duration_seconds: 3600,
                },
            )
            .unwrap(),
        );
        (transport, inbox, ledger, registry)
    }

    fn make_draft(peer: PeerId, seq: u32) -> Draft {
        Draft {
            peer_id: peer,
            sequence: seq,
            tokens: vec!["tok".into()],
            latency_ms: 1.0,
            is_verification_answer: false,
        }
    }

    #[tokio::test]
    async fn collect_screens_self_and_banned() {
        let (transport, inbox, ledger, registry) = deps();
        let fp = Fingerprint::generate();
        let mut driver = AuctionDriver::new(
            transport.clone(),
            inbox.clone(),
            ledger.clone(),
            registry,
            fp,
            &MeshConfig::default(),
        );
        let (seq, _) = driver.broadcast("ctx");

        let banned_peer = PeerId([1; 32]);
        ledger.ban(&banned_peer, "test".into()).unwrap();
        let good_peer = PeerId([2; 32]);

        let key = AuctionKey::new(fp, seq);
        inbox.push(key, make_draft(transport.self_id(), seq));
        inbox.push(key, make_draft(banned_peer, seq));
        inbox.push(key, make_draft(good_peer, seq));

        let deadline = Instant::now() + Duration::from_millis(50);
        let winner = driver.collect(seq, deadline).await.unwrap();
        assert_eq!(winner.peer_id, good_peer);
    }

    #[tokio::test]
    async fn sequences_are_monotonic() {
        let (transport, inbox, ledger, registry) = deps();
        let mut driver = AuctionDriver::new(
            transport,
            inbox,
            ledger,
            registry,
            Fingerprint::generate(),
            &MeshConfig::default(),
        );
        assert_eq!(driver.broadcast("a").0, 0);
        assert_eq!(driver.broadcast("b").0, 1);
        assert_eq!(driver.broadcast("c").0, 2);
    }
}
