//! Node wiring.
//!
//! Owns the process-wide state (transport, registry, ledger, inbox) and the
//! background tasks: result demux, drafter worker, registry sweeper, bootstrap
//! reconnection, and the co-location probe. Each completion gets its own
//! loop task; nothing is reached through ambient singletons.

use crate::auction::AuctionDriver;
use crate::colocate::ColocationProbe;
use crate::config::MeshConfig;
use crate::crypto::Keypair;
use crate::drafter::DrafterWorker;
use crate::facade::{completion_channel, CompletionHandle, CompletionRequest};
use crate::inbox::{InboxStats, ResultInbox};
use crate::model::{self, BackendSpecError, VerifierHandle};
use crate::net::registry::{PeerRegistry, RegistryStats};
use crate::net::transport::{Transport, TransportStats};
use crate::net::{reconnect_loop, WorkResult};
use crate::reputation::{BanPolicy, LedgerError, ReputationLedger};
use crate::speculative::run_completion;
use crate::types::{now, Draft, Fingerprint, PeerId};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] sled::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("model backend error: {0}")]
    Backend(#[from] BackendSpecError),
    #[error("this node does not run a verifier")]
    NotAVerifier,
}

/// Which mesh roles this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRole {
    pub verifier: bool,
    pub drafter: bool,
}

impl NodeRole {
    pub fn verifier() -> Self {
        Self { verifier: true, drafter: false }
    }

    pub fn drafter() -> Self {
        Self { verifier: false, drafter: true }
    }

    pub fn both() -> Self {
        Self { verifier: true, drafter: true }
    }
}

pub struct NodeOptions {
    pub config: MeshConfig,
    pub role: NodeRole,
    /// Backend spec for the verifier model (when the role includes one).
    pub verifier_model: String,
    /// Backend spec for the drafter model (when the role includes one).
    pub drafter_model: String,
}

#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peers: RegistryStats,
    pub transport: TransportStats,
    pub inbox: InboxStats,
    pub reputation_tracked: usize,
    pub banned: usize,
}

pub struct Node {
    config: Arc<MeshConfig>,
    keypair: Arc<Keypair>,
    transport: Arc<Transport>,
    registry: Arc<PeerRegistry>,
    ledger: Arc<ReputationLedger>,
    inbox: Arc<ResultInbox>,
    verifier: Option<VerifierHandle>,
    local_addr: SocketAddr,
    listen_port: u16,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Open state, bind the listener, and start every background task.
    pub async fn start(opts: NodeOptions, listen_port: u16) -> Result<Arc<Self>, NodeError> {
        let config = Arc::new(opts.config.sanitized());

        std::fs::create_dir_all(&config.data_dir)?;
        let db = sled::open(config.data_dir.join("ledger"))?;
        let ledger = Arc::new(ReputationLedger::open(
            &db,
            BanPolicy {
                min_attempts: config.reputation_min_attempts,
                accuracy_threshold: config.reputation_threshold,
                ban_duration_seconds: config.ban_duration_seconds,
            },
        )?);

        let keypair = Arc::new(Keypair::generate());
        info!("node id: {}", keypair.peer_id());

        let registry = Arc::new(PeerRegistry::new(config.peer_stale_seconds));
        let (transport, channels) = Transport::new(
            keypair.clone(),
            registry.clone(),
            listen_port,
            config.handshake_timeout(),
        );
        let local_addr = transport.start().await?;

        let inbox = Arc::new(ResultInbox::new(
            config.inbox_capacity_per_key,
            config.inbox_fingerprint_capacity,
        ));

        let verifier = if opts.role.verifier {
            Some(VerifierHandle::new(model::build_verifier(&opts.verifier_model)?))
        } else {
            None
        };

        let node = Arc::new(Self {
            config: config.clone(),
            keypair,
            transport: transport.clone(),
            registry: registry.clone(),
            ledger: ledger.clone(),
            inbox: inbox.clone(),
            verifier,
            local_addr,
            listen_port: local_addr.port(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        // Inbound results feed the inbox; banned publishers are dropped at
        // the door so they cannot crowd out honest drafts.
        tasks.push(tokio::spawn(demux_results(
            channels.result_rx,
            inbox.clone(),
            ledger.clone(),
        )));

        if opts.role.drafter {
            // The co-location probe runs whenever a drafter is hosted here.
            let probe =
                ColocationProbe::new(config.verifier_endpoint, config.colocation_probe_ms);
            tasks.push(tokio::spawn(probe.clone().run()));
            let drafter_model = model::build_drafter(&opts.drafter_model)?;
            let worker = DrafterWorker::new(
                drafter_model,
                transport.clone(),
                probe,
                config.draft_budget(),
            );
            tasks.push(tokio::spawn(worker.run(channels.work_rx)));
        } else {
            // Nobody consumes work here; drain the channel so the transport
            // never backs up on it.
            let mut work_rx = channels.work_rx;
            tasks.push(tokio::spawn(async move {
                while work_rx.recv().await.is_some() {}
            }));
        }

        // Registry sweep plus periodic ban expiry.
        {
            let registry = registry.clone();
            let transport = transport.clone();
            let ledger = ledger.clone();
            let period = Duration::from_secs(config.peer_sweep_seconds);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    for peer_id in registry.prune(now()) {
                        transport.disconnect(&peer_id);
                    }
                    if let Err(e) = ledger.sweep_expired() {
                        warn!("ban sweep failed: {}", e);
                    }
                }
            }));
        }

        // Bootstrap dialling, immediately and then on the reconnect timer.
        for addr in &config.bootstrap {
            transport.connect(*addr);
        }
        tasks.push(tokio::spawn(reconnect_loop(
            transport.clone(),
            config.bootstrap.clone(),
            Duration::from_secs(config.reconnect_interval_seconds),
        )));

        *node.tasks.lock().unwrap() = tasks;
        Ok(node)
    }

    /// Start one completion; tokens stream out of the returned handle.
    pub fn complete(&self, request: CompletionRequest) -> Result<CompletionHandle, NodeError> {
        let verifier = self.verifier.clone().ok_or(NodeError::NotAVerifier)?;
        let fingerprint = Fingerprint::generate();
        let (emitter, handle) = completion_channel(fingerprint);
        let auction = AuctionDriver::new(
            self.transport.clone(),
            self.inbox.clone(),
            self.ledger.clone(),
            self.registry.clone(),
            fingerprint,
            &self.config,
        );
        let config = self.config.clone();
        debug!("request {} accepted", fingerprint);
        tokio::spawn(async move {
            run_completion(verifier, auction, &config, request, emitter).await;
        });
        Ok(handle)
    }

    pub fn self_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn ledger(&self) -> &Arc<ReputationLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peers: self.registry.stats(),
            transport: self.transport.stats(),
            inbox: self.inbox.stats(),
            reputation_tracked: self.ledger.tracked_count(),
            banned: self.ledger.banned_count(),
        }
    }

    /// Stop background tasks and flush persistent state.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Err(e) = self.ledger.flush() {
            warn!("ledger flush on shutdown failed: {}", e);
        }
        info!("node {} shut down", self.keypair.peer_id());
    }
}

/// Route inbound drafts into the result inbox.
async fn demux_results(
    mut result_rx: mpsc::Receiver<(PeerId, WorkResult)>,
    inbox: Arc<ResultInbox>,
    ledger: Arc<ReputationLedger>,
) {
    while let Some((from, result)) = result_rx.recv().await {
        let Some(fingerprint) = Fingerprint::parse(result.request_id.as_str()) else {
            debug!("dropping result with unparseable request id from {}", from);
            continue;
        };
        if ledger.is_banned(&from) {
            debug!("dropping draft from banned peer {}", from);
            continue;
        }
        let draft = Draft {
            peer_id: from,
            sequence: result.sequence_id,
            tokens: result
                .draft_tokens
                .into_iter()
                .map(|t| t.into_inner())
                .collect(),
            latency_ms: result.latency_ms,
            is_verification_answer: result.is_verification_answer,
        };
        inbox.push(
            crate::types::AuctionKey::new(fingerprint, draft.sequence),
            draft,
        );
    }
}
