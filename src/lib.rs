//! Shard: a decentralized speculative-decoding inference mesh.
//!
//! A verifier node (shard) owns the ground-truth model and streams
//! completions; lightweight peers (scouts) bid short draft token sequences
//! into a pub/sub work auction. The verifier accepts, corrects, or discards
//! drafts, grades peers against pre-solved verification prompts, and keeps a
//! persistent reputation/ban ledger for sybil resistance.

pub mod auction;
pub mod catalog;
pub mod colocate;
pub mod config;
pub mod crypto;
pub mod drafter;
pub mod error;
pub mod facade;
pub mod inbox;
pub mod model;
pub mod net;
pub mod node;
pub mod reputation;
pub mod speculative;
pub mod types;

pub use auction::AuctionDriver;
pub use catalog::{Catalog, MatchMode, VerificationPrompt};
pub use colocate::ColocationProbe;
pub use config::MeshConfig;
pub use crypto::Keypair;
pub use drafter::DrafterWorker;
pub use error::MeshError;
pub use facade::{completion_channel, CompletionHandle, CompletionRequest, TerminalStatus};
pub use inbox::ResultInbox;
pub use model::{
    DeterministicDrafter, DeterministicVerifier, DrafterModel, ModelError, PrefixVerdict,
    VerifierHandle, VerifierModel,
};
pub use node::{Node, NodeError, NodeOptions, NodeRole};
pub use reputation::{BanPolicy, BanRecord, ReputationLedger, ReputationRecord};
pub use speculative::{render_prompt, run_completion};
pub use types::*;
