//! Mesh configuration.
//!
//! Every recognised option with its default. Durations are stored in their
//! natural unit (milliseconds for per-round budgets, seconds for lifecycle
//! timers) to match how they appear on the command line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Hard cap on tokens emitted per completion.
    pub max_tokens_per_request: usize,
    /// Minimum wall time between auction rounds inside one request.
    pub auction_interval_ms: u64,
    /// Inbox wait budget per auction round.
    pub auction_collect_ms: u64,
    /// Trailing context tokens sent in `prompt_context`.
    pub draft_context_window_tokens: usize,
    /// Tokens requested per draft (1..=32).
    pub draft_k: u8,
    /// Drafter model time budget per draft call.
    pub draft_budget_ms: u64,
    /// Verifier top-k envelope for a draft token to count as a match.
    /// 1 = strict argmax. Global for the process; never varies mid-request.
    pub fuzzy_top_k: usize,
    /// Probability that an auction round carries a verification prompt
    /// instead of the live context.
    pub verification_injection_rate: f64,
    /// Verification attempts required before the auto-ban policy applies.
    pub reputation_min_attempts: u64,
    /// Minimum accuracy to avoid an auto-ban.
    pub reputation_threshold: f64,
    /// Auto-ban duration.
    pub ban_duration_seconds: u64,
    /// Peers with no activity for this long are pruned.
    pub peer_stale_seconds: u64,
    /// Registry sweep interval.
    pub peer_sweep_seconds: u64,
    /// PING must be answered within this budget.
    pub handshake_timeout_ms: u64,
    /// Reconnect attempt interval for absent bootstrap peers.
    pub reconnect_interval_seconds: u64,
    /// RTT threshold below which a local verifier counts as co-located.
    pub colocation_probe_ms: u64,
    /// Draft queue capacity per auction key.
    pub inbox_capacity_per_key: usize,
    /// Fingerprint LRU capacity bounding total inbox memory.
    pub inbox_fingerprint_capacity: usize,
    /// Soft wall budget for a whole request.
    pub request_wall_budget_seconds: u64,
    /// Empty auction rounds before broadcasting is suspended.
    pub stall_rounds_before_cooldown: u32,
    /// Broadcast suspension length after a stall.
    pub cooldown_seconds: u64,

    /// Data directory (reputation ledger lives here).
    pub data_dir: PathBuf,
    /// Bootstrap peer addresses; reconnected to while absent.
    pub bootstrap: Vec<SocketAddr>,
    /// Local verifier endpoint the co-location probe targets, if any.
    pub verifier_endpoint: Option<SocketAddr>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_request: 512,
            auction_interval_ms: 50,
            auction_collect_ms: 40,
            draft_context_window_tokens: 100,
            draft_k: 5,
            draft_budget_ms: 50,
            fuzzy_top_k: 1,
            verification_injection_rate: 0.05,
            reputation_min_attempts: 3,
            reputation_threshold: 0.70,
            ban_duration_seconds: 86_400,
            peer_stale_seconds: 300,
            peer_sweep_seconds: 30,
            handshake_timeout_ms: 5_000,
            reconnect_interval_seconds: 15,
            colocation_probe_ms: 2,
            inbox_capacity_per_key: 32,
            inbox_fingerprint_capacity: 1024,
            request_wall_budget_seconds: 120,
            stall_rounds_before_cooldown: 20,
            cooldown_seconds: 2,
            data_dir: PathBuf::from("./data"),
            bootstrap: Vec::new(),
            verifier_endpoint: None,
        }
    }
}

impl MeshConfig {
    pub fn auction_interval(&self) -> Duration {
        Duration::from_millis(self.auction_interval_ms)
    }

    pub fn auction_collect(&self) -> Duration {
        Duration::from_millis(self.auction_collect_ms)
    }

    pub fn draft_budget(&self) -> Duration {
        Duration::from_millis(self.draft_budget_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_wall_budget(&self) -> Duration {
        Duration::from_secs(self.request_wall_budget_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    /// Clamp operator-supplied values into protocol bounds.
    pub fn sanitized(mut self) -> Self {
        self.draft_k = self.draft_k.clamp(1, crate::net::MAX_DRAFT_TOKENS as u8);
        self.fuzzy_top_k = self.fuzzy_top_k.max(1);
        self.verification_injection_rate = self.verification_injection_rate.clamp(0.0, 1.0);
        self.inbox_capacity_per_key = self.inbox_capacity_per_key.max(1);
        self.inbox_fingerprint_capacity = self.inbox_fingerprint_capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.max_tokens_per_request, 512);
        assert_eq!(cfg.auction_interval_ms, 50);
        assert_eq!(cfg.auction_collect_ms, 40);
        assert_eq!(cfg.draft_context_window_tokens, 100);
        assert_eq!(cfg.draft_k, 5);
        assert_eq!(cfg.fuzzy_top_k, 1);
        assert_eq!(cfg.verification_injection_rate, 0.05);
        assert_eq!(cfg.reputation_min_attempts, 3);
        assert_eq!(cfg.reputation_threshold, 0.70);
        assert_eq!(cfg.ban_duration_seconds, 86_400);
        assert_eq!(cfg.request_wall_budget_seconds, 120);
        assert_eq!(cfg.stall_rounds_before_cooldown, 20);
        assert_eq!(cfg.cooldown_seconds, 2);
    }

    #[test]
    fn sanitize_clamps_out_of_range() {
        let cfg = MeshConfig {
            draft_k: 200,
            fuzzy_top_k: 0,
            verification_injection_rate: 3.0,
            inbox_capacity_per_key: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.draft_k as usize, crate::net::MAX_DRAFT_TOKENS);
        assert_eq!(cfg.fuzzy_top_k, 1);
        assert_eq!(cfg.verification_injection_rate, 1.0);
        assert_eq!(cfg.inbox_capacity_per_key, 1);
    }
}
