//! Bootstrap reconnection.
//!
//! The PING/PONG handshake itself rides on each connection (see
//! `transport::ping_task`); this module keeps the node dialling bootstrap
//! peers that are currently absent, with exponential backoff on repeated
//! failures.

use super::transport::Transport;
use crate::types::now;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const INITIAL_RETRY_DELAY_SECS: u64 = 5;
const MAX_RETRY_DELAY_SECS: u64 = 300;
const RETRY_BACKOFF_FACTOR: u64 = 2;

/// Retry tracking with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    pub attempts: u32,
    pub last_attempt: u64,
    pub next_retry_delay: u64,
}

impl RetryInfo {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            last_attempt: 0,
            next_retry_delay: INITIAL_RETRY_DELAY_SECS,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt = now();
        self.next_retry_delay =
            (self.next_retry_delay * RETRY_BACKOFF_FACTOR).min(MAX_RETRY_DELAY_SECS);
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.next_retry_delay = INITIAL_RETRY_DELAY_SECS;
    }

    pub fn can_retry(&self) -> bool {
        if self.last_attempt == 0 {
            return true;
        }
        now() >= self.last_attempt + self.next_retry_delay
    }
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically dial bootstrap peers that are not currently connected.
/// Runs until the task is aborted at shutdown.
pub async fn reconnect_loop(
    transport: Arc<Transport>,
    bootstrap: Vec<SocketAddr>,
    interval: Duration,
) {
    let mut retries: HashMap<SocketAddr, RetryInfo> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for addr in &bootstrap {
            if transport.is_connected_to(addr) {
                retries.entry(*addr).or_default().record_success();
                continue;
            }
            let info = retries.entry(*addr).or_default();
            if !info.can_retry() {
                continue;
            }
            info.record_attempt();
            debug!("reconnecting to bootstrap peer {}", addr);
            transport.connect(*addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_saturates() {
        let mut info = RetryInfo::new();
        assert!(info.can_retry());
        let mut last = 0;
        for _ in 0..16 {
            info.record_attempt();
            assert!(info.next_retry_delay >= last);
            last = info.next_retry_delay;
        }
        assert_eq!(info.next_retry_delay, MAX_RETRY_DELAY_SECS);
        assert!(!info.can_retry());

        info.record_success();
        assert_eq!(info.next_retry_delay, INITIAL_RETRY_DELAY_SECS);
        assert_eq!(info.attempts, 0);
    }
}
