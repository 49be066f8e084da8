//! Co-location probe.
//!
//! A drafter hosted next to a verifier must recuse itself from the work
//! stream. The probe measures TCP connect time to the local verifier
//! endpoint; a round-trip under the threshold means co-located. Probe
//! failure defaults to "not co-located" — drafting stays allowed, with the
//! self-id filter on the verifier as the backstop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// How often the cached verdict is refreshed.
const PROBE_REFRESH: Duration = Duration::from_secs(10);

/// Cap on how long a single probe attempt may hang.
const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

pub struct ColocationProbe {
    endpoint: Option<SocketAddr>,
    threshold: Duration,
    colocated: AtomicBool,
}

impl ColocationProbe {
    pub fn new(endpoint: Option<SocketAddr>, threshold_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            threshold: Duration::from_millis(threshold_ms),
            colocated: AtomicBool::new(false),
        })
    }

    /// Cached verdict; refreshed by [`run`] in the background.
    pub fn is_colocated(&self) -> bool {
        self.colocated.load(Ordering::Relaxed)
    }

    /// Probe once, right now.
    pub async fn probe_once(&self) -> bool {
        let Some(endpoint) = self.endpoint else {
            return false;
        };
        let started = Instant::now();
        match tokio::time::timeout(PROBE_ATTEMPT_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(_stream)) => {
                let rtt = started.elapsed();
                trace!("co-location probe rtt {:?} (threshold {:?})", rtt, self.threshold);
                rtt < self.threshold
            }
            _ => false,
        }
    }

    /// Background refresh loop. Runs until aborted.
    pub async fn run(self: Arc<Self>) {
        if self.endpoint.is_none() {
            return;
        }
        loop {
            let verdict = self.probe_once().await;
            let previous = self.colocated.swap(verdict, Ordering::Relaxed);
            if verdict != previous {
                debug!("co-location verdict changed: {}", verdict);
            }
            tokio::time::sleep(PROBE_REFRESH).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_endpoint_means_not_colocated() {
        let probe = ColocationProbe::new(None, 2);
        assert!(!probe.probe_once().await);
        assert!(!probe.is_colocated());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        // Nothing listens here; the probe must default to "not co-located".
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let probe = ColocationProbe::new(Some(addr), 2);
        assert!(!probe.probe_once().await);
    }

    #[tokio::test]
    async fn loopback_listener_with_generous_threshold_is_colocated() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        // Loopback connects in microseconds; 200 ms cannot miss.
        let probe = ColocationProbe::new(Some(addr), 200);
        assert!(probe.probe_once().await);
    }
}
