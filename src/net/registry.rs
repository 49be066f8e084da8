//! Peer registry.
//!
//! Tracks every connected peer: address, connect and last-seen times, the
//! verified flag (set after a PING/PONG round-trip), and consecutive
//! handshake failures. A peer appears at most once; re-announcement updates
//! the record in place. A background sweeper prunes peers with no activity
//! for the stale window.

use crate::types::{now, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Consecutive handshake failures before a peer is demoted to unverified.
pub const MAX_HANDSHAKE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub connected_at: u64,
    pub last_seen_at: u64,
    pub verified: bool,
    pub handshake_failures: u32,
    /// Last measured PING round-trip, milliseconds.
    pub rtt_ms: Option<u64>,
}

impl PeerRecord {
    fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        let ts = now();
        Self {
            peer_id,
            addr,
            connected_at: ts,
            last_seen_at: ts,
            verified: false,
            handshake_failures: 0,
            rtt_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total: usize,
    pub verified: usize,
}

pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
    stale_secs: u64,
}

impl PeerRegistry {
    pub fn new(stale_secs: u64) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            stale_secs,
        }
    }

    /// Register a connection. Re-announcement updates the address in place
    /// and refreshes activity; it never duplicates the record.
    pub fn on_connect(&self, peer_id: PeerId, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(peer_id)
            .and_modify(|r| {
                r.addr = addr;
                r.last_seen_at = now();
            })
            .or_insert_with(|| {
                debug!("registry: new peer {} at {}", peer_id, addr);
                PeerRecord::new(peer_id, addr)
            });
    }

    pub fn on_disconnect(&self, peer_id: &PeerId) {
        if self.peers.lock().unwrap().remove(peer_id).is_some() {
            debug!("registry: removed peer {}", peer_id);
        }
    }

    pub fn on_handshake_ok(&self, peer_id: &PeerId, rtt_ms: u64) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(r) = peers.get_mut(peer_id) {
            if !r.verified {
                info!("peer {} verified (rtt {} ms)", peer_id, rtt_ms);
            }
            r.verified = true;
            r.handshake_failures = 0;
            r.rtt_ms = Some(rtt_ms);
            r.last_seen_at = now();
        }
    }

    pub fn on_handshake_fail(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(r) = peers.get_mut(peer_id) {
            r.handshake_failures += 1;
            if r.handshake_failures >= MAX_HANDSHAKE_FAILURES {
                if r.verified {
                    info!(
                        "peer {} demoted after {} handshake failures",
                        peer_id, r.handshake_failures
                    );
                }
                r.verified = false;
            }
        }
    }

    /// Any inbound frame counts as activity.
    pub fn on_activity(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(r) = peers.get_mut(peer_id) {
            r.last_seen_at = now();
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.lock().unwrap().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().unwrap().contains_key(peer_id)
    }

    /// Snapshot of verified peers.
    pub fn list_verified(&self) -> Vec<PeerRecord> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.verified)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<PeerRecord> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.peers.lock().unwrap().values().map(|r| r.addr).collect()
    }

    pub fn connected_peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    /// Remove peers with no activity inside the stale window. Returns the
    /// pruned ids so the caller can tear down their connections.
    pub fn prune(&self, now_secs: u64) -> Vec<PeerId> {
        let cutoff = now_secs.saturating_sub(self.stale_secs);
        let mut peers = self.peers.lock().unwrap();
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|r| r.last_seen_at < cutoff)
            .map(|r| r.peer_id)
            .collect();
        for id in &stale {
            peers.remove(id);
            info!("pruned stale peer {}", id);
        }
        stale
    }

    pub fn stats(&self) -> RegistryStats {
        let peers = self.peers.lock().unwrap();
        RegistryStats {
            total: peers.len(),
            verified: peers.values().filter(|r| r.verified).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_id(seed: u8) -> PeerId {
        PeerId([seed; 32])
    }

    fn make_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn reannounce_updates_in_place() {
        let reg = PeerRegistry::new(300);
        let id = make_id(1);
        reg.on_connect(id, make_addr(1000));
        reg.on_connect(id, make_addr(2000));
        assert_eq!(reg.stats().total, 1);
        assert_eq!(reg.get(&id).unwrap().addr, make_addr(2000));
    }

    #[test]
    fn handshake_verifies_and_demotes() {
        let reg = PeerRegistry::new(300);
        let id = make_id(2);
        reg.on_connect(id, make_addr(1000));
        assert!(reg.list_verified().is_empty());

        reg.on_handshake_ok(&id, 12);
        assert_eq!(reg.list_verified().len(), 1);
        assert_eq!(reg.get(&id).unwrap().rtt_ms, Some(12));

        for _ in 0..MAX_HANDSHAKE_FAILURES {
            reg.on_handshake_fail(&id);
        }
        assert!(reg.list_verified().is_empty());
        // One success resets the failure counter.
        reg.on_handshake_ok(&id, 9);
        assert_eq!(reg.get(&id).unwrap().handshake_failures, 0);
        assert!(reg.get(&id).unwrap().verified);
    }

    #[test]
    fn prune_removes_stale_only() {
        let reg = PeerRegistry::new(300);
        let fresh = make_id(3);
        let stale = make_id(4);
        reg.on_connect(fresh, make_addr(1));
        reg.on_connect(stale, make_addr(2));

        // Backdate the stale peer.
        {
            let mut peers = reg.peers.lock().unwrap();
            peers.get_mut(&stale).unwrap().last_seen_at = now() - 1000;
        }

        let pruned = reg.prune(now());
        assert_eq!(pruned, vec![stale]);
        assert!(reg.contains(&fresh));
        assert!(!reg.contains(&stale));
    }
}
