//! Reputation ledger.
//!
//! Per-peer verification counters and time-boxed bans, persisted in sled
//! under the data directory (trees `reputation` and `bans`, keyed by peer
//! id). The ledger is the only authority for ban status; every reader goes
//! through [`ReputationLedger::is_banned`], which lazily expires bans.
//! Reputation moves only on verification prompts — ordinary draft rejections
//! never touch it.

use crate::types::{now, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

const REPUTATION_TREE: &str = "reputation";
const BANS_TREE: &str = "bans";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Store(#[from] sled::Error),
    #[error("corrupt record for peer {0}")]
    Corrupt(PeerId),
}

/// Verification-prompt track record for one peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub attempts: u64,
    pub correct: u64,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl ReputationRecord {
    pub fn accuracy(&self) -> f64 {
        self.correct as f64 / (self.attempts.max(1)) as f64
    }
}

/// Active exclusion of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub banned_at: u64,
    pub duration_seconds: u64,
    pub reason: String,
    pub failed_attempts: u64,
}

impl BanRecord {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.banned_at.saturating_add(self.duration_seconds)
    }
}

/// Auto-ban policy knobs, copied out of the mesh config.
#[derive(Debug, Clone)]
pub struct BanPolicy {
    pub min_attempts: u64,
    pub accuracy_threshold: f64,
    pub ban_duration_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct PeerReputation {
    pub peer_id: PeerId,
    pub record: ReputationRecord,
    pub ban: Option<BanRecord>,
}

pub struct ReputationLedger {
    reputation: sled::Tree,
    bans: sled::Tree,
    policy: BanPolicy,
    // Serialises read-modify-write cycles across tasks.
    write_lock: Mutex<()>,
}

impl ReputationLedger {
    /// Open (or create) the ledger inside an existing sled database and
    /// sweep bans that expired while the process was down.
    pub fn open(db: &sled::Db, policy: BanPolicy) -> Result<Self, LedgerError> {
        let ledger = Self {
            reputation: db.open_tree(REPUTATION_TREE)?,
            bans: db.open_tree(BANS_TREE)?,
            policy,
            write_lock: Mutex::new(()),
        };
        let swept = ledger.sweep_expired()?;
        if swept > 0 {
            info!("swept {} expired ban(s) at startup", swept);
        }
        Ok(ledger)
    }

    /// Record a graded verification answer. Applies the auto-ban policy and
    /// returns the ban issued by this update, if any.
    pub fn on_verification_result(
        &self,
        peer_id: &PeerId,
        correct: bool,
    ) -> Result<Option<BanRecord>, LedgerError> {
        let _guard = self.write_lock.lock().unwrap();
        let ts = now();
        let mut record = self.load_reputation(peer_id)?.unwrap_or_default();
        if record.first_seen == 0 {
            record.first_seen = ts;
        }
        record.attempts += 1;
        if correct {
            record.correct += 1;
        }
        record.last_seen = ts;
        self.store_reputation(peer_id, &record)?;
        debug!(
            "verification result for {}: correct={} ({}/{})",
            peer_id, correct, record.correct, record.attempts
        );

        if record.attempts >= self.policy.min_attempts
            && record.accuracy() < self.policy.accuracy_threshold
        {
            let ban = self.ban_locked(
                peer_id,
                format!(
                    "verification accuracy {:.2} below {:.2}",
                    record.accuracy(),
                    self.policy.accuracy_threshold
                ),
                record.attempts - record.correct,
            )?;
            return Ok(Some(ban));
        }
        Ok(None)
    }

    /// Ban a peer now. Re-banning refreshes the timestamp and reason.
    pub fn ban(&self, peer_id: &PeerId, reason: String) -> Result<BanRecord, LedgerError> {
        let _guard = self.write_lock.lock().unwrap();
        let failed = self
            .load_reputation(peer_id)?
            .map(|r| r.attempts - r.correct)
            .unwrap_or(0);
        self.ban_locked(peer_id, reason, failed)
    }

    fn ban_locked(
        &self,
        peer_id: &PeerId,
        reason: String,
        failed_attempts: u64,
    ) -> Result<BanRecord, LedgerError> {
        let ban = BanRecord {
            banned_at: now(),
            duration_seconds: self.policy.ban_duration_seconds,
            reason,
            failed_attempts,
        };
        let bytes = bincode::serialize(&ban).map_err(|_| LedgerError::Corrupt(*peer_id))?;
        self.bans.insert(peer_id.as_bytes(), bytes)?;
        self.bans.flush()?;
        warn!(
            "banned peer {} for {}s: {}",
            peer_id, ban.duration_seconds, ban.reason
        );
        Ok(ban)
    }

    /// Authoritative ban check; expired bans are removed on the way out.
    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        match self.load_ban(peer_id) {
            Ok(Some(ban)) => {
                if ban.is_expired(now()) {
                    let _guard = self.write_lock.lock().unwrap();
                    if self.bans.remove(peer_id.as_bytes()).is_ok() {
                        let _ = self.bans.flush();
                        debug!("ban expired for {}", peer_id);
                    }
                    false
                } else {
                    true
                }
            }
            Ok(None) => false,
            Err(e) => {
                // Fail closed: an unreadable ban record keeps the peer out.
                warn!("ban lookup failed for {}: {}", peer_id, e);
                true
            }
        }
    }

    pub fn unban(&self, peer_id: &PeerId) -> Result<bool, LedgerError> {
        let _guard = self.write_lock.lock().unwrap();
        let removed = self.bans.remove(peer_id.as_bytes())?.is_some();
        if removed {
            self.bans.flush()?;
            info!("unbanned peer {}", peer_id);
        }
        Ok(removed)
    }

    /// Clear a peer's counters and any ban.
    pub fn reset(&self, peer_id: &PeerId) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().unwrap();
        self.reputation.remove(peer_id.as_bytes())?;
        self.bans.remove(peer_id.as_bytes())?;
        self.reputation.flush()?;
        self.bans.flush()?;
        Ok(())
    }

    pub fn get(&self, peer_id: &PeerId) -> Result<Option<ReputationRecord>, LedgerError> {
        self.load_reputation(peer_id)
    }

    pub fn get_ban(&self, peer_id: &PeerId) -> Result<Option<BanRecord>, LedgerError> {
        self.load_ban(peer_id)
    }

    /// Full snapshot, reputation joined with any active ban.
    pub fn snapshot(&self) -> Result<Vec<PeerReputation>, LedgerError> {
        let mut out = Vec::new();
        for item in self.reputation.iter() {
            let (key, value) = item?;
            let peer_id = decode_key(&key)?;
            let record: ReputationRecord =
                bincode::deserialize(&value).map_err(|_| LedgerError::Corrupt(peer_id))?;
            let ban = self.load_ban(&peer_id)?.filter(|b| !b.is_expired(now()));
            out.push(PeerReputation { peer_id, record, ban });
        }
        Ok(out)
    }

    /// Remove all expired ban records. Returns how many were swept.
    pub fn sweep_expired(&self) -> Result<usize, LedgerError> {
        let _guard = self.write_lock.lock().unwrap();
        let cutoff = now();
        let mut expired = Vec::new();
        for item in self.bans.iter() {
            let (key, value) = item?;
            let peer_id = decode_key(&key)?;
            let ban: BanRecord =
                bincode::deserialize(&value).map_err(|_| LedgerError::Corrupt(peer_id))?;
            if ban.is_expired(cutoff) {
                expired.push(key);
            }
        }
        let count = expired.len();
        for key in expired {
            self.bans.remove(key)?;
        }
        if count > 0 {
            self.bans.flush()?;
        }
        Ok(count)
    }

    pub fn banned_count(&self) -> usize {
        self.bans.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.reputation.len()
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.reputation.flush()?;
        self.bans.flush()?;
        Ok(())
    }

    fn load_reputation(&self, peer_id: &PeerId) -> Result<Option<ReputationRecord>, LedgerError> {
        match self.reputation.get(peer_id.as_bytes())? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|_| LedgerError::Corrupt(*peer_id))?,
            )),
            None => Ok(None),
        }
    }

    fn store_reputation(
        &self,
        peer_id: &PeerId,
        record: &ReputationRecord,
    ) -> Result<(), LedgerError> {
        let bytes = bincode::serialize(record).map_err(|_| LedgerError::Corrupt(*peer_id))?;
        self.reputation.insert(peer_id.as_bytes(), bytes)?;
        self.reputation.flush()?;
        Ok(())
    }

    fn load_ban(&self, peer_id: &PeerId) -> Result<Option<BanRecord>, LedgerError> {
        match self.bans.get(peer_id.as_bytes())? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|_| LedgerError::Corrupt(*peer_id))?,
            )),
            None => Ok(None),
        }
    }
}

fn decode_key(key: &[u8]) -> Result<PeerId, LedgerError> {
    let arr: [u8; 32] = key
        .try_into()
        .map_err(|_| LedgerError::Corrupt(PeerId([0; 32])))?;
    Ok(PeerId(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> BanPolicy {
        BanPolicy {
            min_attempts: 3,
            accuracy_threshold: 0.70,
            ban_duration_seconds: 3600,
        }
    }

    fn open_temp() -> (sled::Db, ReputationLedger) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = ReputationLedger::open(&db, test_policy()).unwrap();
        (db, ledger)
    }

    fn make_id(seed: u8) -> PeerId {
        PeerId([seed; 32])
    }

    #[test]
    fn accuracy_never_divides_by_zero() {
        let record = ReputationRecord::default();
        assert_eq!(record.accuracy(), 0.0);
    }

    #[test]
    fn no_ban_before_min_attempts() {
        let (_db, ledger) = open_temp();
        let peer = make_id(1);
        assert!(ledger.on_verification_result(&peer, false).unwrap().is_none());
        assert!(ledger.on_verification_result(&peer, false).unwrap().is_none());
        assert!(!ledger.is_banned(&peer));
    }

    #[test]
    fn auto_ban_after_threshold() {
        let (_db, ledger) = open_temp();
        let peer = make_id(2);
        ledger.on_verification_result(&peer, false).unwrap();
        ledger.on_verification_result(&peer, false).unwrap();
        let ban = ledger.on_verification_result(&peer, false).unwrap();
        assert!(ban.is_some());
        assert_eq!(ban.unwrap().failed_attempts, 3);
        assert!(ledger.is_banned(&peer));
    }

    #[test]
    fn accurate_peer_stays_unbanned() {
        let (_db, ledger) = open_temp();
        let peer = make_id(3);
        for _ in 0..10 {
            ledger.on_verification_result(&peer, true).unwrap();
        }
        let record = ledger.get(&peer).unwrap().unwrap();
        assert_eq!(record.attempts, 10);
        assert_eq!(record.correct, 10);
        assert!(!ledger.is_banned(&peer));
    }

    #[test]
    fn ban_unban_ban_preserves_accuracy() {
        let (_db, ledger) = open_temp();
        let peer = make_id(4);
        ledger.on_verification_result(&peer, true).unwrap();
        ledger.on_verification_result(&peer, false).unwrap();
        let before = ledger.get(&peer).unwrap().unwrap();

        ledger.ban(&peer, "manual".into()).unwrap();
        assert!(ledger.is_banned(&peer));
        assert!(ledger.unban(&peer).unwrap());
        assert!(!ledger.is_banned(&peer));
        ledger.ban(&peer, "manual again".into()).unwrap();

        let after = ledger.get(&peer).unwrap().unwrap();
        assert_eq!(before.attempts, after.attempts);
        assert_eq!(before.correct, after.correct);
    }

    #[test]
    fn expired_ban_lazily_cleared() {
        let (_db, ledger) = open_temp();
        let peer = make_id(5);
        ledger.ban(&peer, "short".into()).unwrap();

        // Backdate the ban past its duration.
        let mut ban = ledger.get_ban(&peer).unwrap().unwrap();
        ban.banned_at = now() - ban.duration_seconds - 1;
        let bytes = bincode::serialize(&ban).unwrap();
        ledger.bans.insert(peer.as_bytes(), bytes).unwrap();

        assert!(!ledger.is_banned(&peer));
        assert!(ledger.get_ban(&peer).unwrap().is_none());
    }

    #[test]
    fn snapshot_joins_bans() {
        let (_db, ledger) = open_temp();
        let good = make_id(6);
        let bad = make_id(7);
        ledger.on_verification_result(&good, true).unwrap();
        for _ in 0..3 {
            ledger.on_verification_result(&bad, false).unwrap();
        }
        let snapshot = ledger.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        let bad_entry = snapshot.iter().find(|p| p.peer_id == bad).unwrap();
        assert!(bad_entry.ban.is_some());
        let good_entry = snapshot.iter().find(|p| p.peer_id == good).unwrap();
        assert!(good_entry.ban.is_none());
    }
}
