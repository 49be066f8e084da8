//! Ledger persistence across process restarts (same on-disk store reopened).

use shard::reputation::{BanPolicy, ReputationLedger};
use shard::types::PeerId;
use std::path::PathBuf;

fn policy() -> BanPolicy {
    BanPolicy {
        min_attempts: 3,
        accuracy_threshold: 0.70,
        ban_duration_seconds: 3600,
    }
}

fn temp_path(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "shard_ledger_{}_{}_{}",
        tag,
        std::process::id(),
        rand::random::<u32>()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn reputation_and_bans_survive_reopen() {
    let path = temp_path("reopen");
    let good = PeerId([1; 32]);
    let bad = PeerId([2; 32]);

    {
        let db = sled::open(&path).unwrap();
        let ledger = ReputationLedger::open(&db, policy()).unwrap();
        ledger.on_verification_result(&good, true).unwrap();
        ledger.on_verification_result(&good, true).unwrap();
        for _ in 0..3 {
            ledger.on_verification_result(&bad, false).unwrap();
        }
        assert!(ledger.is_banned(&bad));
        ledger.flush().unwrap();
    }

    // Reopen: every record and every unexpired ban is still there.
    let db = sled::open(&path).unwrap();
    let ledger = ReputationLedger::open(&db, policy()).unwrap();

    let record = ledger.get(&good).unwrap().unwrap();
    assert_eq!((record.attempts, record.correct), (2, 2));
    assert!(!ledger.is_banned(&good));

    let record = ledger.get(&bad).unwrap().unwrap();
    assert_eq!((record.attempts, record.correct), (3, 0));
    assert!(ledger.is_banned(&bad));

    drop(ledger);
    drop(db);
    let _ = std::fs::remove_dir_all(&path);
}

#[test]
fn expired_bans_are_swept_at_startup() {
    let path = temp_path("sweep");
    let peer = PeerId([3; 32]);

    {
        let db = sled::open(&path).unwrap();
        let ledger = ReputationLedger::open(
            &db,
            BanPolicy {
                ban_duration_seconds: 0,
                ..policy()
            },
        )
        .unwrap();
        // Zero-duration ban: expired the moment it lands.
        ledger.ban(&peer, "instant".into()).unwrap();
        ledger.flush().unwrap();
    }

    let db = sled::open(&path).unwrap();
    let ledger = ReputationLedger::open(&db, policy()).unwrap();
    assert!(!ledger.is_banned(&peer));
    assert!(ledger.get_ban(&peer).unwrap().is_none());

    drop(ledger);
    drop(db);
    let _ = std::fs::remove_dir_all(&path);
}

#[test]
fn accuracy_is_preserved_through_ban_cycles() {
    let path = temp_path("cycles");
    let peer = PeerId([4; 32]);

    let db = sled::open(&path).unwrap();
    let ledger = ReputationLedger::open(&db, policy()).unwrap();

    for outcome in [true, true, false, true] {
        ledger.on_verification_result(&peer, outcome).unwrap();
    }
    let before = ledger.get(&peer).unwrap().unwrap().accuracy();

    ledger.ban(&peer, "first".into()).unwrap();
    ledger.unban(&peer).unwrap();
    ledger.ban(&peer, "second".into()).unwrap();

    let after = ledger.get(&peer).unwrap().unwrap().accuracy();
    assert_eq!(before, after);
    assert!(ledger.is_banned(&peer));

    // Reset clears both counters and the ban.
    ledger.reset(&peer).unwrap();
    assert!(ledger.get(&peer).unwrap().is_none());
    assert!(!ledger.is_banned(&peer));

    drop(ledger);
    drop(db);
    let _ = std::fs::remove_dir_all(&path);
}
