//! Result inbox.
//!
//! Inbound drafts parked per auction key until the speculative loop collects
//! them. Each key holds a bounded FIFO; a fingerprint LRU bounds the total
//! number of requests tracked, so a never-terminating or abandoned request
//! cannot grow the map without limit. Push when full drops the draft and
//! counts it.

use crate::types::{AuctionKey, Draft, Fingerprint};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct InboxStats {
    pub fingerprints: usize,
    pub dropped_full: u64,
    pub dropped_evicted: u64,
}

struct InboxInner {
    /// fingerprint -> sequence -> queued drafts
    queues: HashMap<Fingerprint, HashMap<u32, VecDeque<Draft>>>,
    /// Least-recently-pushed fingerprint ordering for the LRU lid.
    lru: VecDeque<Fingerprint>,
}

pub struct ResultInbox {
    inner: Mutex<InboxInner>,
    notify: Notify,
    capacity_per_key: usize,
    fingerprint_capacity: usize,
    dropped_full: AtomicU64,
    dropped_evicted: AtomicU64,
}

impl ResultInbox {
    pub fn new(capacity_per_key: usize, fingerprint_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(InboxInner {
                queues: HashMap::new(),
                lru: VecDeque::new(),
            }),
            notify: Notify::new(),
            capacity_per_key: capacity_per_key.max(1),
            fingerprint_capacity: fingerprint_capacity.max(1),
            dropped_full: AtomicU64::new(0),
            dropped_evicted: AtomicU64::new(0),
        }
    }

    /// Park a draft under its auction key.
    pub fn push(&self, key: AuctionKey, draft: Draft) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pos) = inner.lru.iter().position(|fp| *fp == key.fingerprint) {
            inner.lru.remove(pos);
        } else if inner.lru.len() >= self.fingerprint_capacity {
            // Evict the coldest fingerprint wholesale.
            if let Some(evicted) = inner.lru.pop_front() {
                if let Some(queues) = inner.queues.remove(&evicted) {
                    let lost: usize = queues.values().map(|q| q.len()).sum();
                    self.dropped_evicted.fetch_add(lost as u64, Ordering::Relaxed);
                    debug!("inbox evicted fingerprint {} ({} draft(s))", evicted, lost);
                }
            }
        }
        inner.lru.push_back(key.fingerprint);

        let queue = inner
            .queues
            .entry(key.fingerprint)
            .or_default()
            .entry(key.sequence)
            .or_default();
        if queue.len() >= self.capacity_per_key {
            self.dropped_full.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.push_back(draft);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// First draft for the key, waiting up to the deadline for one to arrive.
    pub async fn pop_until(&self, key: AuctionKey, deadline: Instant) -> Option<Draft> {
        loop {
            let notified = self.notify.notified();
            if let Some(draft) = self.try_pop(&key) {
                return Some(draft);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(&key);
            }
        }
    }

    fn try_pop(&self, key: &AuctionKey) -> Option<Draft> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .get_mut(&key.fingerprint)?
            .get_mut(&key.sequence)?
            .pop_front()
    }

    /// Free every per-sequence queue of a finished request.
    pub fn drop_fingerprint(&self, fingerprint: &Fingerprint) {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.remove(fingerprint);
        if let Some(pos) = inner.lru.iter().position(|fp| fp == fingerprint) {
            inner.lru.remove(pos);
        }
    }

    pub fn stats(&self) -> InboxStats {
        let inner = self.inner.lock().unwrap();
        InboxStats {
            fingerprints: inner.queues.len(),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_evicted: self.dropped_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;
    use std::time::Duration;

    fn make_draft(seq: u32, token: &str) -> Draft {
        Draft {
            peer_id: PeerId([9; 32]),
            sequence: seq,
            tokens: vec![token.to_string()],
            latency_ms: 1.0,
            is_verification_answer: false,
        }
    }

    #[tokio::test]
    async fn push_pop_in_fifo_order() {
        let inbox = ResultInbox::new(4, 8);
        let fp = Fingerprint::generate();
        let key = AuctionKey::new(fp, 0);
        inbox.push(key, make_draft(0, "a"));
        inbox.push(key, make_draft(0, "b"));

        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(inbox.pop_until(key, deadline).await.unwrap().tokens, vec!["a"]);
        assert_eq!(inbox.pop_until(key, deadline).await.unwrap().tokens, vec!["b"]);
    }

    #[tokio::test]
    async fn pop_times_out_empty() {
        let inbox = ResultInbox::new(4, 8);
        let key = AuctionKey::new(Fingerprint::generate(), 3);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(inbox.pop_until(key, deadline).await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let inbox = std::sync::Arc::new(ResultInbox::new(4, 8));
        let fp = Fingerprint::generate();
        let key = AuctionKey::new(fp, 1);

        let pusher = inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(key, make_draft(1, "late"));
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let draft = inbox.pop_until(key, deadline).await.unwrap();
        assert_eq!(draft.tokens, vec!["late"]);
    }

    #[tokio::test]
    async fn per_key_capacity_drops_overflow() {
        let inbox = ResultInbox::new(2, 8);
        let key = AuctionKey::new(Fingerprint::generate(), 0);
        for i in 0..5 {
            inbox.push(key, make_draft(0, &i.to_string()));
        }
        assert_eq!(inbox.stats().dropped_full, 3);
    }

    #[tokio::test]
    async fn lru_lid_evicts_coldest_fingerprint() {
        let inbox = ResultInbox::new(4, 2);
        let cold = Fingerprint::generate();
        let warm = Fingerprint::generate();
        let hot = Fingerprint::generate();

        inbox.push(AuctionKey::new(cold, 0), make_draft(0, "c"));
        inbox.push(AuctionKey::new(warm, 0), make_draft(0, "w"));
        // Third fingerprint evicts the coldest.
        inbox.push(AuctionKey::new(hot, 0), make_draft(0, "h"));

        assert_eq!(inbox.stats().fingerprints, 2);
        assert_eq!(inbox.stats().dropped_evicted, 1);
        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(inbox.pop_until(AuctionKey::new(cold, 0), deadline).await.is_none());
        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(inbox.pop_until(AuctionKey::new(hot, 0), deadline).await.is_some());
    }

    #[tokio::test]
    async fn drop_fingerprint_clears_all_sequences() {
        let inbox = ResultInbox::new(4, 8);
        let fp = Fingerprint::generate();
        inbox.push(AuctionKey::new(fp, 0), make_draft(0, "a"));
        inbox.push(AuctionKey::new(fp, 1), make_draft(1, "b"));
        inbox.drop_fingerprint(&fp);
        assert_eq!(inbox.stats().fingerprints, 0);
    }
}
