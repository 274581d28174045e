//! Duplicate suppression for received envelopes.
//!
//! Transports may deliver the same envelope twice (a publish retried across a bus reconnect,
//! a socket frame resent after a redial). This cache remembers `(sender, id)` pairs for a
//! bounded window so each envelope instance is dispatched at most once locally.
//!
//! Entries expire after the TTL; when the cache is full the oldest entry is evicted first.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Identity of one envelope instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    sender: String,
    id: u64,
}

/// TTL-based dedup cache with FIFO eviction
///
/// All entries share one TTL, so insertion order is also expiry order and both expiry and
/// eviction pop from the front of the queue.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashSet<CacheKey>,
    insertion_order: VecDeque<(Instant, CacheKey)>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    /// Default TTL: 5 minutes. Default max entries: 10,000.
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(300), 10_000)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashSet::new(),
            insertion_order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record an envelope; returns true if it was already seen inside the window.
    pub fn is_duplicate(&mut self, sender: &str, id: u64) -> bool {
        let now = Instant::now();
        self.cleanup_expired(now);

        let key = CacheKey {
            sender: sender.to_string(),
            id,
        };

        if self.seen.contains(&key) {
            debug!(sender, id, "Duplicate envelope suppressed");
            return true;
        }

        while self.seen.len() >= self.max_entries {
            match self.insertion_order.pop_front() {
                Some((_, oldest)) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key.clone());
        self.insertion_order.push_back((now, key));
        trace!(sender, id, "Envelope recorded");
        false
    }

    fn cleanup_expired(&mut self, now: Instant) {
        let mut removed = 0usize;
        while let Some((added_at, _)) = self.insertion_order.front() {
            if now.duration_since(*added_at) < self.ttl {
                break;
            }
            if let Some((_, key)) = self.insertion_order.pop_front() {
                self.seen.remove(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            trace!(removed, "Expired dedup entries");
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.insertion_order.clear();
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}
