// src/trading/dedup.rs
//
// Fixed-capacity, time-windowed de-duplication of launch events.
// Owned by a single detector task, so it needs no locking.

use ethers::types::H256;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupStats {
    pub checked: u64,
    pub duplicates: u64,
    pub expired: u64,
    /// Entries pushed out by capacity before their window ended.
    pub displaced: u64,
}

/// Remembers launch transaction hashes for `ttl`, holding at most `capacity`.
///
/// Expired entries are evicted first; if the window is still full the oldest
/// entry is displaced. Nothing is ever cleared wholesale.
pub struct LaunchDeduplicator {
    seen: HashMap<H256, Instant>,
    order: VecDeque<(H256, Instant)>,
    capacity: usize,
    ttl: Duration,
    stats: DedupStats,
}

impl LaunchDeduplicator {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
            stats: DedupStats::default(),
        }
    }

    /// Returns `true` the first time `key` is observed inside the window.
    pub fn observe(&mut self, key: H256) -> bool {
        self.observe_at(key, Instant::now())
    }

    pub fn observe_at(&mut self, key: H256, now: Instant) -> bool {
        self.stats.checked += 1;
        self.evict_expired(now);

        if self.seen.contains_key(&key) {
            self.stats.duplicates += 1;
            return false;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, _)) => {
                    self.seen.remove(&oldest);
                    self.stats.displaced += 1;
                }
                None => break,
            }
        }

        self.seen.insert(key, now);
        self.order.push_back((key, now));
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front().copied() {
            if now.saturating_duration_since(at) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&key);
            self.stats.expired += 1;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn stats(&self) -> DedupStats {
        self.stats.clone()
    }
}
