//! Bounded cache of completed order ids
//!
//! Lets a writer skip the on-chain duplicate query for orders it has just
//! delivered itself. Entries expire after a TTL and the oldest entry is
//! evicted once the cache is full, so memory stays flat under long runtimes.
//!
//! Each entry is ~40 bytes (32-byte id + 8-byte Instant): 100k entries ≈ 4 MB.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use alloy::primitives::B256;

pub const DEFAULT_ORDER_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_ORDER_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

pub struct OrderCache {
    map: HashMap<B256, Instant>,
    order: VecDeque<(B256, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl Default for OrderCache {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER_CACHE_SIZE, DEFAULT_ORDER_CACHE_TTL_SECS)
    }
}

impl OrderCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, id: &B256) -> bool {
        self.map.get(id).is_some_and(|t| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, id: B256) {
        let now = Instant::now();
        self.evict(now);
        self.map.insert(id, now);
        self.order.push_back((id, now));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop expired entries, then the oldest until there is room for one more
    fn evict(&mut self, now: Instant) {
        while let Some(&(id, inserted)) = self.order.front() {
            let expired = now.duration_since(inserted) >= self.ttl;
            if !expired && self.map.len() < self.max_size {
                break;
            }
            self.order.pop_front();
            // A re-inserted id has a newer timestamp in the map; keep that one
            if self.map.get(&id) == Some(&inserted) {
                self.map.remove(&id);
            }
        }
    }
}
