//! Content-addressed duplicate suppression.
//!
//! A fingerprint over (message ∥ optional source id ∥ optional second-
//! truncated timestamp) keys an LRU+TTL cache. The map and the intrusive
//! LRU list move together under one mutex; the insert path evicts, so
//! cardinality never exceeds the configured cap at any observable moment.

use crate::clock::Clock;
use crate::config::{DedupConfig, HashAlgorithm};
use crate::sleeper::{Sleeper, TokioSleeper};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;

const NIL: usize = usize::MAX;

/// One cached fingerprint, linked into the LRU list by slab index.
#[derive(Debug)]
struct Slot {
    fingerprint: u64,
    created_at: u64,
    last_seen: u64,
    hit_count: u64,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<u64, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
}

impl CacheInner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// Remove a slot entirely, returning its slab index to the freelist.
    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        let fingerprint = self.slots[idx].fingerprint;
        self.map.remove(&fingerprint);
        self.free.push(idx);
    }

    fn insert_front(&mut self, fingerprint: u64, now: u64) {
        let slot = Slot {
            fingerprint,
            created_at: now,
            last_seen: now,
            hit_count: 1,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.map.insert(fingerprint, idx);
        self.push_front(idx);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// LRU+TTL fingerprint cache.
pub struct DedupCache {
    config: DedupConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl DedupCache {
    pub fn new(config: DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Compute the configured fingerprint.
    pub fn fingerprint(&self, source_id: &str, message: &str, timestamp: SystemTime) -> u64 {
        let ts_secs = timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        match self.config.hash_algorithm {
            HashAlgorithm::Xxh64 => {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write(message.as_bytes());
                if self.config.include_source_id {
                    hasher.write(source_id.as_bytes());
                }
                if self.config.include_timestamp {
                    hasher.write(&ts_secs.to_le_bytes());
                }
                hasher.finish()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(message.as_bytes());
                if self.config.include_source_id {
                    hasher.update(source_id.as_bytes());
                }
                if self.config.include_timestamp {
                    hasher.update(ts_secs.to_le_bytes());
                }
                let digest = hasher.finalize();
                u64::from_le_bytes(digest[..8].try_into().unwrap_or([0; 8]))
            }
        }
    }

    /// True if this fingerprint was already seen within the TTL.
    pub fn is_duplicate(&self, source_id: &str, message: &str, timestamp: SystemTime) -> bool {
        let fingerprint = self.fingerprint(source_id, message, timestamp);
        let now = self.clock.now_millis();
        let ttl = self.config.ttl().as_millis() as u64;

        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(&idx) = inner.map.get(&fingerprint) {
            if now.saturating_sub(inner.slots[idx].created_at) > ttl {
                // Stale: treat as unseen, restart its window.
                inner.remove(idx);
                inner.insert_front(fingerprint, now);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            inner.move_to_front(idx);
            let slot = &mut inner.slots[idx];
            slot.last_seen = now;
            slot.hit_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if inner.len() >= self.config.max_cache_size {
            let victim = inner.tail;
            if victim != NIL {
                inner.remove(victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.insert_front(fingerprint, now);
        self.misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Times the fingerprint of this triple has been observed, counting the
    /// initial insert.
    pub fn observations(&self, source_id: &str, message: &str, timestamp: SystemTime) -> Option<u64> {
        let fingerprint = self.fingerprint(source_id, message, timestamp);
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .map
            .get(&fingerprint)
            .map(|&idx| inner.slots[idx].hit_count)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            len: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// One maintenance sweep: drop TTL-expired entries, then trim the LRU
    /// tail if utilization still exceeds the cleanup threshold.
    pub fn cleanup(&self) {
        let now = self.clock.now_millis();
        let ttl = self.config.ttl().as_millis() as u64;
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let expired: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&idx| now.saturating_sub(inner.slots[idx].created_at) > ttl)
            .collect();
        let expired_count = expired.len() as u64;
        for idx in expired {
            inner.remove(idx);
        }
        self.expirations.fetch_add(expired_count, Ordering::Relaxed);

        let capacity = self.config.max_cache_size as f64;
        let utilization = inner.len() as f64 / capacity;
        if utilization > self.config.cleanup_threshold {
            let target = ((self.config.cleanup_threshold - 0.10).max(0.0) * capacity) as usize;
            let mut trimmed = 0u64;
            while inner.len() > target && inner.tail != NIL {
                let victim = inner.tail;
                inner.remove(victim);
                trimmed += 1;
            }
            self.evictions.fetch_add(trimmed, Ordering::Relaxed);
            tracing::debug!(trimmed, remaining = inner.len(), "dedup cache trimmed");
        }
    }

    /// Run the periodic sweep until cancellation.
    pub fn spawn_cleanup(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let sleeper = TokioSleeper;
        tokio::spawn(async move {
            let interval = cache.config.cleanup_interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleeper.sleep(interval) => cache.cleanup(),
                }
            }
        })
    }

    /// Structural check used by tests: map and list describe the same set.
    #[cfg(test)]
    fn check_invariants(&self) {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut walked = 0;
        let mut idx = inner.head;
        let mut prev = NIL;
        while idx != NIL {
            assert_eq!(inner.slots[idx].prev, prev, "prev link broken at {idx}");
            assert_eq!(
                inner.map.get(&inner.slots[idx].fingerprint),
                Some(&idx),
                "map entry missing for linked slot"
            );
            prev = idx;
            idx = inner.slots[idx].next;
            walked += 1;
            assert!(walked <= inner.map.len(), "cycle in LRU list");
        }
        assert_eq!(walked, inner.map.len(), "list and map disagree on size");
        assert_eq!(inner.tail, prev, "tail does not terminate the list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with(max: usize, ttl_secs: u64, clock: ManualClock) -> DedupCache {
        DedupCache::new(
            DedupConfig {
                max_cache_size: max,
                ttl_secs,
                include_timestamp: false,
                include_source_id: true,
                ..Default::default()
            },
            Arc::new(clock),
        )
    }

    fn ts() -> SystemTime {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn first_seen_is_not_a_duplicate() {
        let cache = cache_with(10, 60, ManualClock::new());
        assert!(!cache.is_duplicate("s", "hello", ts()));
        assert!(cache.is_duplicate("s", "hello", ts()));
        cache.check_invariants();
    }

    #[test]
    fn distinct_sources_have_distinct_fingerprints() {
        let cache = cache_with(10, 60, ManualClock::new());
        assert!(!cache.is_duplicate("a", "hello", ts()));
        assert!(!cache.is_duplicate("b", "hello", ts()));
    }

    #[test]
    fn source_id_can_be_excluded_from_fingerprint() {
        let cache = DedupCache::new(
            DedupConfig { include_source_id: false, ..Default::default() },
            Arc::new(ManualClock::new()),
        );
        assert!(!cache.is_duplicate("a", "hello", ts()));
        assert!(cache.is_duplicate("b", "hello", ts()));
    }

    #[test]
    fn ttl_expiry_resets_the_window() {
        let clock = ManualClock::new();
        let cache = cache_with(10, 1, clock.clone());
        assert!(!cache.is_duplicate("s", "m", ts()));
        clock.advance(500);
        assert!(cache.is_duplicate("s", "m", ts()));
        clock.advance(600); // 1.1s since insert
        assert!(!cache.is_duplicate("s", "m", ts()), "expired entries read as new");
        assert!(cache.is_duplicate("s", "m", ts()), "and restart their window");
        assert_eq!(cache.stats().expirations, 1);
        cache.check_invariants();
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = cache_with(3, 60, ManualClock::new());
        for msg in ["a", "b", "c"] {
            assert!(!cache.is_duplicate("s", msg, ts()));
        }
        assert_eq!(cache.len(), 3);

        // "a" is LRU; the fourth insert evicts it.
        assert!(!cache.is_duplicate("s", "d", ts()));
        assert_eq!(cache.len(), 3);
        assert!(!cache.is_duplicate("s", "a", ts()), "evicted entry reads as new");
        cache.check_invariants();
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let cache = cache_with(3, 60, ManualClock::new());
        for msg in ["a", "b", "c"] {
            assert!(!cache.is_duplicate("s", msg, ts()));
        }
        // Touch "a": now "b" is the eviction victim.
        assert!(cache.is_duplicate("s", "a", ts()));
        assert!(!cache.is_duplicate("s", "d", ts()));
        assert!(cache.is_duplicate("s", "a", ts()));
        assert!(!cache.is_duplicate("s", "b", ts()), "b was evicted, not a");
        cache.check_invariants();
    }

    #[test]
    fn hit_count_counts_every_observation() {
        let cache = cache_with(10, 60, ManualClock::new());
        for _ in 0..5 {
            cache.is_duplicate("x", "hello", ts());
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.observations("x", "hello", ts()), Some(5));
    }

    #[test]
    fn timestamp_truncates_to_seconds_when_included() {
        let cache = DedupCache::new(
            DedupConfig { include_timestamp: true, ..Default::default() },
            Arc::new(ManualClock::new()),
        );
        let base = ts();
        assert!(!cache.is_duplicate("s", "m", base));
        assert!(
            cache.is_duplicate("s", "m", base + std::time::Duration::from_millis(400)),
            "same second, same fingerprint"
        );
        assert!(
            !cache.is_duplicate("s", "m", base + std::time::Duration::from_secs(2)),
            "different second, different fingerprint"
        );
    }

    #[test]
    fn sha256_mode_behaves_the_same() {
        let cache = DedupCache::new(
            DedupConfig { hash_algorithm: HashAlgorithm::Sha256, ..Default::default() },
            Arc::new(ManualClock::new()),
        );
        assert!(!cache.is_duplicate("s", "hello", ts()));
        assert!(cache.is_duplicate("s", "hello", ts()));
        assert!(!cache.is_duplicate("s", "other", ts()));
    }

    #[test]
    fn cleanup_sweeps_expired_and_trims_above_threshold() {
        let clock = ManualClock::new();
        let cache = DedupCache::new(
            DedupConfig {
                max_cache_size: 100,
                ttl_secs: 1,
                cleanup_threshold: 0.5,
                ..Default::default()
            },
            Arc::new(clock.clone()),
        );

        for i in 0..40 {
            cache.is_duplicate("s", &format!("old-{i}"), ts());
        }
        clock.advance(2_000);
        for i in 0..60 {
            cache.is_duplicate("s", &format!("new-{i}"), ts());
        }
        assert_eq!(cache.len(), 100);

        cache.cleanup();
        // The 40 stale entries expire; 60 remain, utilization 0.6 > 0.5, so
        // the tail trims down to the threshold minus ten points: 40.
        assert_eq!(cache.len(), 40);
        cache.check_invariants();
    }

    #[test]
    fn eviction_counters_add_up() {
        let cache = cache_with(2, 60, ManualClock::new());
        cache.is_duplicate("s", "a", ts());
        cache.is_duplicate("s", "b", ts());
        cache.is_duplicate("s", "c", ts());
        let stats = cache.stats();
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.len, 2);
    }
}
