//! Bounded duplicate-suppression caches.
//!
//! Flooded control and data traffic reaches a node several times; three
//! caches absorb the duplicates: the RREQ reverse-path cache, the
//! data-packet-seen cache, and the ack-seen cache. All three share one
//! structure: a capacity-bounded FIFO whose entries also expire after a
//! retention window. Expired entries are evicted from the front on every
//! operation; a full cache evicts its oldest entry to make room.

use embassy_time::{Duration, Instant};

struct CacheEntry<K, V> {
    key: K,
    value: V,
    inserted_at: Instant,
}

/// Bounded FIFO cache with wall-time eviction.
///
/// Insertion order is age order, so expiry only ever removes from the front.
/// Keys are unique; re-inserting an existing key updates the value in place
/// without refreshing its age.
pub(crate) struct TimedCache<K, V, const N: usize> {
    entries: heapless::Deque<CacheEntry<K, V>, N>,
    retention: Duration,
}

impl<K: PartialEq + Copy, V: Copy, const N: usize> TimedCache<K, V, N> {
    pub(crate) fn new(retention: Duration) -> Self {
        TimedCache {
            entries: heapless::Deque::new(),
            retention,
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.inserted_at) > self.retention {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether `key` is present and unexpired.
    pub(crate) fn contains(&mut self, key: K, now: Instant) -> bool {
        self.evict_expired(now);
        self.entries.iter().any(|e| e.key == key)
    }

    /// Value stored under `key`, if present and unexpired.
    pub(crate) fn get(&mut self, key: K, now: Instant) -> Option<V> {
        self.evict_expired(now);
        self.entries.iter().find(|e| e.key == key).map(|e| e.value)
    }

    /// Inserts `key -> value`. A duplicate key overwrites its value; a full
    /// cache drops its oldest entry first.
    pub(crate) fn insert(&mut self, key: K, value: V, now: Instant) {
        self.evict_expired(now);
        if let Some(existing) = self.entries.iter_mut().find(|e| e.key == key) {
            existing.value = value;
            return;
        }
        if self.entries.is_full() {
            self.entries.pop_front();
        }
        // Room was just guaranteed.
        let _ = self.entries.push_back(CacheEntry {
            key,
            value,
            inserted_at: now,
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
