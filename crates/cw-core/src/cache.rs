//! A small capacity-bounded TTL cache.
//!
//! Shared by the heartbeat dedup cache and the channel-resolution cache.
//! Expired entries are evicted first; when the cache is still full, the
//! oldest insertion goes. Lookups take `&mut self` because expired entries
//! are removed lazily on access. Methods with an `_at` suffix take an
//! explicit [`Instant`] so tests can drive the clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Map with per-entry expiry and a hard capacity.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    /// Creates a cache holding at most `capacity` entries for `ttl` each.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one(now);
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Inserts only if the key is absent or expired.
    ///
    /// Returns `true` when the insert happened, `false` on a fresh hit.
    /// This is the dedup primitive: a `false` means "seen recently".
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        self.insert_if_absent_at(key, value, Instant::now())
    }

    pub fn insert_if_absent_at(&mut self, key: K, value: V, now: Instant) -> bool {
        if let Some(entry) = self.entries.get(&key) {
            if entry.expires_at > now {
                return false;
            }
        }
        self.insert_at(key, value, now);
        true
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at <= now,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Drops all expired entries.
    pub fn purge_expired(&mut self) {
        self.purge_expired_at(Instant::now());
    }

    pub fn purge_expired_at(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frees one slot: expired entries first, then the oldest insertion.
    ///
    /// Linear scan; capacities here are small enough (tens of thousands)
    /// that this beats carrying an ordered index.
    fn evict_one(&mut self, now: Instant) {
        self.purge_expired_at(now);
        if self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn get_returns_fresh_entries() {
        let mut cache = TtlCache::new(TTL, 10);
        let now = Instant::now();
        cache.insert_at("k", 1, now);
        assert_eq!(cache.get_at(&"k", now + Duration::from_secs(10)), Some(&1));
    }

    #[test]
    fn get_expires_old_entries() {
        let mut cache = TtlCache::new(TTL, 10);
        let now = Instant::now();
        cache.insert_at("k", 1, now);
        assert_eq!(cache.get_at(&"k", now + TTL), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_if_absent_detects_duplicates() {
        let mut cache = TtlCache::new(TTL, 10);
        let now = Instant::now();
        assert!(cache.insert_if_absent_at("k", (), now));
        assert!(!cache.insert_if_absent_at("k", (), now + Duration::from_secs(60)));
        // After expiry the key counts as new again.
        assert!(cache.insert_if_absent_at("k", (), now + TTL + Duration::from_secs(1)));
    }

    #[test]
    fn eviction_prefers_expired_entries() {
        let mut cache = TtlCache::new(TTL, 2);
        let now = Instant::now();
        cache.insert_at("old", 1, now);
        cache.insert_at("fresh", 2, now + TTL);
        // "old" is expired by now + TTL; inserting a third keeps "fresh".
        cache.insert_at("new", 3, now + TTL);
        assert_eq!(cache.get_at(&"fresh", now + TTL), Some(&2));
        assert_eq!(cache.get_at(&"new", now + TTL), Some(&3));
        assert_eq!(cache.get_at(&"old", now + TTL), None);
    }

    #[test]
    fn eviction_under_pressure_drops_oldest() {
        let mut cache = TtlCache::new(TTL, 2);
        let now = Instant::now();
        cache.insert_at("first", 1, now);
        cache.insert_at("second", 2, now + Duration::from_secs(1));
        cache.insert_at("third", 3, now + Duration::from_secs(2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&"first", now + Duration::from_secs(2)), None);
        assert_eq!(cache.get_at(&"second", now + Duration::from_secs(2)), Some(&2));
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let mut cache = TtlCache::new(TTL, 2);
        let now = Instant::now();
        cache.insert_at("a", 1, now);
        cache.insert_at("b", 2, now);
        cache.insert_at("a", 10, now + Duration::from_secs(1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&"a", now + Duration::from_secs(1)), Some(&10));
        assert_eq!(cache.get_at(&"b", now + Duration::from_secs(1)), Some(&2));
    }

    #[test]
    fn purge_expired_removes_only_stale() {
        let mut cache = TtlCache::new(TTL, 10);
        let now = Instant::now();
        cache.insert_at("stale", 1, now);
        cache.insert_at("fresh", 2, now + Duration::from_secs(200));
        cache.purge_expired_at(now + TTL);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at(&"fresh", now + TTL), Some(&2));
    }
}
