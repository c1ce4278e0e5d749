//! Bounded key→value maps with access-order eviction.
//!
//! Used for event-id dedup, the known-peers cache, and the replay nonce
//! window.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// A bounded map that evicts its least-recently-used entry on overflow.
#[derive(Debug)]
pub struct BoundedLru<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> BoundedLru<K, V> {
    /// Create a map holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Insert, evicting the oldest entry when full. Re-inserting an
    /// existing key refreshes its recency.
    pub fn insert(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    /// Look up and refresh recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    /// Membership test without touching recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Insert if absent, refreshing recency either way. Returns `true`
    /// when the key was already present — the dedup "seen before" answer.
    pub fn check_and_insert(&mut self, key: K, value: V) -> bool {
        if self.inner.get(&key).is_some() {
            true
        } else {
            self.inner.put(key, value);
            false
        }
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// Retain entries for which the predicate holds.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool)
    where
        K: Clone,
    {
        let doomed: Vec<K> = self
            .inner
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.inner.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    /// Iterate entries from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_order() {
        let mut map = BoundedLru::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        assert!(!map.contains(&"a"));
        assert!(map.contains(&"b"));
        assert!(map.contains(&"c"));
    }

    #[test]
    fn test_access_refreshes_recency() {
        let mut map = BoundedLru::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        map.get(&"a");
        map.insert("c", 3);
        // "b" was least recently used after the touch of "a"
        assert!(map.contains(&"a"));
        assert!(!map.contains(&"b"));
    }

    #[test]
    fn test_check_and_insert() {
        let mut map = BoundedLru::new(8);
        assert!(!map.check_and_insert("evt1", ()));
        assert!(map.check_and_insert("evt1", ()));
    }

    #[test]
    fn test_dedup_holds_capacity_distinct_keys() {
        let capacity = 100;
        let mut map = BoundedLru::new(capacity);
        for i in 0..capacity {
            assert!(!map.check_and_insert(i, ()), "fresh key {i} reported seen");
        }
        // All capacity keys still known
        for i in 0..capacity {
            assert!(map.contains(&i));
        }
        assert_eq!(map.len(), capacity);
    }

    #[test]
    fn test_retain() {
        let mut map = BoundedLru::new(8);
        for i in 0..6 {
            map.insert(i, i * 10);
        }
        map.retain(|k, _| k % 2 == 0);
        assert_eq!(map.len(), 3);
        assert!(map.contains(&0));
        assert!(!map.contains(&1));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut map = BoundedLru::new(0);
        map.insert("a", 1);
        assert_eq!(map.capacity(), 1);
        assert_eq!(map.len(), 1);
    }
}
