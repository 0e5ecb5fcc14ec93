// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cache structures over the store.
//!
//! A [`LookupCache`] hydrates values on demand through an external lookup
//! and evicts least-recently-used entries once over capacity. A
//! [`MergeCache`] accumulates per-key deltas and flushes them with a
//! two-phase conditional commit, re-queuing any delta another worker raced.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;

/// Fills cache misses from the store. Implementations insert whatever
/// sentinel they use for missing entries.
pub trait ExternalLookup<K, V> {
    fn lookup_insert(&mut self, cache: &mut LookupCache<K, V>, key: &K);
}

/// LRU lookup cache. Entries removed explicitly by the scheduler are
/// exempt from capacity pressure until they are touched again.
pub struct LookupCache<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
    lru_eviction: bool,
}

impl<K: Clone + Eq + Hash, V> LookupCache<K, V> {
    pub fn new(capacity: usize) -> LookupCache<K, V> {
        LookupCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            lru_eviction: true,
        }
    }

    /// Turn LRU eviction off; the scheduler then manages entries itself.
    pub fn set_lru_eviction(&mut self, enabled: bool) {
        self.lru_eviction = enabled;
    }

    /// Get the value for `key`, hydrating through `external` on a miss.
    pub fn lookup<'a>(
        &'a mut self,
        key: &K,
        external: &mut dyn ExternalLookup<K, V>,
    ) -> Option<&'a V> {
        if !self.entries.contains_key(key) {
            external.lookup_insert(self, key);
        }
        self.touch(key);
        self.evict();
        self.entries.get(key)
    }

    /// Get without hydrating.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn is_member(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a value directly, e.g. when the caller already has the data.
    pub fn insert(&mut self, key: K, value: V) {
        self.order.retain(|entry| entry != &key);
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|entry| entry != key);
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &K) {
        if let Some(position) = self.order.iter().position(|entry| entry == key) {
            self.order.remove(position);
            self.order.push_back(key.clone());
        } else if self.entries.contains_key(key) {
            self.order.push_back(key.clone());
        }
    }

    fn evict(&mut self) {
        if !self.lru_eviction {
            return;
        }
        while self.order.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Accumulating cache of deltas to be merged into the store. The flush
/// protocol runs in two transactions: the first reads the persisted bytes
/// for each dirty key with timestamps enabled, the second merges the delta
/// into each value and commits with a conditional try-replace. Deltas whose
/// commit was raced are re-inserted for the next flush.
pub struct MergeCache<K, D> {
    deltas: HashMap<K, D>,
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash, D> MergeCache<K, D> {
    pub fn new() -> MergeCache<K, D> {
        MergeCache {
            deltas: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Merge a delta into the pending entry for `key`.
    pub fn insert_with(&mut self, key: K, delta: D, merge: impl FnOnce(&mut D, D)) {
        match self.deltas.get_mut(&key) {
            Some(pending) => merge(pending, delta),
            None => {
                self.order.push_back(key.clone());
                self.deltas.insert(key, delta);
            }
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut D> {
        self.deltas.get_mut(key)
    }

    pub fn or_insert_with(&mut self, key: &K, make: impl FnOnce() -> D) -> &mut D {
        if !self.deltas.contains_key(key) {
            self.order.push_back(key.clone());
            self.deltas.insert(key.clone(), make());
        }
        self.deltas.get_mut(key).expect("just inserted")
    }

    /// Take up to `limit` dirty entries, oldest first, for one flush batch.
    pub fn take_batch(&mut self, limit: usize) -> Vec<(K, D)> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(delta) = self.deltas.remove(&key) {
                batch.push((key, delta));
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

impl<K: Clone + Eq + Hash, D> Default for MergeCache<K, D> {
    fn default() -> Self {
        MergeCache::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Doubler;

    impl ExternalLookup<u32, Option<u32>> for Doubler {
        fn lookup_insert(&mut self, cache: &mut LookupCache<u32, Option<u32>>, key: &u32) {
            // missing entries get a None sentinel, like store misses.
            let value = (*key < 100).then(|| key * 2);
            cache.insert(*key, value);
        }
    }

    #[test]
    fn test_lookup_hydrates_and_remembers() {
        let mut cache = LookupCache::new(16);
        assert_eq!(cache.lookup(&3, &mut Doubler), Some(&Some(6)));
        assert_eq!(cache.peek(&3), Some(&Some(6)));
        // missing entries are cached as None so the store is asked once.
        assert_eq!(cache.lookup(&500, &mut Doubler), Some(&None));
        assert!(cache.is_member(&500));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = LookupCache::new(2);
        cache.lookup(&1, &mut Doubler);
        cache.lookup(&2, &mut Doubler);
        cache.lookup(&3, &mut Doubler);
        assert!(!cache.is_member(&1));
        assert!(cache.is_member(&2));
        assert!(cache.is_member(&3));

        cache.set_lru_eviction(false);
        cache.lookup(&4, &mut Doubler);
        cache.lookup(&5, &mut Doubler);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_merge_cache_batches() {
        let mut cache: MergeCache<&'static str, Vec<u32>> = MergeCache::new();
        cache.insert_with("a", vec![1], |pending, new| pending.extend(new));
        cache.insert_with("b", vec![2], |pending, new| pending.extend(new));
        cache.insert_with("a", vec![3], |pending, new| pending.extend(new));

        let batch = cache.take_batch(1);
        assert_eq!(batch, vec![("a", vec![1, 3])]);
        assert_eq!(cache.len(), 1);

        // a raced delta goes back in for the next attempt.
        cache.insert_with("a", vec![1, 3], |pending, new| pending.extend(new));
        assert_eq!(cache.len(), 2);
    }
}
