//! Least-Recently-Used Cache with Eviction Lookahead
//!
//! Backs both the main block cache and the prefetch cache. Besides the
//! usual get/insert/evict surface it tracks hit/miss/unused statistics and
//! supports `next_nth_eviction`, which tells the prefetcher which key a
//! future insertion would push out without mutating anything. That peek is
//! what stops a prefetch burst from evicting results the same burst is
//! about to use.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: usize,
    pub misses: usize,
    /// Entries that were evicted (or cleared out) without a single get hit.
    pub unused_entries: usize,
    /// High-water mark of the fill size.
    pub max_size: usize,
    pub capacity: usize,
}

struct Entry<V> {
    value: V,
    /// Key into the recency index. Larger stamp = more recently used.
    stamp: u64,
    accessed: bool,
}

pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    /// Recency index: stamp -> key, oldest first.
    recency: BTreeMap<u64, K>,
    clock: u64,
    hits: usize,
    misses: usize,
    unused_entries: usize,
    max_size: usize,
}

impl<K: Clone + Eq + Hash, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "a zero-capacity cache cannot hold anything");
        LruCache {
            capacity: capacity.max(1),
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            clock: 0,
            hits: 0,
            misses: 0,
            unused_entries: 0,
            max_size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key, recording a hit or miss and marking the entry as the
    /// most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.clock += 1;
        let clock = self.clock;
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.hits += 1;
                entry.accessed = true;
                self.recency.remove(&entry.stamp);
                entry.stamp = clock;
                self.recency.insert(clock, key.clone());
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Existence check without any side effects, not even on recency.
    pub fn test(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Mark a key as most recently used if present. Does not count as an
    /// access in the statistics.
    pub fn touch(&mut self, key: &K) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.stamp);
            entry.stamp = clock;
            self.recency.insert(clock, key.clone());
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.clock += 1;
        let clock = self.clock;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            self.recency.remove(&entry.stamp);
            entry.stamp = clock;
            self.recency.insert(clock, key);
            return;
        }

        while self.entries.len() >= self.capacity {
            self.evict_lru();
        }

        self.entries.insert(
            key.clone(),
            Entry {
                value,
                stamp: clock,
                accessed: false,
            },
        );
        self.recency.insert(clock, key);
        self.max_size = self.max_size.max(self.entries.len());
    }

    pub fn evict(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.stamp);
            if !entry.accessed {
                self.unused_entries += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.shrink_to(0);
    }

    /// Evict least-recently-used entries until at most `size` remain. The
    /// capacity is unchanged; this also finalizes the unused-entries count
    /// for everything dropped.
    pub fn shrink_to(&mut self, size: usize) {
        while self.entries.len() > size {
            self.evict_lru();
        }
    }

    /// Which key would be evicted by the n-th future insertion (n >= 1) of
    /// fresh keys, assuming no other operations in between. `None` while the
    /// cache would still have room at that point.
    pub fn next_nth_eviction(&self, n: usize) -> Option<K> {
        let overshoot = (self.entries.len() + n).checked_sub(self.capacity)?;
        if overshoot == 0 || overshoot > self.entries.len() {
            return None;
        }
        self.recency.values().nth(overshoot - 1).cloned()
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits,
            misses: self.misses,
            unused_entries: self.unused_entries,
            max_size: self.max_size,
            capacity: self.capacity,
        }
    }

    fn evict_lru(&mut self) {
        let oldest_stamp = self.recency.keys().next().copied();
        if let Some(stamp) = oldest_stamp {
            let key = self.recency.remove(&stamp).unwrap();
            if let Some(entry) = self.entries.remove(&key) {
                if !entry.accessed {
                    self.unused_entries += 1;
                }
            }
        }
    }
}
