/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use linked_hash_map::LinkedHashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Bounded LRU map whose entries are computed at most once.
///
/// The map lock is only held to find or create an entry's cell; the value
/// itself is computed outside it, so different keys compute in parallel
/// while concurrent requests for the same key wait for one computation.
pub struct LruCache<K, V> {
    entries: Mutex<LinkedHashMap<K, Arc<OnceCell<V>>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LinkedHashMap::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn cell(&self, key: &K) -> Arc<OnceCell<V>> {
        let mut entries = self.entries.lock();
        if let Some(cell) = entries.get_refresh(key) {
            return cell.clone();
        }
        let cell = Arc::new(OnceCell::new());
        entries.insert(key.clone(), cell.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        cell
    }

    /// Returns the cached value for `key` or computes and caches it. A
    /// failed computation caches nothing.
    pub fn get_or_try_compute<E>(&self, key: &K, compute: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        let cell = self.cell(key);
        let mut computed = false;
        let value = cell.get_or_try_init(|| {
            computed = true;
            compute()
        })?;
        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value.clone())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        entries.get_refresh(key).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache: LruCache<String, u32> = LruCache::new(10);
        let calls = AtomicUsize::new(0);
        let compute = || -> Result<u32, ()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        };
        assert_eq!(Ok(7), cache.get_or_try_compute(&"a".to_owned(), compute));
        assert_eq!(Ok(7), cache.get_or_try_compute(&"a".to_owned(), compute));
        assert_eq!(1, calls.load(Ordering::SeqCst));
        let stats = cache.stats();
        assert_eq!((1, 1, 0, 1), (stats.hits, stats.misses, stats.evictions, stats.entries));
    }

    #[test]
    fn test_lru_eviction() {
        let cache: LruCache<u32, u32> = LruCache::new(2);
        for k in [1, 2] {
            cache.get_or_try_compute(&k, || Ok::<_, ()>(k)).unwrap();
        }
        // Touch 1 so 2 is the least recently used.
        assert_eq!(Some(1), cache.get(&1));
        cache.get_or_try_compute(&3, || Ok::<_, ()>(3)).unwrap();
        assert_eq!(None, cache.get(&2));
        assert_eq!(Some(1), cache.get(&1));
        assert_eq!(Some(3), cache.get(&3));
        assert_eq!(1, cache.stats().evictions);
    }

    #[test]
    fn test_failure_is_not_cached() {
        let cache: LruCache<u32, u32> = LruCache::new(2);
        assert_eq!(Err("nope"), cache.get_or_try_compute(&1, || Err("nope")));
        assert_eq!(Ok(5), cache.get_or_try_compute(&1, || Ok::<_, &str>(5)));
    }

    #[test]
    fn test_concurrent_same_key_computes_once() {
        let cache: LruCache<u32, u32> = LruCache::new(4);
        let calls = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    cache
                        .get_or_try_compute(&1, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok::<_, ()>(1)
                        })
                        .unwrap()
                });
            }
        });
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
