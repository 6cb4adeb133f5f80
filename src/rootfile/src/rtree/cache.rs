use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::rtree::BasketData;

struct Slot {
    basket: Arc<BasketData>,
    size: usize,
    last_access: u64,
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<i64, Slot>,
    bytes: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// BasketCache keeps decoded baskets, keyed by their file offset, within a
/// byte budget. The least recently used basket is evicted first.
pub struct BasketCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

/// CacheStats counts lookups since the cache was created or cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub baskets: usize,
    pub bytes: usize,
}

impl BasketCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn get(&self, seek: i64) -> Option<Arc<BasketData>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.slots.get_mut(&seek) {
            Some(slot) => {
                slot.last_access = tick;
                let basket = slot.basket.clone();
                inner.hits += 1;
                Some(basket)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// put caches a basket, evicting older ones to stay within budget.
    /// Baskets larger than the whole budget are not cached.
    pub fn put(&self, seek: i64, basket: Arc<BasketData>) {
        let size = basket.size();
        if size > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(slot) = inner.slots.get_mut(&seek) {
            slot.last_access = tick;
            return;
        }

        while inner.bytes + size > self.max_bytes {
            let lru = inner
                .slots
                .iter()
                .min_by_key(|(_, s)| s.last_access)
                .map(|(k, _)| *k);
            match lru.and_then(|k| inner.slots.remove(&k).map(|s| (k, s))) {
                Some((k, removed)) => {
                    inner.bytes -= removed.size;
                    tracing::trace!("evicted basket at {} ({} bytes)", k, removed.size);
                }
                None => break,
            }
        }

        inner.bytes += size;
        inner.slots.insert(
            seek,
            Slot {
                basket,
                size,
                last_access: tick,
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = CacheInner::default();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            baskets: inner.slots.len(),
            bytes: inner.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::rtree::{BasketCache, BasketData};

    fn basket(len: usize) -> Arc<BasketData> {
        Arc::new(BasketData::fixed(0, vec![0; len], 1))
    }

    #[test]
    fn test_lru_eviction_by_bytes() {
        let cache = BasketCache::new(100);
        cache.put(1, basket(40));
        cache.put(2, basket(40));
        assert!(cache.get(1).is_some());

        // 2 is now the least recently used one.
        cache.put(3, basket(40));
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());

        let stats = cache.stats();
        assert_eq!(stats.baskets, 2);
        assert_eq!(stats.bytes, 80);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_oversized_not_cached() {
        let cache = BasketCache::new(10);
        cache.put(1, basket(20));
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_clear() {
        let cache = BasketCache::new(100);
        cache.put(1, basket(10));
        cache.put(1, basket(10));
        assert_eq!(cache.stats().bytes, 10);
        cache.clear();
        assert_eq!(cache.stats(), Default::default());
    }
}
