//! In-process response cache.
//!
//! Entries carry their own expiry time and are checked on read; an expired
//! entry is removed and reported as a miss. Capacity is bounded by
//! `quick_cache`, which evicts cold entries once full.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colander_core::{CacheKey, ClockSource, ResponseCache, StoreError, SystemClock};
use quick_cache::sync::Cache;

/// Sizing for [`MemoryResponseCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries kept.
    pub capacity: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Clone)]
struct CachedValue {
    bytes: Arc<Vec<u8>>,
    expires_at_ms: u64,
}

/// Bounded [`ResponseCache`] held in process memory.
pub struct MemoryResponseCache {
    entries: Cache<String, CachedValue>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryResponseCache {
    #[must_use]
    pub fn new(config: &MemoryCacheConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: Cache::new(config.capacity.max(1)),
            clock,
        }
    }

    /// Number of entries held, expired ones included until next read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }
}

impl Default for MemoryResponseCache {
    fn default() -> Self {
        Self::new(&MemoryCacheConfig::default(), Arc::new(SystemClock))
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(entry) = self.entries.get(key.as_str()) else {
            return Ok(None);
        };
        if entry.expires_at_ms <= self.clock.now() {
            self.entries.remove(key.as_str());
            return Ok(None);
        }
        Ok(Some(entry.bytes.as_ref().clone()))
    }

    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.entries.insert(
            key.as_str().to_string(),
            CachedValue {
                bytes: Arc::new(value),
                expires_at_ms: self.clock.now().saturating_add(ttl_ms),
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use colander_core::{Kwargs, ManualClock, Value};

    use super::*;

    fn key(arg: &str) -> CacheKey {
        CacheKey::for_call("ItemLookup", &[Value::from(arg)], &Kwargs::new()).unwrap()
    }

    fn cache() -> (Arc<ManualClock>, MemoryResponseCache) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = MemoryResponseCache::new(&MemoryCacheConfig::default(), clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn hit_within_ttl() {
        let (clock, cache) = cache();
        cache
            .put(&key("B01"), b"payload".to_vec(), Duration::from_secs(300))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            cache.get(&key("B01")).await.unwrap().as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let (clock, cache) = cache();
        cache
            .put(&key("B02"), vec![1, 2, 3], Duration::from_secs(5))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        assert!(cache.get(&key("B02")).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_stores_nothing() {
        let (_clock, cache) = cache();
        cache
            .put(&key("B03"), vec![9], Duration::ZERO)
            .await
            .unwrap();
        assert!(cache.get(&key("B03")).await.unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn absent_key_is_a_miss() {
        let (_clock, cache) = cache();
        assert!(cache.get(&key("nothing")).await.unwrap().is_none());
    }
}
