//! Redis-backed response cache.
//!
//! Entries are plain string keys written with `SET EX`, so Redis drops them
//! on its own once the TTL passes. Calls share one connection manager.

use std::time::Duration;

use async_trait::async_trait;
use colander_core::{CacheKey, ResponseCache, StoreError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

use crate::quota::redis::{map_redis_error, shared_connection};

const KEY_PREFIX: &str = "colander:cache:";

/// [`ResponseCache`] over a shared Redis instance.
pub struct RedisResponseCache {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    key_prefix: String,
    connection_timeout: Duration,
}

impl RedisResponseCache {
    /// Opens a client for `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid.
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            key_prefix: KEY_PREFIX.to_string(),
            connection_timeout: Duration::from_secs(10),
        })
    }

    fn key(&self, key: &CacheKey) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        shared_connection(&self.client, &self.manager, self.connection_timeout).await
    }
}

#[async_trait]
impl ResponseCache for RedisResponseCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(self.key(key)).await.map_err(map_redis_error)
    }

    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        // SET EX rejects a zero expiry; sub-second TTLs round up to one second.
        if ttl.is_zero() {
            return Ok(());
        }
        let secs = ttl.as_secs().max(1);
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(self.key(key), value, secs)
            .await
            .map_err(map_redis_error)
    }
}

#[cfg(test)]
mod tests {
    use colander_core::{Kwargs, Value};

    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let cache = RedisResponseCache::new("redis://127.0.0.1:6379").unwrap();
        let key = CacheKey::for_call("GetReport", &[Value::from("r-1")], &Kwargs::new()).unwrap();
        let full = cache.key(&key);
        assert!(full.starts_with("colander:cache:GetReport:"));
    }
}
