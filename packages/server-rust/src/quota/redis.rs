//! Redis-backed quota store shared by every worker process.
//!
//! Usage records live in one hash per operation type. Reserve and release each
//! run as a single Lua script, so concurrent workers never interleave inside
//! the decay-and-update sequence. Every script call refreshes the key's TTL;
//! a record left idle expires and starts fresh.
//!
//! One [`ConnectionManager`] is opened on first use and shared by every call;
//! it reconnects on its own after a dropped connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colander_core::{ClockSource, QuotaStore, ReserveSnapshot, StoreError, SystemClock, UsageRecord};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::DEFAULT_USAGE_IDLE_EXPIRY;

const KEY_PREFIX: &str = "colander:usage:";

const RESERVE_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
local rec = redis.call('HMGET', key, 'quota_level', 'pending', 'last_request', 'decayed_at')
local level = tonumber(rec[1]) or 0
local pending = tonumber(rec[2]) or 0
local last = tonumber(rec[3]) or 0
local decayed_at = tonumber(rec[4]) or 0
local restored = 0
if decayed_at > 0 then
  if rate <= 0 then
    restored = level
  else
    restored = math.min(math.max(now - decayed_at, 0) / rate, level)
  end
end
level = math.max(level - restored, 0)
if now > decayed_at then decayed_at = now end
redis.call('HSET', key, 'quota_level', tostring(level), 'pending', tostring(pending + 1),
  'last_request', tostring(last), 'decayed_at', tostring(decayed_at))
redis.call('EXPIRE', key, expiry)
return {tostring(level), tostring(pending), tostring(last), tostring(restored)}
";

const RELEASE_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
local rec = redis.call('HMGET', key, 'quota_level', 'pending', 'decayed_at')
local level = tonumber(rec[1]) or 0
local pending = tonumber(rec[2]) or 0
local decayed_at = tonumber(rec[3]) or 0
if decayed_at > 0 then
  if rate <= 0 then
    level = 0
  else
    level = math.max(level - math.min(math.max(now - decayed_at, 0) / rate, level), 0)
  end
end
if now > decayed_at then decayed_at = now end
level = level + 1
pending = math.max(pending - 1, 0)
redis.call('HSET', key, 'quota_level', tostring(level), 'pending', tostring(pending),
  'last_request', tostring(now), 'decayed_at', tostring(decayed_at))
redis.call('EXPIRE', key, expiry)
return 1
";

/// Connection settings for [`RedisQuotaStore`].
#[derive(Debug, Clone)]
pub struct RedisQuotaConfig {
    pub key_prefix: String,
    pub idle_expiry: Duration,
    pub connection_timeout: Duration,
}

impl Default for RedisQuotaConfig {
    fn default() -> Self {
        Self {
            key_prefix: KEY_PREFIX.to_string(),
            idle_expiry: DEFAULT_USAGE_IDLE_EXPIRY,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// Lua-scripted [`QuotaStore`] over a shared Redis instance.
pub struct RedisQuotaStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    config: RedisQuotaConfig,
    clock: Arc<dyn ClockSource>,
    reserve: redis::Script,
    release: redis::Script,
}

impl RedisQuotaStore {
    /// Opens a client for `redis_url`. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid.
    pub fn new(redis_url: &str, config: RedisQuotaConfig) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            config,
            clock: Arc::new(SystemClock),
            reserve: redis::Script::new(RESERVE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    fn key(&self, operation: &str) -> String {
        format!("{}{operation}", self.config.key_prefix)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        shared_connection(&self.client, &self.manager, self.config.connection_timeout).await
    }
}

/// Returns a clone of the shared manager, connecting it on first use.
pub(crate) async fn shared_connection(
    client: &redis::Client,
    manager: &OnceCell<ConnectionManager>,
    timeout: Duration,
) -> Result<ConnectionManager, StoreError> {
    manager
        .get_or_try_init(|| async {
            let manager = tokio::time::timeout(timeout, client.get_connection_manager())
                .await
                .map_err(|_| StoreError::Unavailable("redis connection timeout".to_string()))?
                .map_err(map_redis_error)?;
            info!("redis connection established");
            Ok::<_, StoreError>(manager)
        })
        .await
        .cloned()
}

pub(crate) fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn parse_field(key: &str, name: &str, raw: Option<&String>) -> Result<f64, StoreError> {
    let raw = raw.ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("missing {name}"),
    })?;
    raw.parse().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("{name} is not a number: {raw}"),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn to_pending(value: f64) -> i64 {
    value.round() as i64
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn reserve(
        &self,
        operation: &str,
        restore_rate: f64,
    ) -> Result<ReserveSnapshot, StoreError> {
        let key = self.key(operation);
        let mut conn = self.connection().await?;
        let fields: Vec<String> = self
            .reserve
            .key(&key)
            .arg(self.clock.now_secs())
            .arg(restore_rate)
            .arg(self.config.idle_expiry.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let snapshot = ReserveSnapshot {
            quota_level: parse_field(&key, "quota_level", fields.first())?,
            pending: to_pending(parse_field(&key, "pending", fields.get(1))?),
            last_request: parse_field(&key, "last_request", fields.get(2))?,
            restored: parse_field(&key, "restored", fields.get(3))?,
        };
        debug!(
            operation,
            quota_level = snapshot.quota_level,
            pending = snapshot.pending,
            restored = snapshot.restored,
            "quota reserved"
        );
        Ok(snapshot)
    }

    async fn release(
        &self,
        operation: &str,
        restore_rate: f64,
        success: bool,
    ) -> Result<(), StoreError> {
        let key = self.key(operation);
        let mut conn = self.connection().await?;
        let _: i64 = self
            .release
            .key(&key)
            .arg(self.clock.now_secs())
            .arg(restore_rate)
            .arg(self.config.idle_expiry.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        debug!(operation, success, "quota released");
        Ok(())
    }

    async fn usage(&self, operation: &str) -> Result<Option<UsageRecord>, StoreError> {
        let key = self.key(operation);
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            conn.hgetall(&key).await.map_err(map_redis_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(UsageRecord {
            quota_level: parse_field(&key, "quota_level", fields.get("quota_level"))?,
            pending: to_pending(parse_field(&key, "pending", fields.get("pending"))?),
            last_request: parse_field(&key, "last_request", fields.get("last_request"))?,
            decayed_at: parse_field(&key, "decayed_at", fields.get("decayed_at"))?,
        }))
    }
}
