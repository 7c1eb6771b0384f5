//! Quota store backends.
//!
//! - [`memory`]: `DashMap`-backed store for a single worker process and tests
//! - [`redis`]: Lua-scripted store shared by every worker process (feature `redis`)

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

pub use memory::MemoryQuotaStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisQuotaStore;

/// Idle time after which a usage record is dropped and starts fresh.
pub const DEFAULT_USAGE_IDLE_EXPIRY: Duration = Duration::from_secs(200);
