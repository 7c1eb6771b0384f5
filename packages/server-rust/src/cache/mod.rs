//! Response cache backends.
//!
//! - [`memory`]: bounded in-process cache with per-entry expiry
//! - [`redis`]: `SET EX` entries shared by every worker process (feature `redis`)

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryCacheConfig, MemoryResponseCache};
#[cfg(feature = "redis")]
pub use self::redis::RedisResponseCache;
