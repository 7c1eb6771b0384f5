//! Storage seams injected into the executor at process start.
//!
//! Both traits are implemented in memory (single process, tests) and on
//! Redis (shared across worker processes). Every mutation of shared state
//! goes through these methods; callers never read-modify-write records
//! themselves.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::hash::CacheKey;
use crate::usage::{ReserveSnapshot, UsageRecord};

/// Atomic token-bucket state, one record per operation type.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Decays the record, adds one pending reservation and refreshes its idle
    /// expiry, all as one atomic unit. Returns the pre-increment snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot complete the update.
    async fn reserve(
        &self,
        operation: &str,
        restore_rate: f64,
    ) -> Result<ReserveSnapshot, StoreError>;

    /// Decays the record, charges one unit of quota, drops one pending
    /// reservation and stamps `last_request`, all as one atomic unit.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot complete the update.
    async fn release(
        &self,
        operation: &str,
        restore_rate: f64,
        success: bool,
    ) -> Result<(), StoreError>;

    /// Reads the current record without modifying it.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot be read.
    async fn usage(&self, operation: &str) -> Result<Option<UsageRecord>, StoreError>;
}

/// TTL-keyed memoization of encoded call results.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Returns the stored bytes, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend cannot be read.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key` for `ttl`. A zero `ttl` stores nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend rejects the write.
    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
}
