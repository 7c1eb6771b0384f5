//! In-process quota store.
//!
//! Each reserve/release runs under the `DashMap` entry lock for its operation,
//! which makes the decay-and-update sequence atomic with respect to every
//! other task in the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colander_core::{ClockSource, QuotaStore, ReserveSnapshot, StoreError, SystemClock, UsageRecord};
use dashmap::DashMap;
use tracing::debug;

use super::DEFAULT_USAGE_IDLE_EXPIRY;

/// `DashMap`-backed [`QuotaStore`].
pub struct MemoryQuotaStore {
    records: DashMap<String, UsageRecord>,
    clock: Arc<dyn ClockSource>,
    idle_expiry: Duration,
}

impl MemoryQuotaStore {
    /// Creates a store reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, idle_expiry: Duration) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            idle_expiry,
        }
    }

    /// Drops records idle for longer than the configured expiry. Returns the
    /// number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.records.len();
        self.records
            .retain(|_, record| !record.is_idle(now, self.idle_expiry));
        before - self.records.len()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), DEFAULT_USAGE_IDLE_EXPIRY)
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn reserve(
        &self,
        operation: &str,
        restore_rate: f64,
    ) -> Result<ReserveSnapshot, StoreError> {
        let now = self.clock.now_secs();
        let mut record = self.records.entry(operation.to_string()).or_default();
        if record.is_idle(now, self.idle_expiry) {
            *record = UsageRecord::default();
        }
        let snapshot = record.reserve(now, restore_rate);
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
        let now = self.clock.now_secs();
        let mut record = self.records.entry(operation.to_string()).or_default();
        if record.is_idle(now, self.idle_expiry) {
            *record = UsageRecord::default();
        }
        record.release(now, restore_rate, success);
        debug!(
            operation,
            quota_level = record.quota_level,
            pending = record.pending,
            success,
            "quota released"
        );
        Ok(())
    }

    async fn usage(&self, operation: &str) -> Result<Option<UsageRecord>, StoreError> {
        let now = self.clock.now_secs();
        Ok(self
            .records
            .get(operation)
            .map(|r| *r)
            .filter(|r| !r.is_idle(now, self.idle_expiry)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
