//! Distributed token-bucket admission control.
//!
//! The limiter resolves the limits for an operation at a priority tier,
//! reserves a slot in the shared [`QuotaStore`] and tells the caller how long
//! to wait before making the call. Every reservation must be handed back via
//! [`RateLimiter::release`] once the call is over, whatever its outcome.

use std::sync::Arc;
use std::time::Duration;

use colander_core::{Limits, LimitsTable, Priority, QuotaStore, ReserveSnapshot, StoreError};
use tracing::{debug, error};

/// A reserved slot, held for the lifetime of one logical call.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub operation: String,
    pub priority: Priority,
    pub limits: Limits,
    pub snapshot: ReserveSnapshot,
    /// Time to sleep before the call may proceed.
    pub wait: Duration,
}

/// Admission control shared by every executor in the process.
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    limits: Arc<LimitsTable>,
    wait_adjust: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn QuotaStore>, limits: Arc<LimitsTable>) -> Self {
        Self {
            store,
            limits,
            wait_adjust: Duration::ZERO,
        }
    }

    /// Adds `adjust` to every non-zero wait.
    #[must_use]
    pub fn with_wait_adjust(mut self, adjust: Duration) -> Self {
        self.wait_adjust = adjust;
        self
    }

    /// Limits that apply to `operation` at `priority`.
    #[must_use]
    pub fn limits_for(&self, operation: &str, priority: Priority) -> Limits {
        self.limits.resolve(operation, priority)
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    /// Reserves a slot for `operation` and computes the wait before it may run.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the reservation could not be recorded. No
    /// slot is held in that case.
    pub async fn wait_for(
        &self,
        operation: &str,
        priority: Priority,
    ) -> Result<Reservation, StoreError> {
        let limits = self.limits_for(operation, priority);
        let snapshot = self.store.reserve(operation, limits.restore_rate).await?;
        let mut wait = snapshot.wait(&limits);
        if !wait.is_zero() {
            wait += self.wait_adjust;
        }

        metrics::histogram!("colander.quota.wait_seconds", "operation" => operation.to_string())
            .record(wait.as_secs_f64());
        debug!(
            operation,
            priority = %priority,
            quota_max = limits.quota_max,
            quota_level = snapshot.quota_level,
            pending = snapshot.pending,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "reservation granted"
        );

        Ok(Reservation {
            operation: operation.to_string(),
            priority,
            limits,
            snapshot,
            wait,
        })
    }

    /// Returns a reservation's slot and charges its quota.
    ///
    /// A failed release is logged and returned. The slot then stays counted
    /// as pending until the usage record expires, which errs toward admitting
    /// less rather than more.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the release could not be recorded.
    pub async fn release(
        &self,
        reservation: &Reservation,
        success: bool,
    ) -> Result<(), StoreError> {
        let result = self
            .store
            .release(
                &reservation.operation,
                reservation.limits.restore_rate,
                success,
            )
            .await;
        if let Err(e) = &result {
            error!(
                operation = %reservation.operation,
                error = %e,
                "quota release failed; slot remains pending until record expiry"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
