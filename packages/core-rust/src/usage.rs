//! Token-bucket usage accounting for a single operation type.
//!
//! [`UsageRecord`] holds the pure state transitions. Quota stores wrap them in
//! whatever atomicity their backend offers (an entry lock in memory, a Lua
//! script in Redis) so that the arithmetic is identical everywhere.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::Limits;

/// Shared consumption state of one operation type.
///
/// Times are fractional seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Consumed quota, decayed continuously toward zero.
    pub quota_level: f64,
    /// Reservations handed out and not yet released.
    pub pending: i64,
    /// Time of the last completed call.
    pub last_request: f64,
    /// Time decay was last applied. Zero for a record never touched.
    pub decayed_at: f64,
}

/// State observed by a reservation, before its own pending slot was added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReserveSnapshot {
    pub quota_level: f64,
    pub pending: i64,
    pub last_request: f64,
    /// Quota restored by the decay applied during this reservation.
    pub restored: f64,
}

impl ReserveSnapshot {
    /// Time to wait before the reserved call may proceed.
    ///
    /// `max(quota_level + pending + 1 - quota_max, 0) * restore_rate`. The
    /// pending term counts in-flight reservations against the ceiling so that
    /// simultaneous starters cannot all pass before any has been charged.
    #[must_use]
    pub fn wait(&self, limits: &Limits) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let pending = self.pending as f64;
        let over = (self.quota_level + pending + 1.0 - limits.quota_max).max(0.0);
        let secs = over * limits.restore_rate;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

impl UsageRecord {
    /// Applies the decay accumulated since the last update and returns the
    /// amount restored.
    ///
    /// A `restore_rate` of zero restores everything immediately. Decay is
    /// measured from `decayed_at`, never from `last_request`, so applying it
    /// twice for the same interval has no effect.
    pub fn decay(&mut self, now: f64, restore_rate: f64) -> f64 {
        let restored = if self.decayed_at <= 0.0 {
            0.0
        } else if restore_rate <= 0.0 {
            self.quota_level
        } else {
            let elapsed = (now - self.decayed_at).max(0.0);
            (elapsed / restore_rate).min(self.quota_level)
        };
        self.quota_level = (self.quota_level - restored).max(0.0);
        self.decayed_at = self.decayed_at.max(now);
        restored
    }

    /// Decays, takes a snapshot and adds one pending reservation.
    pub fn reserve(&mut self, now: f64, restore_rate: f64) -> ReserveSnapshot {
        let restored = self.decay(now, restore_rate);
        let snapshot = ReserveSnapshot {
            quota_level: self.quota_level,
            pending: self.pending,
            last_request: self.last_request,
            restored,
        };
        self.pending += 1;
        snapshot
    }

    /// Decays, charges one unit of quota for the completed call and frees
    /// its pending slot.
    ///
    /// Charged regardless of `success`: a failed call still consumed
    /// upstream capacity.
    pub fn release(&mut self, now: f64, restore_rate: f64, _success: bool) {
        self.decay(now, restore_rate);
        self.quota_level += 1.0;
        self.pending = (self.pending - 1).max(0);
        self.last_request = now;
    }

    /// Returns `true` once the record has been idle longer than `idle_expiry`.
    #[must_use]
    pub fn is_idle(&self, now: f64, idle_expiry: Duration) -> bool {
        self.decayed_at > 0.0 && now - self.decayed_at > idle_expiry.as_secs_f64()
    }
}
