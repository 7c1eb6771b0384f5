//! Static per-operation, per-tier quota limits.
//!
//! Each operation type carries one [`Limits`] per priority tier. Lookups fall
//! back to the operation's tier-0 entry when the requested tier is missing,
//! and to [`Limits::DEFAULT`] when the operation is unknown.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::priority::Priority;

/// Token-bucket parameters for one operation at one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Number of requests that may be in flight or recently consumed.
    pub quota_max: f64,
    /// Seconds of idle time that restore one unit of quota.
    pub restore_rate: f64,
}

impl Limits {
    /// Limits applied to operations that were never configured: one request at
    /// a time, restored immediately.
    pub const DEFAULT: Limits = Limits {
        quota_max: 1.0,
        restore_rate: 0.0,
    };

    #[must_use]
    pub const fn new(quota_max: f64, restore_rate: f64) -> Self {
        Self {
            quota_max,
            restore_rate,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Reasons a limits table is rejected.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LimitsError {
    #[error("{operation} tier {tier}: quota_max must be positive, got {value}")]
    NonPositiveQuota {
        operation: String,
        tier: Priority,
        value: f64,
    },

    #[error("{operation} tier {tier}: restore_rate must not be negative, got {value}")]
    NegativeRestoreRate {
        operation: String,
        tier: Priority,
        value: f64,
    },

    #[error("{operation}: tier {higher} quota_max {higher_max} is below tier {lower} quota_max {lower_max}")]
    TierOrdering {
        operation: String,
        lower: Priority,
        lower_max: f64,
        higher: Priority,
        higher_max: f64,
    },

    #[error("{operation}: unknown priority tier {tier}")]
    InvalidTier { operation: String, tier: u8 },

    #[error("invalid limits document: {0}")]
    Parse(String),
}

/// Limits for every configured operation type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitsTable {
    operations: HashMap<String, BTreeMap<Priority, Limits>>,
}

impl LimitsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the limits of `operation` at `tier`, replacing any previous entry.
    pub fn insert(&mut self, operation: impl Into<String>, tier: Priority, limits: Limits) {
        self.operations
            .entry(operation.into())
            .or_default()
            .insert(tier, limits);
    }

    /// Builder form of [`insert`](Self::insert) taking one entry per tier,
    /// lowest tier first.
    #[must_use]
    pub fn with_operation(mut self, operation: &str, tiers: &[Limits]) -> Self {
        for (limits, tier) in tiers.iter().zip(Priority::ALL) {
            self.insert(operation, tier, *limits);
        }
        self
    }

    /// Resolves the limits for `operation` at `tier`.
    #[must_use]
    pub fn resolve(&self, operation: &str, tier: Priority) -> Limits {
        let Some(tiers) = self.operations.get(operation) else {
            return Limits::DEFAULT;
        };
        tiers
            .get(&tier)
            .or_else(|| tiers.get(&Priority::BASELINE))
            .copied()
            .unwrap_or(Limits::DEFAULT)
    }

    /// Returns `true` if `operation` has any configured tier.
    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    /// Names of all configured operations.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Checks per-entry bounds and that higher tiers never get less headroom
    /// than lower ones.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), LimitsError> {
        for (operation, tiers) in &self.operations {
            for (tier, limits) in tiers {
                if limits.quota_max.is_nan() || limits.quota_max <= 0.0 {
                    return Err(LimitsError::NonPositiveQuota {
                        operation: operation.clone(),
                        tier: *tier,
                        value: limits.quota_max,
                    });
                }
                if limits.restore_rate.is_nan() || limits.restore_rate < 0.0 {
                    return Err(LimitsError::NegativeRestoreRate {
                        operation: operation.clone(),
                        tier: *tier,
                        value: limits.restore_rate,
                    });
                }
            }
            // BTreeMap iterates tiers lowest first.
            let ordered: Vec<_> = tiers.iter().collect();
            for pair in ordered.windows(2) {
                let (lower, lower_limits) = pair[0];
                let (higher, higher_limits) = pair[1];
                if higher_limits.quota_max < lower_limits.quota_max {
                    return Err(LimitsError::TierOrdering {
                        operation: operation.clone(),
                        lower: *lower,
                        lower_max: lower_limits.quota_max,
                        higher: *higher,
                        higher_max: higher_limits.quota_max,
                    });
                }
            }
        }
        Ok(())
    }

    /// Parses a JSON document of the form
    /// `{"ItemLookup": {"0": {"quota_max": 10, "restore_rate": 1}}}`.
    ///
    /// # Errors
    ///
    /// Returns [`LimitsError::Parse`] for malformed JSON,
    /// [`LimitsError::InvalidTier`] for tiers outside 0..=2, and any
    /// validation error.
    pub fn from_json(text: &str) -> Result<Self, LimitsError> {
        let raw: HashMap<String, BTreeMap<u8, Limits>> =
            serde_json::from_str(text).map_err(|e| LimitsError::Parse(e.to_string()))?;
        let mut table = Self::new();
        for (operation, tiers) in raw {
            for (level, limits) in tiers {
                let tier = Priority::from_level(level).ok_or_else(|| LimitsError::InvalidTier {
                    operation: operation.clone(),
                    tier: level,
                })?;
                table.insert(operation.clone(), tier, limits);
            }
        }
        table.validate()?;
        Ok(table)
    }

    /// Overlays `other` onto this table. Entries in `other` win per
    /// operation and tier.
    pub fn merge(&mut self, other: LimitsTable) {
        for (operation, tiers) in other.operations {
            for (tier, limits) in tiers {
                self.insert(operation.clone(), tier, limits);
            }
        }
    }
}
