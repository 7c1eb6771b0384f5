//! Priority tiers.
//!
//! A tier selects both the quota ceiling an operation runs under and the
//! delivery lane its envelope travels on. Tiers are ordinal: `High` work gets
//! at least as much headroom as `Medium`, which gets at least as much as `Low`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordinal urgency class of a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "u8", from = "i64")]
pub enum Priority {
    /// Baseline tier (0). Used when nothing else is known.
    #[default]
    Low,
    /// Tier 1.
    Medium,
    /// Tier 2.
    High,
}

impl Priority {
    /// All tiers, lowest first.
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];

    /// The tier assumed when no priority is given and none can be inherited.
    pub const BASELINE: Priority = Priority::Low;

    /// Numeric level of the tier (0, 1 or 2).
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    /// Parses an exact tier level.
    #[must_use]
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            _ => None,
        }
    }

    /// Converts an arbitrary integer into a tier, clamping out-of-range values.
    #[must_use]
    pub fn clamped(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Medium,
            _ => Priority::High,
        }
    }

    /// Index of this tier's delivery lane.
    #[must_use]
    pub fn lane(self) -> usize {
        usize::from(self.level())
    }

    /// Lowercase lane name, used in logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.level()
    }
}

impl From<i64> for Priority {
    fn from(level: i64) -> Self {
        Priority::clamped(level)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
