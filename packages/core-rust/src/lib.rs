//! Colander Core: values, priority tiers, quota limits, cache keys, and the
//! storage traits shared by every worker.

pub mod clock;
pub mod error;
pub mod hash;
pub mod limits;
pub mod priority;
pub mod reports;
pub mod traits;
pub mod types;
pub mod usage;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use error::StoreError;
pub use hash::CacheKey;
pub use limits::{Limits, LimitsError, LimitsTable};
pub use priority::Priority;
pub use reports::{ReportError, ReportKind};
pub use traits::{QuotaStore, ResponseCache};
pub use types::{Kwargs, Value};
pub use usage::{ReserveSnapshot, UsageRecord};
