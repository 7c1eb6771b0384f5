//! Tower middleware layers for the task pipeline.
//!
//! - [`load_shed`]: worker-wide cap on tasks in progress
//! - [`metrics`]: per-task span, duration and outcome
//! - [`timeout`]: soft time limit, quota wait included
//! - [`pipeline`]: the assembled stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_operation_pipeline, TaskService};
pub use timeout::TimeoutLayer;
