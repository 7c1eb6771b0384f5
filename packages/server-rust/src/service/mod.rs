//! Operation execution framework.
//!
//! 1. **Operations** (`operation`): task requests, per-attempt context, errors
//! 2. **Registry** (`registry`): operation name to handler and cache TTL
//! 3. **Executor** (`executor`): cache, quota reservation, retries, release
//! 4. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 5. **Background workers** (`worker`): periodic tasks (sweeping, scheduling)

pub mod config;
pub mod executor;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod worker;

pub use config::{LaneConfig, WorkerConfig};
pub use executor::TaskExecutor;
pub use operation::{OperationContext, OperationError, TaskRequest};
pub use registry::{OperationRegistry, OperationSpec};
pub use worker::{BackgroundRunnable, BackgroundWorker, SweepReport, SweepTask, Sweeper};
