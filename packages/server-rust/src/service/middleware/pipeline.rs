//! The middleware stack every task runs through.

use colander_core::Value;
use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::WorkerConfig;
use crate::service::executor::TaskExecutor;
use crate::service::operation::{OperationError, TaskRequest};

/// The executor wrapped in its middleware, as handed to lane workers.
pub type TaskService = BoxCloneSyncService<TaskRequest, Value, OperationError>;

/// Wraps `executor` in the task middleware.
///
/// Outermost first: the load-shed permit, then the task span and metrics,
/// then the soft time limit, so a timed-out task is still recorded with its
/// outcome.
#[must_use]
pub fn build_operation_pipeline(executor: TaskExecutor, config: &WorkerConfig) -> TaskService {
    let service = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_tasks))
        .layer(MetricsLayer)
        .layer(TimeoutLayer)
        .service(executor);
    BoxCloneSyncService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
