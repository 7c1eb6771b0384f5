//! HTTP handler definitions for the dashboard API.
//!
//! `AppState` is the shared state carried through axum extractors.

pub mod health;
pub mod tasks;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use tasks::{submit_task_handler, task_status_handler, SubmitTaskBody, TaskView};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::pipeline::Dispatcher;

/// Shared application state; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Submits tasks and answers status queries.
    pub dispatcher: Dispatcher,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Used for uptime reporting.
    pub start_time: Instant,
}
