//! Priority pipeline.
//!
//! Stages are delivered on one of three lanes (low, medium, high), each
//! served by its own worker pool. A stage submitted without an explicit
//! priority inherits the priority of the stage currently executing on this
//! task, tracked in the [`CURRENT_PRIORITY`] task-local, and falls back to
//! [`Priority::BASELINE`] outside any stage.

pub mod dispatcher;
pub mod handle;
pub mod stage;

use std::future::Future;

use colander_core::Priority;

pub use dispatcher::{Dispatcher, PipelineError};
pub use handle::{TaskHandle, TaskStatus, TaskTable, WaitError};
pub use stage::{Stage, Workflow};

tokio::task_local! {
    /// Priority of the stage currently executing on this task.
    pub static CURRENT_PRIORITY: Priority;
}

/// Priority of the enclosing stage, if any.
#[must_use]
pub fn current_priority() -> Option<Priority> {
    CURRENT_PRIORITY.try_with(|p| *p).ok()
}

/// Priority of the enclosing stage, or the baseline tier.
#[must_use]
pub fn current_or_baseline() -> Priority {
    current_priority().unwrap_or(Priority::BASELINE)
}

/// Runs `fut` as if inside a stage of `priority`.
pub async fn with_priority<F: Future>(priority: Priority, fut: F) -> F::Output {
    CURRENT_PRIORITY.scope(priority, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn baseline_outside_any_stage() {
        assert_eq!(current_priority(), None);
        assert_eq!(current_or_baseline(), Priority::Low);
    }

    #[tokio::test]
    async fn nested_scopes_shadow() {
        let seen = with_priority(Priority::High, async {
            let outer = current_or_baseline();
            let inner = with_priority(Priority::Medium, async { current_or_baseline() }).await;
            (outer, inner, current_or_baseline())
        })
        .await;
        assert_eq!(seen, (Priority::High, Priority::Medium, Priority::High));
    }
}
