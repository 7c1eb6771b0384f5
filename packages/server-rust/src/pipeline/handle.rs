//! Task handles and the table of submitted tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use colander_core::Value;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

/// Observable state of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Succeeded { result: Value },
    Failed { error: String },
}

impl TaskStatus {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }
}

/// Why waiting on a handle produced no result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaitError {
    #[error("task still pending after {0:?}")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Failed(String),

    /// The task was dropped before finishing (worker shut down).
    #[error("task dropped before completion")]
    Dropped,
}

/// Handle to a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    rx: watch::Receiver<TaskStatus>,
}

impl TaskHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.rx.borrow().clone()
    }

    /// Waits up to `timeout` for the task to finish.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the task is still pending, [`WaitError::Failed`]
    /// with the task's error message, or [`WaitError::Dropped`] if the task
    /// can no longer finish.
    pub async fn wait(&self, timeout: Duration) -> Result<Value, WaitError> {
        let mut rx = self.rx.clone();
        let finished = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| !s.is_pending())
                .await
                .map(|status| status.clone())
        })
        .await;

        match finished {
            Err(_elapsed) => Err(WaitError::Timeout(timeout)),
            Ok(Err(_closed)) => Err(WaitError::Dropped),
            Ok(Ok(TaskStatus::Succeeded { result })) => Ok(result),
            Ok(Ok(TaskStatus::Failed { error })) => Err(WaitError::Failed(error)),
            Ok(Ok(TaskStatus::Pending)) => Err(WaitError::Dropped),
        }
    }
}

struct TaskEntry {
    status: watch::Sender<TaskStatus>,
    created: Instant,
}

/// Submitted tasks by id, shared by the dispatcher, the dashboard and the
/// sweeper.
#[derive(Clone, Default)]
pub struct TaskTable {
    entries: Arc<DashMap<Uuid, TaskEntry>>,
}

impl TaskTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending task.
    #[must_use]
    pub fn register(&self) -> TaskHandle {
        self.register_with(TaskStatus::Pending)
    }

    /// Registers a task that is already finished.
    #[must_use]
    pub fn register_with(&self, status: TaskStatus) -> TaskHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = watch::channel(status);
        self.entries.insert(
            id,
            TaskEntry {
                status: tx,
                created: Instant::now(),
            },
        );
        TaskHandle { id, rx }
    }

    /// Records the outcome of task `id`. Unknown ids are ignored.
    pub fn finish(&self, id: Uuid, status: TaskStatus) {
        if let Some(entry) = self.entries.get(&id) {
            entry.status.send_replace(status);
        }
    }

    #[must_use]
    pub fn handle(&self, id: Uuid) -> Option<TaskHandle> {
        self.entries.get(&id).map(|entry| TaskHandle {
            id,
            rx: entry.status.subscribe(),
        })
    }

    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.entries.get(&id).map(|entry| entry.status.borrow().clone())
    }

    /// Drops finished tasks older than `retention`. Returns the number removed.
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.status.borrow().is_pending() || entry.created.elapsed() <= retention
        });
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_result_once_finished() {
        let table = TaskTable::new();
        let handle = table.register();
        assert_eq!(handle.status(), TaskStatus::Pending);

        let id = handle.id();
        let finisher = {
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                table.finish(
                    id,
                    TaskStatus::Succeeded {
                        result: Value::from("done"),
                    },
                );
            })
        };

        let value = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(value, Value::from("done"));
        finisher.await.unwrap();
        assert_eq!(
            table.status(id),
            Some(TaskStatus::Succeeded {
                result: Value::from("done")
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_while_pending() {
        let table = TaskTable::new();
        let handle = table.register();
        let err = handle.wait(Duration::from_secs(3)).await.unwrap_err();
        assert_eq!(err, WaitError::Timeout(Duration::from_secs(3)));
        assert!(handle.status().is_pending());
    }

    #[tokio::test]
    async fn failure_is_reported() {
        let table = TaskTable::new();
        let handle = table.register_with(TaskStatus::Failed {
            error: "dispatcher shut down".into(),
        });
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, WaitError::Failed("dispatcher shut down".into()));
    }

    #[tokio::test]
    async fn purged_pending_task_reports_dropped() {
        let table = TaskTable::new();
        let handle = table.register();
        table.entries.clear();
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, WaitError::Dropped);
    }

    #[test]
    fn purge_keeps_pending_and_recent() {
        let table = TaskTable::new();
        let pending = table.register();
        let done = table.register_with(TaskStatus::Succeeded {
            result: Value::Null,
        });

        assert_eq!(table.purge_finished(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(table.purge_finished(Duration::ZERO), 1);
        assert!(table.handle(pending.id()).is_some());
        assert!(table.handle(done.id()).is_none());
    }

    #[test]
    fn status_serializes_tagged() {
        let json = serde_json::to_value(TaskStatus::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "error": "boom"}));
        let json = serde_json::to_value(TaskStatus::Pending).unwrap();
        assert_eq!(json, serde_json::json!({"status": "pending"}));
    }
}
