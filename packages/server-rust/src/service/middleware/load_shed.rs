//! Worker-wide cap on tasks in progress.
//!
//! Each task holds one permit from a shared semaphore until the executor
//! returns. A task arriving with no permit left is refused with
//! `OperationError::Overloaded` instead of waiting, so a saturated worker
//! pushes back on its lanes rather than piling up quota reservations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use colander_core::Value;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{OperationError, TaskRequest};

#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl LoadShedLayer {
    /// Allows at most `max_concurrent_tasks` tasks in progress at once.
    #[must_use]
    pub fn new(max_concurrent_tasks: u32) -> Self {
        let capacity = max_concurrent_tasks as usize;
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Tasks currently holding a permit.
    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> Service<TaskRequest> for LoadShedService<S>
where
    S: Service<TaskRequest, Response = Value, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: TaskRequest) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            let lane = request.priority.map_or("inherited", colander_core::Priority::as_str);
            metrics::counter!(
                "colander.tasks.shed",
                "operation" => request.operation.clone(),
                "lane" => lane,
            )
            .increment(1);
            warn!(
                operation = %request.operation,
                call_id = request.call_id,
                lane,
                "no task permits left, refusing task"
            );
            return Box::pin(async { Err(OperationError::Overloaded) });
        };

        let task = self.inner.call(request);
        Box::pin(async move {
            let _permit = permit;
            task.await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use colander_core::Priority;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use super::*;

    /// Holds `GetReport` tasks until `release` is notified.
    #[derive(Clone)]
    struct Gate {
        release: Arc<Notify>,
    }

    impl Service<TaskRequest> for Gate {
        type Response = Value;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: TaskRequest) -> Self::Future {
            let release = Arc::clone(&self.release);
            Box::pin(async move {
                if request.operation == "GetReport" {
                    release.notified().await;
                }
                Ok(Value::from(request.operation))
            })
        }
    }

    fn gate() -> (Gate, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        (
            Gate {
                release: Arc::clone(&release),
            },
            release,
        )
    }

    #[tokio::test]
    async fn permits_return_when_tasks_finish() {
        let layer = LoadShedLayer::new(2);
        let (inner, release) = gate();
        let svc = layer.layer(inner);

        let running = tokio::spawn(svc.clone().oneshot(TaskRequest::new("GetReport")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(layer.in_progress(), 1);

        release.notify_waiters();
        assert_eq!(running.await.unwrap().unwrap(), Value::from("GetReport"));
        assert_eq!(layer.in_progress(), 0);
    }

    #[tokio::test]
    async fn full_worker_refuses_new_tasks() {
        let layer = LoadShedLayer::new(1);
        let (inner, release) = gate();
        let svc = layer.layer(inner);

        let running = tokio::spawn(svc.clone().oneshot(TaskRequest::new("GetReport")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc
            .clone()
            .oneshot(TaskRequest::new("ItemLookup").priority(Priority::High))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));

        release.notify_waiters();
        running.await.unwrap().unwrap();
        let value = svc.oneshot(TaskRequest::new("ItemLookup")).await.unwrap();
        assert_eq!(value, Value::from("ItemLookup"));
    }
}
