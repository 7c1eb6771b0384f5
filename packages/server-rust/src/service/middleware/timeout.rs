//! Soft time limit per task.
//!
//! A task's `timeout` covers its whole stay in the executor, quota wait
//! included. When the limit passes the caller gets `OperationError::Timeout`
//! and the executor's future is dropped. A task still waiting for quota is
//! then abandoned without calling out; one already calling out finishes in
//! the background and releases its reservation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use colander_core::Value;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{OperationError, TaskRequest};

#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

/// Fails tasks that outlive `TaskRequest::timeout`.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

fn limit_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

impl<S> Service<TaskRequest> for TimeoutService<S>
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
        let limit = request.timeout;
        let operation = request.operation.clone();
        let call_id = request.call_id;
        let lane = request.priority.map_or("inherited", colander_core::Priority::as_str);
        let task = self.inner.call(request);

        Box::pin(async move {
            let Ok(result) = tokio::time::timeout(limit, task).await else {
                metrics::counter!(
                    "colander.tasks.timed_out",
                    "operation" => operation.clone(),
                    "lane" => lane,
                )
                .increment(1);
                warn!(
                    operation = %operation,
                    call_id,
                    lane,
                    limit_ms = limit_ms(limit),
                    "task hit its soft time limit"
                );
                return Err(OperationError::Timeout {
                    timeout_ms: limit_ms(limit),
                });
            };
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    /// Answers with the operation name after `delay`.
    #[derive(Clone)]
    struct Delayed(Duration);

    impl Service<TaskRequest> for Delayed {
        type Response = Value;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: TaskRequest) -> Self::Future {
            let delay = self.0;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(Value::from(request.operation))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn task_inside_its_limit_returns_its_value() {
        let svc = TimeoutLayer.layer(Delayed(Duration::from_secs(4)));
        let value = svc
            .oneshot(TaskRequest::new("GetLowestOfferListingsForSKU").timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(value, Value::from("GetLowestOfferListingsForSKU"));
    }

    #[tokio::test(start_paused = true)]
    async fn task_past_its_limit_reports_the_limit() {
        let svc = TimeoutLayer.layer(Delayed(Duration::from_secs(300)));
        let err = svc
            .oneshot(TaskRequest::new("GetServiceStatus").timeout(Duration::from_millis(1500)))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Timeout { timeout_ms: 1500 }));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_result_is_kept_under_a_zero_limit() {
        let svc = TimeoutLayer.layer(Delayed(Duration::ZERO));
        let value = svc
            .oneshot(TaskRequest::new("ItemLookup").timeout(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(value, Value::from("ItemLookup"));
    }
}
