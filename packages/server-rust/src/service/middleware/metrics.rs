//! Per-task span, timing and outcome.
//!
//! Every task runs inside a `task` span carrying its operation, call id and
//! lane. On completion the middleware records:
//!
//! - `colander.task.duration_seconds` (histogram, by operation and outcome)
//! - `colander.tasks.finished` (counter, by operation, lane and outcome)

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use colander_core::Value;
use tower::{Layer, Service};
use tracing::{info, info_span, Instrument, Span};

use crate::service::operation::{OperationError, TaskRequest};

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Label for how a task ended.
#[must_use]
pub fn outcome_label(result: &Result<Value, OperationError>) -> &'static str {
    match result {
        Ok(_) => "succeeded",
        Err(OperationError::Timeout { .. }) => "timed_out",
        Err(OperationError::UnknownOperation { .. } | OperationError::InvalidArgument(_)) => {
            "rejected"
        }
        Err(_) => "failed",
    }
}

impl<S> Service<TaskRequest> for MetricsService<S>
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
        let operation = request.operation.clone();
        let lane = request.priority.map_or("inherited", colander_core::Priority::as_str);
        let span = info_span!(
            "task",
            operation = %operation,
            call_id = request.call_id,
            lane,
            elapsed_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let task = self.inner.call(request);

        Box::pin(
            async move {
                let started = Instant::now();
                let result = task.await;
                let elapsed = started.elapsed();
                let outcome = outcome_label(&result);

                let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                Span::current().record("elapsed_ms", elapsed_ms);
                Span::current().record("outcome", outcome);

                metrics::histogram!(
                    "colander.task.duration_seconds",
                    "operation" => operation.clone(),
                    "outcome" => outcome,
                )
                .record(elapsed.as_secs_f64());
                metrics::counter!(
                    "colander.tasks.finished",
                    "operation" => operation,
                    "lane" => lane,
                    "outcome" => outcome,
                )
                .increment(1);
                info!(elapsed_ms, outcome, "task finished");

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use tower::service_fn;
    use tower::ServiceExt;

    use super::*;
    use crate::adapter::CallError;

    #[tokio::test]
    async fn result_passes_through_untouched() {
        let svc = MetricsLayer.layer(service_fn(|request: TaskRequest| async move {
            Ok::<_, OperationError>(Value::from(format!("{}#{}", request.operation, request.args.len())))
        }));
        let value = svc
            .oneshot(TaskRequest::new("ListMatchingProducts").arg("widget"))
            .await
            .unwrap();
        assert_eq!(value, Value::from("ListMatchingProducts#1"));
    }

    #[test]
    fn outcomes_are_labelled_by_cause() {
        assert_eq!(outcome_label(&Ok(Value::Null)), "succeeded");
        assert_eq!(
            outcome_label(&Err(OperationError::Timeout { timeout_ms: 10 })),
            "timed_out"
        );
        assert_eq!(
            outcome_label(&Err(OperationError::UnknownOperation {
                name: "Nope".into()
            })),
            "rejected"
        );
        assert_eq!(
            outcome_label(&Err(OperationError::Call {
                operation: "ItemLookup".into(),
                source: CallError::Timeout("upstream".into()),
            })),
            "failed"
        );
    }
}
