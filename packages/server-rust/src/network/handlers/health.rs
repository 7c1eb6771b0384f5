//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Detailed health as JSON. Always 200; the `state` field carries the
/// actual health so monitors can tell "up but draining" from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let dispatcher = if state.dispatcher.is_shutdown() {
        "closed"
    } else {
        "open"
    };
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "dispatcher": dispatcher,
        "tracked_tasks": state.dispatcher.tasks().len(),
        "open_submissions": state.shutdown.open_submissions(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only when ready and the dispatcher still accepts
/// work, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready && !state.dispatcher.is_shutdown() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use colander_core::Value;
    use tower::service_fn;
    use tower::util::BoxCloneSyncService;

    use super::*;
    use crate::network::{NetworkConfig, ShutdownController};
    use crate::pipeline::Dispatcher;
    use crate::service::config::WorkerConfig;
    use crate::service::operation::{OperationError, TaskRequest};

    fn test_state() -> AppState {
        let service = BoxCloneSyncService::new(service_fn(|_: TaskRequest| async {
            Ok::<_, OperationError>(Value::Null)
        }));
        AppState {
            dispatcher: Dispatcher::start(service, &WorkerConfig::default()),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_reports_all_fields() {
        let state = test_state();
        state.shutdown.set_ready();
        let _guard = state.shutdown.track_submission();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "ready");
        assert_eq!(json["dispatcher"], "open");
        assert_eq!(json["tracked_tasks"], 0);
        assert_eq!(json["open_submissions"], 1);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_draining() {
        let state = test_state();
        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();
        state.dispatcher.shutdown();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "draining");
        assert_eq!(json["dispatcher"], "closed");
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_tracks_state_and_dispatcher() {
        let state = test_state();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.dispatcher.shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
