//! Task submission and polling endpoints.
//!
//! `POST /tasks` submits one operation and waits up to the configured sync
//! timeout: a finished task answers 200 with its result or error string, a
//! still-running one answers 202 with its id for polling through
//! `GET /tasks/{id}`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use colander_core::{Kwargs, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::pipeline::{TaskStatus, WaitError};
use crate::service::operation::TaskRequest;

/// Body of `POST /tasks`. `priority` and `use_cache` travel in `kwargs`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskBody {
    pub operation: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// A task id with its current status, flattened into one JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: Uuid,
    #[serde(flatten)]
    pub status: TaskStatus,
}

fn error_response(code: StatusCode, message: impl std::fmt::Display) -> Response {
    (code, Json(json!({ "error": message.to_string() }))).into_response()
}

pub async fn submit_task_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitTaskBody>,
) -> Response {
    let request = match TaskRequest::from_parts(body.operation, body.args, body.kwargs) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let handle = state.dispatcher.submit_task(request);
    debug!(task = %handle.id(), "dashboard submission");

    if let Err(WaitError::Dropped) = handle.wait(state.config.sync_wait_timeout).await {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, WaitError::Dropped);
    }

    let status = handle.status();
    let code = if status.is_pending() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(TaskView {
            id: handle.id(),
            status,
        }),
    )
        .into_response()
}

pub async fn task_status_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.dispatcher.status(id) {
        Some(status) => Json(TaskView { id, status }).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown task {id}")),
    }
}
