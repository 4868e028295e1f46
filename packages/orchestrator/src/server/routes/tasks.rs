//! Task read and cancel routes.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::kernel::queue::CancelOutcome;
use crate::server::app::AppState;

/// Progress read endpoint: the enqueuer polls here, never the queue itself.
pub async fn get_task_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.kernel.tasks.get_task(id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(json!({ "task": task }))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task not found"})),
        )
            .into_response(),
        Err(error) => {
            error!(%error, task_id = %id, "task read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "store unavailable"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelTaskRequest {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Cooperative cancel: queued rows flip in the store, running handlers get
/// the signal. Every call lands in the ops audit log.
pub async fn cancel_task_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelTaskRequest>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    let outcome = match state.kernel.queue.cancel(id).await {
        Ok(outcome) => outcome,
        Err(error) => {
            error!(%error, task_id = %id, "cancel failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "store unavailable"})),
            )
                .into_response();
        }
    };

    if outcome == CancelOutcome::RunningSignalNeeded {
        state.kernel.cancels.signal(id).await;
    }

    let actor = body.actor.unwrap_or_else(|| "unknown".to_string());
    let detail = body.reason.map(|reason| json!({ "reason": reason }));
    if let Err(error) = state
        .kernel
        .overview
        .record_action(&actor, "task.cancel", Some(id), detail)
        .await
    {
        error!(%error, task_id = %id, "ops audit append failed");
    }

    let (status, label) = match outcome {
        CancelOutcome::Cancelled => (StatusCode::OK, "cancelled"),
        CancelOutcome::RunningSignalNeeded => (StatusCode::ACCEPTED, "signalled"),
        CancelOutcome::AlreadyTerminal => (StatusCode::CONFLICT, "already_terminal"),
        CancelOutcome::NotFound => (StatusCode::NOT_FOUND, "not_found"),
    };
    (status, Json(json!({ "outcome": label }))).into_response()
}
