//! Steward enqueue surface.
//!
//! `POST /steward/run/:steward` normalizes to one queue enqueue for the task
//! `<steward>.run`. Dedupe never surfaces as a conflict: a duplicate request
//! id answers `202` with the existing row.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::common::envelope::Envelope;
use crate::kernel::queue::{EnqueueError, EnqueueRequest};
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStewardRequest {
    pub room: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub intent_id: Option<String>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub resource_keys: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub require_trace_id: bool,
}

pub async fn run_steward_handler(
    Extension(state): Extension<AppState>,
    Path(steward): Path<String>,
    Json(body): Json<RunStewardRequest>,
) -> Response {
    if let Some(request_id) = &body.request_id {
        if request_id.trim().is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "requestId must be a non-blank string"})),
            )
                .into_response();
        }
    }
    if body.room.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "room must be a non-blank string"})),
        )
            .into_response();
    }

    // Voice front-ends re-send the same dispatch inside one transcript
    // window; absent an explicit request id, bucket it so the repeats
    // normalize to one enqueue intent. The DB constraint stays
    // authoritative.
    let window_ms = state.kernel.config.canvas_agent_transcript_window_ms.max(1);
    let request_id = body.request_id.clone().unwrap_or_else(|| {
        let bucket = Utc::now().timestamp_millis() / window_ms;
        format!("dispatch:{}:{}:{}", body.room, steward, bucket)
    });
    if !state.kernel.dispatch_dedupe.should_dispatch(&body.room, &steward) {
        debug!(room = %body.room, steward = %steward, "duplicate dispatch inside transcript window");
    }

    let envelope = Envelope {
        request_id: Some(request_id.clone()),
        trace_id: body.trace_id.clone(),
        intent_id: body.intent_id.clone(),
        execution_id: Some(uuid::Uuid::new_v4().to_string()),
        ..Default::default()
    };

    let request = EnqueueRequest::builder()
        .room(body.room.clone())
        .task(format!("{}.run", steward))
        .params(body.params.clone())
        .envelope(envelope)
        .request_id(Some(request_id))
        .dedupe_key(body.dedupe_key.clone())
        .resource_keys(body.resource_keys.clone())
        .priority(body.priority)
        .run_at(body.run_at)
        .require_trace_id(body.require_trace_id)
        .build();

    match state.kernel.queue.enqueue(request).await {
        Ok(task) => (StatusCode::ACCEPTED, Json(json!({ "task": task }))).into_response(),
        Err(error @ (EnqueueError::TraceIdRequired(_) | EnqueueError::TraceIdColumnRequired(_))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": error.to_string()})),
        )
            .into_response(),
        Err(EnqueueError::Store(error)) => {
            error!(%error, steward = %steward, "enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "store unavailable"})),
            )
                .into_response()
        }
    }
}
