//! Ops overview route.

use std::time::Duration;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::server::app::AppState;

const DEFAULT_WINDOW_SECS: u64 = 900;
const MAX_WINDOW_SECS: u64 = 86_400;

#[derive(Debug, Default, Deserialize)]
pub struct OverviewQuery {
    #[serde(default)]
    pub window_secs: Option<u64>,
}

/// Queue depth by status, provider mix, and worker health in one read.
pub async fn overview_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<OverviewQuery>,
) -> Response {
    let window = Duration::from_secs(
        query
            .window_secs
            .unwrap_or(DEFAULT_WINDOW_SECS)
            .clamp(60, MAX_WINDOW_SECS),
    );

    match state.kernel.overview.overview(window).await {
        Ok(overview) => (StatusCode::OK, Json(overview)).into_response(),
        Err(error) => {
            error!(%error, "overview read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "store unavailable"})),
            )
                .into_response()
        }
    }
}
