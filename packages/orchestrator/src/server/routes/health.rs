use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    replay_queue_len: usize,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Checks database connectivity (when running against Postgres) and reports
/// the replay queue depth. Returns 200 OK when healthy, 503 otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.db_pool {
        Some(pool) => {
            match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                sqlx::query("SELECT 1").execute(pool),
            )
            .await
            {
                Ok(Ok(_)) => DatabaseHealth {
                    status: "ok".to_string(),
                    error: None,
                },
                Ok(Err(e)) => DatabaseHealth {
                    status: "error".to_string(),
                    error: Some(format!("Query failed: {}", e)),
                },
                Err(_) => DatabaseHealth {
                    status: "error".to_string(),
                    error: Some("Query timeout (>5s)".to_string()),
                },
            }
        }
        None => DatabaseHealth {
            status: "in-memory".to_string(),
            error: None,
        },
    };

    let is_healthy = database.status != "error";
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            database,
            replay_queue_len: state.kernel.replay.queue_len(),
        }),
    )
}
