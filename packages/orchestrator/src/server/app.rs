//! Application setup.

use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::Kernel;
use crate::server::routes::{
    cancel_task_handler, get_task_handler, health_handler, overview_handler, run_steward_handler,
};

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    /// Present when backed by Postgres; the health check probes it.
    pub db_pool: Option<PgPool>,
}

/// Assemble the router. The worker runtime and the replay flusher run as
/// separate tasks against the same kernel.
pub fn build_app(kernel: Arc<Kernel>, db_pool: Option<PgPool>) -> Router {
    let state = AppState { kernel, db_pool };

    Router::new()
        .route("/health", get(health_handler))
        .route("/steward/run/:steward", post(run_steward_handler))
        .route("/tasks/:id", get(get_task_handler))
        .route("/tasks/:id/cancel", post(cancel_task_handler))
        .route("/ops/overview", get(overview_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
