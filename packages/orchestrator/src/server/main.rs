// Main entry point: HTTP enqueue surface + worker runtime in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator_core::kernel::replay::{run_retention_sweeper, ReplayFlusher};
use orchestrator_core::kernel::store::{PostgresStore, TaskStore};
use orchestrator_core::kernel::worker::registry::StewardRegistry;
use orchestrator_core::kernel::worker::{WorkerConfig, WorkerRuntime};
use orchestrator_core::kernel::Kernel;
use orchestrator_core::server::build_app;
use orchestrator_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PRESENT agent orchestrator");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let features = store
        .refresh_features()
        .await
        .context("Failed to probe schema features")?;
    tracing::info!(?features, "schema features probed");

    let port = config.port;
    let kernel = Arc::new(Kernel::from_postgres(store.clone(), config.clone()));

    // Stewards register here; the orchestration core ships none of its own.
    // e.g. registry.register::<CanvasPromptParams, _, _>("canvas.agent_prompt", ...)
    let registry = Arc::new(StewardRegistry::new());

    let shutdown = CancellationToken::new();

    let worker_config = WorkerConfig {
        concurrency: config.worker_concurrency,
        lease_ttl: Duration::from_millis(config.worker_lease_ms.max(1_000) as u64),
        max_attempts: config.worker_max_attempts,
        ..Default::default()
    };
    let worker = WorkerRuntime::new(
        Arc::clone(&kernel.queue),
        registry,
        Arc::clone(&kernel.heartbeats),
        kernel.replay.clone(),
        Arc::clone(&kernel.followups),
        Arc::clone(&kernel.budget),
        Arc::clone(&kernel.cancels),
        worker_config,
    );
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let flusher = ReplayFlusher::new(&kernel.replay, Arc::clone(&kernel.replay_sink));
    let flusher_handle = tokio::spawn(flusher.run(shutdown.clone()));

    let sweeper_handle = tokio::spawn(run_retention_sweeper(
        Arc::clone(&kernel.replay_sink),
        Duration::from_secs(3600),
        shutdown.clone(),
    ));

    let app = build_app(Arc::clone(&kernel), Some(pool));
    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = serve_shutdown.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    tracing::info!("Shutting down: draining workers and flushing telemetry");
    shutdown.cancel();
    let _ = worker_handle.await;
    let _ = flusher_handle.await;
    let _ = sweeper_handle.await;

    Ok(())
}
