use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub worker_concurrency: usize,
    pub worker_lease_ms: i64,
    pub worker_max_attempts: i32,
    /// TTL for the in-process agent-dispatch dedupe cache.
    pub canvas_agent_transcript_window_ms: i64,
    /// Per-minute ceiling for outbound search spend; 0 disables the breaker.
    pub cost_search_per_minute_limit: u32,
    pub replay: ReplayConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 4)?,
            worker_lease_ms: parse_or("WORKER_LEASE_MS", 60_000)?,
            worker_max_attempts: parse_or("WORKER_MAX_ATTEMPTS", 5)?,
            canvas_agent_transcript_window_ms: parse_or("CANVAS_AGENT_TRANSCRIPT_WINDOW_MS", 15_000)?,
            cost_search_per_minute_limit: parse_or("COST_SEARCH_PER_MINUTE_LIMIT", 30)?,
            replay: ReplayConfig::from_env()?,
        })
    }
}

/// Knobs for the replay-telemetry queue and flusher.
///
/// Every value is clamped to a safe floor so a bad env var can degrade
/// capture quality but never wedge the pipeline.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub retention_days: i64,
    pub queue_max: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub inline_max_bytes: usize,
    pub blob_max_bytes: usize,
    pub preview_chars: usize,
}

impl ReplayConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            retention_days: parse_or("AGENT_REPLAY_RETENTION_DAYS", 14i64)?.max(1),
            queue_max: parse_or("AGENT_REPLAY_QUEUE_MAX", 2048usize)?.max(16),
            batch_size: parse_or("AGENT_REPLAY_BATCH_SIZE", 64usize)?.max(1),
            flush_interval: Duration::from_millis(
                parse_or("AGENT_REPLAY_FLUSH_MS", 1_000u64)?.max(100),
            ),
            inline_max_bytes: parse_or("AGENT_REPLAY_INLINE_MAX_BYTES", 16_384usize)?.max(256),
            blob_max_bytes: parse_or("AGENT_REPLAY_BLOB_MAX_BYTES", 262_144usize)?.max(1_024),
            preview_chars: parse_or("AGENT_REPLAY_PREVIEW_CHARS", 256usize)?.max(32),
        })
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            queue_max: 2048,
            batch_size: 64,
            flush_interval: Duration::from_millis(1_000),
            inline_max_bytes: 16_384,
            blob_max_bytes: 262_144,
            preview_chars: 256,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}
