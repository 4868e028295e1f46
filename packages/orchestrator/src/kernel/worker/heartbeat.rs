//! Worker heartbeats and health derivation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kernel::store::{HeartbeatStore, TaskStore, WorkerHeartbeat};

/// Health buckets derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Online,
    Degraded,
    Offline,
}

/// `online` within 10 s, `degraded` within 30 s, `offline` beyond.
pub fn health_for_age(age: chrono::Duration) -> WorkerHealth {
    if age <= chrono::Duration::seconds(10) {
        WorkerHealth::Online
    } else if age <= chrono::Duration::seconds(30) {
        WorkerHealth::Degraded
    } else {
        WorkerHealth::Offline
    }
}

/// Periodic heartbeat upserts for one worker process.
pub struct HeartbeatEmitter {
    heartbeats: Arc<dyn HeartbeatStore>,
    tasks: Arc<dyn TaskStore>,
    worker_id: String,
    interval: Duration,
    active: Arc<AtomicUsize>,
}

impl HeartbeatEmitter {
    pub fn new(
        heartbeats: Arc<dyn HeartbeatStore>,
        tasks: Arc<dyn TaskStore>,
        worker_id: String,
        interval: Duration,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            heartbeats,
            tasks,
            worker_id,
            interval,
            active,
        }
    }

    fn snapshot(&self, queue_lag_ms: i64) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id() as i32,
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_tasks: self.active.load(Ordering::SeqCst) as i32,
            queue_lag_ms,
            updated_at: Utc::now(),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let queue_lag_ms = match self.tasks.oldest_due_age_ms(Utc::now()).await {
                Ok(age) => age.unwrap_or(0),
                Err(error) => {
                    warn!(%error, "queue lag probe failed");
                    0
                }
            };
            if let Err(error) = self.heartbeats.upsert_heartbeat(&self.snapshot(queue_lag_ms)).await
            {
                warn!(worker_id = %self.worker_id, %error, "heartbeat upsert failed");
            } else {
                debug!(worker_id = %self.worker_id, queue_lag_ms, "heartbeat");
            }
        }
    }
}
