//! Ops read models and the audit trail.
//!
//! Read-only derivations for dashboards: queue depth by status, provider
//! mix over the last hour, worker health. Reads degrade instead of failing:
//! a database without the telemetry tables yields `degraded: true` and an
//! `unknown` bucket, never a 500. Mutating ops actions append to
//! `agent_ops_audit_log`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::store::{
    HeartbeatStore, OpsAuditEntry, OverviewStore, ProviderCount, StatusCount, StoreError,
    WorkerHeartbeat,
};
use super::worker::heartbeat::{health_for_age, WorkerHealth};

/// Window for the provider mix read.
const PROVIDER_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize)]
pub struct ProviderMix {
    pub degraded: bool,
    pub buckets: Vec<ProviderCount>,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub health: WorkerHealth,
}

#[derive(Debug, Serialize)]
pub struct OpsOverview {
    pub window_secs: u64,
    pub statuses: Vec<StatusCount>,
    pub providers: ProviderMix,
    pub workers: Vec<WorkerStatus>,
}

pub struct OverviewService {
    overview: Arc<dyn OverviewStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
}

impl OverviewService {
    pub fn new(overview: Arc<dyn OverviewStore>, heartbeats: Arc<dyn HeartbeatStore>) -> Self {
        Self {
            overview,
            heartbeats,
        }
    }

    pub async fn overview(&self, window: Duration) -> Result<OpsOverview, StoreError> {
        let now = Utc::now();
        let since = now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));

        let statuses = self.overview.count_tasks_by_status(since).await?;

        let provider_since =
            now - chrono::Duration::from_std(PROVIDER_WINDOW).unwrap_or_else(|_| chrono::Duration::hours(1));
        let providers = match self.overview.provider_mix(provider_since).await {
            Ok(buckets) => ProviderMix {
                degraded: false,
                buckets,
            },
            Err(error) if error.is_schema_drift() => {
                warn!(%error, "provider mix unavailable, degrading overview");
                ProviderMix {
                    degraded: true,
                    buckets: vec![ProviderCount {
                        provider: "unknown".to_string(),
                        count: 0,
                        failures: 0,
                    }],
                }
            }
            Err(error) => return Err(error),
        };

        let workers = self
            .heartbeats
            .list_heartbeats()
            .await?
            .into_iter()
            .map(|heartbeat| {
                let health = health_for_age(now - heartbeat.updated_at);
                WorkerStatus { heartbeat, health }
            })
            .collect();

        Ok(OpsOverview {
            window_secs: window.as_secs(),
            statuses,
            providers,
            workers,
        })
    }

    /// Record who did what; called by the mutating ops routes.
    pub async fn record_action(
        &self,
        actor: &str,
        action: &str,
        task_id: Option<Uuid>,
        detail: Option<Value>,
    ) -> Result<(), StoreError> {
        let entry = OpsAuditEntry::new(actor, action, task_id, detail);
        info!(actor = %entry.actor, action = %entry.action, task_id = ?entry.task_id, "ops action");
        self.overview.append_ops_audit(&entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::{MemoryStore, SchemaFeatures};
    use chrono::Utc;

    fn service(store: Arc<MemoryStore>) -> OverviewService {
        OverviewService::new(store.clone(), store)
    }

    #[tokio::test]
    async fn overview_degrades_without_trace_events() {
        let store = Arc::new(MemoryStore::new());
        store.set_features(SchemaFeatures {
            has_trace_id_column: true,
            has_trace_events_table: false,
        });

        let overview = service(store).overview(Duration::from_secs(900)).await.unwrap();
        assert!(overview.providers.degraded);
        assert_eq!(overview.providers.buckets.len(), 1);
        assert_eq!(overview.providers.buckets[0].provider, "unknown");
    }

    #[tokio::test]
    async fn worker_health_is_derived_from_heartbeat_age() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "w-online".to_string(),
                host: "host-a".to_string(),
                pid: 42,
                version: "0.1.0".to_string(),
                active_tasks: 1,
                queue_lag_ms: 5,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .upsert_heartbeat(&WorkerHeartbeat {
                worker_id: "w-stale".to_string(),
                host: "host-b".to_string(),
                pid: 43,
                version: "0.1.0".to_string(),
                active_tasks: 0,
                queue_lag_ms: 0,
                updated_at: Utc::now() - chrono::Duration::minutes(5),
            })
            .await
            .unwrap();

        let overview = service(store).overview(Duration::from_secs(900)).await.unwrap();
        let health: Vec<_> = overview
            .workers
            .iter()
            .map(|w| (w.heartbeat.worker_id.as_str(), w.health))
            .collect();
        assert_eq!(
            health,
            vec![("w-online", WorkerHealth::Online), ("w-stale", WorkerHealth::Offline)]
        );
    }

    #[tokio::test]
    async fn record_action_appends_to_the_audit_log() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());

        let task_id = Uuid::new_v4();
        service
            .record_action("ops@present", "task.cancel", Some(task_id), None)
            .await
            .unwrap();

        let entries = store.ops_audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "task.cancel");
        assert_eq!(entries[0].task_id, Some(task_id));
    }
}
