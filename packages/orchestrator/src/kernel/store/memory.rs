//! In-memory store double.
//!
//! Backs unit and scenario tests (and single-process development) with the
//! same contract the Postgres adapter honors: in-flight request-id
//! uniqueness, conditional claims keyed on lease tokens, and idempotent
//! telemetry upserts. State is inspectable so tests can assert on rows
//! directly.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::schema::SchemaFeatures;
use super::{
    FinalizeOutcome, HeartbeatStore, InsertOutcome, OpsAuditEntry, OverviewStore, ProviderCount,
    StatusCount, StoreError, TaskStore, WorkerHeartbeat,
};
use crate::kernel::queue::task::{Task, TaskStatus};
use crate::kernel::replay::{BlobRow, ModelIoRow, ReplaySink, ToolIoRow, TraceEventRow};

#[derive(Default)]
struct Inner {
    features: SchemaFeatures,
    tasks: HashMap<Uuid, Task>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
    ops_audit: Vec<OpsAuditEntry>,
    trace_events: HashMap<String, TraceEventRow>,
    model_io: HashMap<String, ModelIoRow>,
    tool_io: HashMap<String, ToolIoRow>,
    blobs: HashMap<(String, String), BlobRow>,
    /// Number of upcoming sink writes to fail (flush-path tests).
    fail_sink_writes: u32,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pretend to be an older database.
    pub fn set_features(&self, features: SchemaFeatures) {
        self.lock().features = features;
    }

    /// Fail the next `n` sink writes with a transient error.
    pub fn fail_next_sink_writes(&self, n: u32) {
        self.lock().fail_sink_writes = n;
    }

    // ---- inspection helpers for tests ----

    pub fn all_tasks(&self) -> Vec<Task> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn put_task(&self, task: Task) {
        self.lock().tasks.insert(task.id, task);
    }

    pub fn trace_event_count(&self) -> usize {
        self.lock().trace_events.len()
    }

    pub fn stored_trace_event(&self, event_id: &str) -> Option<TraceEventRow> {
        self.lock().trace_events.get(event_id).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn stored_blob(&self, event_id: &str, kind: &str) -> Option<BlobRow> {
        self.lock()
            .blobs
            .get(&(event_id.to_string(), kind.to_string()))
            .cloned()
    }

    pub fn model_io_count(&self) -> usize {
        self.lock().model_io.len()
    }

    pub fn tool_io_count(&self) -> usize {
        self.lock().tool_io.len()
    }

    pub fn ops_audit_entries(&self) -> Vec<OpsAuditEntry> {
        self.lock().ops_audit.clone()
    }

    fn check_sink_failure(inner: &mut Inner) -> Result<(), StoreError> {
        if inner.fail_sink_writes > 0 {
            inner.fail_sink_writes -= 1;
            return Err(StoreError::Unavailable(anyhow!("injected sink failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    fn features(&self) -> SchemaFeatures {
        self.lock().features
    }

    async fn refresh_features(&self) -> Result<SchemaFeatures, StoreError> {
        Ok(self.lock().features)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn insert_task(&self, task: Task) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.lock();
        if let Some(request_id) = &task.request_id {
            let duplicate = inner
                .tasks
                .values()
                .any(|t| t.status.is_in_flight() && t.request_id.as_deref() == Some(request_id));
            if duplicate {
                return Ok(InsertOutcome::Conflict);
            }
        }
        let mut task = task;
        if !inner.features.has_trace_id_column {
            task.trace_id = None;
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(InsertOutcome::Inserted(task))
    }

    async fn find_in_flight_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .find(|t| t.status.is_in_flight() && t.request_id.as_deref() == Some(request_id))
            .cloned())
    }

    async fn find_coalescable(
        &self,
        task: &str,
        room: &str,
        dedupe_key: Option<&str>,
    ) -> Result<Option<Task>, StoreError> {
        let inner = self.lock();
        let mut candidates: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Queued
                    && t.task == task
                    && t.room == room
                    && (dedupe_key.is_none() || t.dedupe_key.as_deref() == dedupe_key)
            })
            .collect();
        candidates.sort_by_key(|t| t.created_at);
        Ok(candidates.last().map(|t| (*t).clone()))
    }

    async fn update_queued_params(
        &self,
        id: Uuid,
        params: Value,
        trace_id: Option<String>,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.lock();
        let has_trace_column = inner.features.has_trace_id_column;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.params = params;
                if has_trace_column {
                    if let Some(trace_id) = trace_id {
                        task.trace_id = Some(trace_id);
                    }
                }
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        age_bonus_secs: i64,
        excluded_keys: &[String],
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut due: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .filter(|t| !t.resource_keys.iter().any(|k| excluded_keys.contains(k)))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.effective_priority(now, age_bonus_secs), t.created_at));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Queued && task.lease_token.is_none() => {
                task.status = TaskStatus::Running;
                task.lease_token = Some(lease_token);
                task.lease_expires_at = Some(lease_expires_at);
                task.attempt += 1;
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut stale: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.lease_expires_at.map_or(false, |expires| expires <= now)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.lease_expires_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn try_reclaim(
        &self,
        id: Uuid,
        old_token: Uuid,
        new_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.lease_token == Some(old_token) =>
            {
                task.lease_token = Some(new_token);
                task.lease_expires_at = Some(lease_expires_at);
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.lease_token == Some(lease_token) =>
            {
                task.lease_expires_at = Some(lease_expires_at);
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_task(
        &self,
        id: Uuid,
        lease_token: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.lease_token == Some(lease_token) =>
            {
                task.status = status;
                task.result = result;
                if error.is_some() {
                    task.error = error;
                }
                task.lease_token = None;
                task.lease_expires_at = None;
                task.updated_at = Utc::now();
                Ok(FinalizeOutcome::Applied(task.clone()))
            }
            _ => Ok(FinalizeOutcome::LeaseLost),
        }
    }

    async fn requeue_task(
        &self,
        id: Uuid,
        lease_token: Uuid,
        run_at: Option<DateTime<Utc>>,
        resource_keys: Option<Vec<String>>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.lease_token == Some(lease_token) =>
            {
                task.status = TaskStatus::Queued;
                task.lease_token = None;
                task.lease_expires_at = None;
                if let Some(run_at) = run_at {
                    task.run_at = Some(run_at);
                }
                if let Some(resource_keys) = resource_keys {
                    task.resource_keys = resource_keys;
                }
                if error.is_some() {
                    task.error = error;
                }
                task.updated_at = Utc::now();
                Ok(FinalizeOutcome::Applied(task.clone()))
            }
            _ => Ok(FinalizeOutcome::LeaseLost),
        }
    }

    async fn cancel_queued(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Cancelled;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn running_resource_keys(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .flat_map(|t| t.resource_keys.iter().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn oldest_due_age_ms(&self, now: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .map(|t| (now - t.created_at).num_milliseconds())
            .max())
    }
}

#[async_trait]
impl HeartbeatStore for MemoryStore {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        self.lock()
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let mut rows: Vec<WorkerHeartbeat> = self.lock().heartbeats.values().cloned().collect();
        rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(rows)
    }
}

#[async_trait]
impl OverviewStore for MemoryStore {
    async fn count_tasks_by_status(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusCount>, StoreError> {
        let inner = self.lock();
        let mut counts: HashMap<TaskStatus, i64> = HashMap::new();
        for task in inner.tasks.values().filter(|t| t.updated_at >= since) {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect();
        rows.sort_by_key(|row| row.count);
        rows.reverse();
        Ok(rows)
    }

    async fn provider_mix(&self, since: DateTime<Utc>) -> Result<Vec<ProviderCount>, StoreError> {
        let inner = self.lock();
        if !inner.features.has_trace_events_table {
            return Err(StoreError::MissingTable("agent_trace_events"));
        }
        let mut mix: HashMap<String, (i64, i64)> = HashMap::new();
        for event in inner.trace_events.values().filter(|e| e.created_at >= since) {
            let provider = event
                .provider
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let slot = mix.entry(provider).or_insert((0, 0));
            slot.0 += 1;
            if event.error.is_some() || event.status == "error" {
                slot.1 += 1;
            }
        }
        let mut rows: Vec<ProviderCount> = mix
            .into_iter()
            .map(|(provider, (count, failures))| ProviderCount {
                provider,
                count,
                failures,
            })
            .collect();
        rows.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(rows)
    }

    async fn append_ops_audit(&self, entry: &OpsAuditEntry) -> Result<(), StoreError> {
        self.lock().ops_audit.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl ReplaySink for MemoryStore {
    async fn upsert_trace_events(&self, rows: &[TraceEventRow]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_sink_failure(&mut inner)?;
        for row in rows {
            inner
                .trace_events
                .entry(row.event_id.clone())
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn upsert_model_io(&self, rows: &[ModelIoRow]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_sink_failure(&mut inner)?;
        for row in rows {
            inner
                .model_io
                .entry(row.event_id.clone())
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn upsert_tool_io(&self, rows: &[ToolIoRow]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_sink_failure(&mut inner)?;
        for row in rows {
            inner
                .tool_io
                .entry(row.event_id.clone())
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn upsert_blobs(&self, rows: &[BlobRow]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_sink_failure(&mut inner)?;
        for row in rows {
            inner
                .blobs
                .entry((row.event_id.clone(), row.kind.as_str().to_string()))
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.trace_events.len()
            + inner.model_io.len()
            + inner.tool_io.len()
            + inner.blobs.len();
        inner.trace_events.retain(|_, row| row.expires_at > now);
        inner.model_io.retain(|_, row| row.expires_at > now);
        inner.tool_io.retain(|_, row| row.expires_at > now);
        inner.blobs.retain(|_, row| row.expires_at > now);
        let after = inner.trace_events.len()
            + inner.model_io.len()
            + inner.tool_io.len()
            + inner.blobs.len();
        Ok((before - after) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::queue::task::DEFAULT_PRIORITY;
    use serde_json::json;

    fn queued_task(request_id: &str) -> Task {
        Task::queued(
            "r1",
            "fairy.intent",
            json!({}),
            Some(request_id.to_string()),
            None,
            None,
            vec![],
            DEFAULT_PRIORITY,
            None,
        )
    }

    #[tokio::test]
    async fn insert_conflicts_on_in_flight_request_id() {
        let store = MemoryStore::new();
        let first = store.insert_task(queued_task("req-1")).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = store.insert_task(queued_task("req-1")).await.unwrap();
        assert!(matches!(second, InsertOutcome::Conflict));
    }

    #[tokio::test]
    async fn terminal_rows_release_the_request_id() {
        let store = MemoryStore::new();
        let InsertOutcome::Inserted(task) = store.insert_task(queued_task("req-1")).await.unwrap()
        else {
            panic!("first insert must land");
        };

        let lease = Uuid::new_v4();
        store
            .try_claim(task.id, lease, Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .expect("claim must win");
        store
            .complete_task(task.id, lease, TaskStatus::Succeeded, None, None)
            .await
            .unwrap();

        let again = store.insert_task(queued_task("req-1")).await.unwrap();
        assert!(matches!(again, InsertOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn claim_races_yield_one_winner() {
        let store = MemoryStore::new();
        let InsertOutcome::Inserted(task) = store.insert_task(queued_task("req-1")).await.unwrap()
        else {
            panic!("insert");
        };
        let expires = Utc::now() + chrono::Duration::minutes(1);

        let win = store.try_claim(task.id, Uuid::new_v4(), expires).await.unwrap();
        let lose = store.try_claim(task.id, Uuid::new_v4(), expires).await.unwrap();
        assert!(win.is_some());
        assert!(lose.is_none());
    }

    #[tokio::test]
    async fn duplicate_complete_with_the_same_lease_is_a_no_op() {
        let store = MemoryStore::new();
        let InsertOutcome::Inserted(task) = store.insert_task(queued_task("req-1")).await.unwrap()
        else {
            panic!("insert");
        };
        let lease = Uuid::new_v4();
        store
            .try_claim(task.id, lease, Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let first = store
            .complete_task(
                task.id,
                lease,
                TaskStatus::Succeeded,
                Some(serde_json::json!({"n": 1})),
                None,
            )
            .await
            .unwrap();
        assert!(first.is_applied());

        // The lease was consumed by the first finalize; the replay loses.
        let second = store
            .complete_task(
                task.id,
                lease,
                TaskStatus::Failed,
                None,
                Some("late writer".to_string()),
            )
            .await
            .unwrap();
        assert!(matches!(second, FinalizeOutcome::LeaseLost));

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn complete_with_stale_token_is_lease_lost() {
        let store = MemoryStore::new();
        let InsertOutcome::Inserted(task) = store.insert_task(queued_task("req-1")).await.unwrap()
        else {
            panic!("insert");
        };
        let lease = Uuid::new_v4();
        store
            .try_claim(task.id, lease, Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let outcome = store
            .complete_task(task.id, Uuid::new_v4(), TaskStatus::Succeeded, None, None)
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::LeaseLost));
    }

    #[tokio::test]
    async fn provider_mix_degrades_without_the_table() {
        let store = MemoryStore::new();
        store.set_features(SchemaFeatures {
            has_trace_events_table: false,
            has_trace_id_column: true,
        });
        let err = store.provider_mix(Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingTable(_)));
    }
}
