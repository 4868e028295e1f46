//! Durable task queue.
//!
//! ```text
//! HTTP route ──► enqueue (dedupe + coalesce) ──► agent_tasks
//!                                                   │
//! WorkerRuntime ──► claim_local_scope ◄─────────────┘
//!     │                 (lease + arbiter + stale-lease reclaim)
//!     ├─► complete / requeue (conditional on lease token)
//!     └─► fail_with_backoff (full jitter, attempt-capped by the worker)
//! ```
//!
//! Concurrency safety rests on the store's conditional updates and the
//! in-flight request-id uniqueness constraint; the queue adds policy:
//! which families coalesce, how candidates are ordered, and which resource
//! keys may run together.

pub mod backoff;
mod enqueue;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::envelope::derive_default_lock_key;
use crate::kernel::arbiter::{ResourceArbiter, ResourceGrant};
use crate::kernel::store::{FinalizeOutcome, InsertOutcome, StoreError, TaskStore};

pub use enqueue::{CoalescePolicy, EnqueueError, EnqueueRequest};
pub use task::{Task, TaskStatus, DEFAULT_PRIORITY};

use enqueue::merge_params;

/// Resource-key prefix that pins a task to one runtime scope.
pub const SCOPE_KEY_PREFIX: &str = "scope:";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Seconds of queue age worth one priority step (starvation ageing).
    pub age_bonus_secs: i64,
    /// Bound the ageing parameters must satisfy: no eligible task waits
    /// longer than this once its keys are free.
    pub max_starvation_ttl: Duration,
    /// Stale-lease rows swept per claim pass.
    pub reclaim_batch: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            age_bonus_secs: 300,
            max_starvation_ttl: Duration::from_secs(600),
            reclaim_batch: 32,
            backoff_base: backoff::DEFAULT_BASE,
            backoff_cap: backoff::DEFAULT_CAP,
        }
    }
}

/// Inputs for one claim pass.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct ClaimOptions {
    #[builder(setter(into))]
    pub worker_id: String,
    /// Tasks tagged `scope:<tag>` are only claimable by a matching worker.
    #[builder(default)]
    pub runtime_scope: Option<String>,
    #[builder(default = 1)]
    pub limit: i64,
    #[builder(default = Duration::from_secs(60))]
    pub lease_ttl: Duration,
    #[builder(default)]
    pub skip_resource_keys: Vec<String>,
}

/// A task now owned by the caller, with the arbiter grant covering its keys.
#[derive(Debug)]
pub struct ClaimedTask {
    pub task: Task,
    pub grant: ResourceGrant,
    /// True when this claim recovered a stale lease instead of a queued row.
    pub reclaimed: bool,
}

/// Outcome of a cancel request.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The queued row was cancelled in the store.
    Cancelled,
    /// The task is running; deliver the cooperative signal.
    RunningSignalNeeded,
    AlreadyTerminal,
    NotFound,
}

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    arbiter: ResourceArbiter,
    coalesce: CoalescePolicy,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, coalesce: CoalescePolicy, config: QueueConfig) -> Self {
        Self {
            store,
            arbiter: ResourceArbiter::new(),
            coalesce,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    /// Enqueue a task, honoring request-id dedupe and the coalesce policy.
    ///
    /// Returns the persisted row: freshly inserted, an existing in-flight
    /// duplicate, or the coalesced representative.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Task, EnqueueError> {
        let request_id = request.effective_request_id();

        // Dedupe pre-check: an in-flight duplicate wins outright.
        if let Some(request_id) = &request_id {
            if let Some(existing) = self.store.find_in_flight_by_request_id(request_id).await? {
                debug!(request_id = %request_id, task_id = %existing.id, "enqueue deduped to existing task");
                return Ok(existing);
            }
        }

        let trace_id = request.effective_trace_id();
        if request.require_trace_id {
            if trace_id.is_none() {
                return Err(EnqueueError::TraceIdRequired(request.task.clone()));
            }
            if !self.store.features().has_trace_id_column {
                return Err(EnqueueError::TraceIdColumnRequired(request.task.clone()));
            }
        }

        let mut envelope = request.envelope.clone();
        if envelope.request_id.is_none() {
            envelope.request_id = request_id.clone();
        }
        if envelope.trace_id.is_none() {
            envelope.trace_id = trace_id.clone();
        }
        let params = envelope.merge_into(request.params.clone());

        // Coalesce: fold into the newest queued row of the same (task, room).
        // Callers pinning an explicit request id asked for a distinct intent,
        // so only anonymous enqueues coalesce.
        if request_id.is_none() && self.coalesce.coalesces(&request.task) {
            if let Some(existing) = self
                .store
                .find_coalescable(&request.task, &request.room, request.dedupe_key.as_deref())
                .await?
            {
                let merged = merge_params(&existing.params, &params);
                if let Some(updated) = self
                    .store
                    .update_queued_params(existing.id, merged, trace_id.clone())
                    .await?
                {
                    debug!(task_id = %updated.id, task = %updated.task, "coalesced enqueue into queued row");
                    return Ok(updated);
                }
                // The row was claimed between lookup and update; insert.
            }
        }

        let resource_keys = match &request.resource_keys {
            Some(keys) => keys.clone(),
            None => derive_default_lock_key(&envelope, &params, &request.task, &request.room)
                .into_iter()
                .collect(),
        };

        let row = Task::queued(
            request.room.clone(),
            request.task.clone(),
            params,
            request_id.clone(),
            trace_id.clone(),
            request.dedupe_key.clone(),
            resource_keys,
            request.priority.unwrap_or(DEFAULT_PRIORITY),
            request.run_at,
        );

        match self.insert_with_fallbacks(row, &request).await? {
            Some(task) => Ok(task),
            None => {
                // Conflict with no surviving row to return: surface it.
                Err(EnqueueError::Store(StoreError::Conflict))
            }
        }
    }

    /// Insert with the two recovery paths: conflict-to-existing on the
    /// request-id constraint, and retry-without-trace_id on schema drift.
    async fn insert_with_fallbacks(
        &self,
        row: Task,
        request: &EnqueueRequest,
    ) -> Result<Option<Task>, EnqueueError> {
        let request_id = row.request_id.clone();
        let mut attempt_row = row;
        for _ in 0..2 {
            match self.store.insert_task(attempt_row.clone()).await {
                Ok(InsertOutcome::Inserted(task)) => return Ok(Some(task)),
                Ok(InsertOutcome::Conflict) => {
                    if let Some(request_id) = &request_id {
                        if let Some(existing) =
                            self.store.find_in_flight_by_request_id(request_id).await?
                        {
                            return Ok(Some(existing));
                        }
                        // The duplicate finalized between the conflict and the
                        // lookup; one more insert settles it.
                        continue;
                    }
                    return Ok(None);
                }
                Err(StoreError::MissingColumn("trace_id")) => {
                    if request.require_trace_id {
                        return Err(EnqueueError::TraceIdColumnRequired(request.task.clone()));
                    }
                    warn!(task = %request.task, "store predates trace_id, retrying insert without it");
                    self.store.refresh_features().await?;
                    attempt_row.trace_id = None;
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(None)
    }

    /// Claim due work and sweep stale leases in one synchronous pass
    /// (single-host deployments; a clustered janitor would split these).
    pub async fn claim_local_scope(
        &self,
        options: &ClaimOptions,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Utc::now();
        let lease_expires_at = now + chrono::Duration::from_std(options.lease_ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut claimed = Vec::new();

        let mut excluded = options.skip_resource_keys.clone();
        excluded.extend(self.arbiter.held_keys());
        excluded.extend(self.store.running_resource_keys().await?);
        excluded.sort();
        excluded.dedup();

        let candidates = self
            .store
            .list_claimable(now, options.limit, self.config.age_bonus_secs, &excluded)
            .await?;

        for candidate in candidates {
            if claimed.len() as i64 >= options.limit {
                break;
            }
            if !self.scope_matches(&candidate, options.runtime_scope.as_deref()) {
                continue;
            }
            let Some(grant) = self.arbiter.try_acquire(&candidate.resource_keys) else {
                continue;
            };
            match self
                .store
                .try_claim(candidate.id, Uuid::new_v4(), lease_expires_at)
                .await?
            {
                Some(task) => {
                    debug!(task_id = %task.id, task = %task.task, worker_id = %options.worker_id, attempt = task.attempt, "claimed task");
                    claimed.push(ClaimedTask {
                        task,
                        grant,
                        reclaimed: false,
                    });
                }
                None => self.arbiter.release(grant),
            }
        }

        // Stale-lease sweep: adopt running rows whose worker went dark.
        let stale = self
            .store
            .list_expired_leases(now, self.config.reclaim_batch)
            .await?;
        for row in stale {
            if claimed.len() as i64 >= options.limit {
                break;
            }
            if !self.scope_matches(&row, options.runtime_scope.as_deref()) {
                continue;
            }
            let Some(old_token) = row.lease_token else {
                continue;
            };
            // Keys still held locally mean the stale row is our own handler
            // that missed a renewal; its owner will abandon it.
            let Some(grant) = self.arbiter.try_acquire(&row.resource_keys) else {
                continue;
            };
            match self
                .store
                .try_reclaim(row.id, old_token, Uuid::new_v4(), lease_expires_at)
                .await?
            {
                Some(task) => {
                    info!(task_id = %task.id, task = %task.task, worker_id = %options.worker_id, "reclaimed stale lease");
                    claimed.push(ClaimedTask {
                        task,
                        grant,
                        reclaimed: true,
                    });
                }
                None => self.arbiter.release(grant),
            }
        }

        Ok(claimed)
    }

    fn scope_matches(&self, task: &Task, runtime_scope: Option<&str>) -> bool {
        let wanted = runtime_scope.map(|scope| format!("{}{}", SCOPE_KEY_PREFIX, scope));
        task.resource_keys
            .iter()
            .filter(|key| key.starts_with(SCOPE_KEY_PREFIX))
            .all(|key| Some(key.as_str()) == wanted.as_deref())
    }

    /// Terminal finalize; loses quietly when the lease is stale.
    pub async fn complete(
        &self,
        id: Uuid,
        lease_token: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError> {
        self.store
            .complete_task(id, lease_token, status, result, error)
            .await
    }

    /// Cooperative yield back to the queue; `attempt` is untouched.
    pub async fn requeue(
        &self,
        id: Uuid,
        lease_token: Uuid,
        run_at: Option<DateTime<Utc>>,
        resource_keys: Option<Vec<String>>,
    ) -> Result<FinalizeOutcome, StoreError> {
        self.store
            .requeue_task(id, lease_token, run_at, resource_keys, None)
            .await
    }

    /// Requeue after a transient failure, pushed out by full-jitter backoff
    /// (or the caller-supplied `retry_after` hint).
    pub async fn fail_with_backoff(
        &self,
        task: &Task,
        lease_token: Uuid,
        error: String,
        retry_after: Option<Duration>,
    ) -> Result<FinalizeOutcome, StoreError> {
        let delay = retry_after.unwrap_or_else(|| {
            backoff::full_jitter(task.attempt, self.config.backoff_base, self.config.backoff_cap)
        });
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(2));
        self.store
            .requeue_task(task.id, lease_token, Some(run_at), None, Some(error))
            .await
    }

    /// Cancel: queued rows flip in the store, running rows need the signal.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        if self.store.cancel_queued(id).await? {
            return Ok(CancelOutcome::Cancelled);
        }
        match self.store.get_task(id).await? {
            Some(task) if task.status == TaskStatus::Running => {
                Ok(CancelOutcome::RunningSignalNeeded)
            }
            Some(task) if task.status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            Some(_) => Ok(CancelOutcome::Cancelled),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Release the arbiter grant taken at claim time.
    pub fn release(&self, grant: ResourceGrant) {
        self.arbiter.release(grant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::envelope::Envelope;
    use crate::kernel::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn queue_with(store: Arc<dyn TaskStore>) -> TaskQueue {
        TaskQueue::new(store, CoalescePolicy::standard(), QueueConfig::default())
    }

    fn claim_options(limit: i64) -> ClaimOptions {
        ClaimOptions::builder()
            .worker_id("worker-test")
            .limit(limit)
            .build()
    }

    fn intent_request(request_id: &str) -> EnqueueRequest {
        EnqueueRequest::builder()
            .room("r1")
            .task("fairy.intent")
            .params(json!({"utterance": "make a scorecard"}))
            .request_id(Some(request_id.to_string()))
            .build()
    }

    #[tokio::test]
    async fn dedupe_at_enqueue_returns_the_same_row() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        let first = queue.enqueue(intent_request("req-1")).await.unwrap();
        let second = queue.enqueue(intent_request("req-1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.tasks_with_status(TaskStatus::Queued).len(), 1);
    }

    #[tokio::test]
    async fn coalesce_keeps_newest_params() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        let prompt = |message: &str| {
            EnqueueRequest::builder()
                .room("r1")
                .task("canvas.agent_prompt")
                .params(json!({"message": message}))
                .build()
        };

        let first = queue.enqueue(prompt("draw a dog")).await.unwrap();
        let second = queue.enqueue(prompt("draw a cat")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.params["message"], "draw a cat");
        assert_eq!(store.tasks_with_status(TaskStatus::Queued).len(), 1);
    }

    #[tokio::test]
    async fn non_coalescing_tasks_insert_every_time() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        let intent = |utterance: &str| {
            EnqueueRequest::builder()
                .room("r1")
                .task("fairy.intent")
                .params(json!({"utterance": utterance}))
                .build()
        };

        let first = queue.enqueue(intent("one")).await.unwrap();
        let second = queue.enqueue(intent("two")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(store.tasks_with_status(TaskStatus::Queued).len(), 2);
    }

    #[tokio::test]
    async fn trace_requirement_fails_without_a_trace() {
        let queue = queue_with(Arc::new(MemoryStore::new()));
        let request = EnqueueRequest::builder()
            .room("r1")
            .task("scorecard.run")
            .require_trace_id(true)
            .build();

        let error = queue.enqueue(request).await.unwrap_err();
        assert_eq!(error.to_string(), "TRACE_ID_REQUIRED:scorecard.run");
    }

    #[tokio::test]
    async fn trace_requirement_fails_on_old_schema() {
        let store = Arc::new(MemoryStore::new());
        store.set_features(crate::kernel::store::SchemaFeatures {
            has_trace_id_column: false,
            has_trace_events_table: true,
        });
        let queue = queue_with(store);

        let request = EnqueueRequest::builder()
            .room("r1")
            .task("scorecard.run")
            .envelope(Envelope {
                trace_id: Some("trace-1".into()),
                ..Default::default()
            })
            .require_trace_id(true)
            .build();

        let error = queue.enqueue(request).await.unwrap_err();
        assert_eq!(error.to_string(), "TRACE_ID_COLUMN_REQUIRED:scorecard.run");
    }

    #[tokio::test]
    async fn default_lock_key_lands_on_the_row() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store);

        let task = queue
            .enqueue(
                EnqueueRequest::builder()
                    .room("r1")
                    .task("canvas.agent_prompt")
                    .params(json!({"message": "hello"}))
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(task.resource_keys, vec!["room:r1:canvas".to_string()]);
    }

    /// Store wrapper that misses the first request-id lookup, forcing the
    /// enqueue path through the duplicate-key fallback (concurrent callers).
    struct RacingStore {
        inner: Arc<MemoryStore>,
        missed_once: AtomicBool,
    }

    #[async_trait]
    impl TaskStore for RacingStore {
        fn features(&self) -> crate::kernel::store::SchemaFeatures {
            self.inner.features()
        }
        async fn refresh_features(
            &self,
        ) -> Result<crate::kernel::store::SchemaFeatures, StoreError> {
            self.inner.refresh_features().await
        }
        async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
            self.inner.get_task(id).await
        }
        async fn insert_task(&self, task: Task) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_task(task).await
        }
        async fn find_in_flight_by_request_id(
            &self,
            request_id: &str,
        ) -> Result<Option<Task>, StoreError> {
            if !self.missed_once.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_in_flight_by_request_id(request_id).await
        }
        async fn find_coalescable(
            &self,
            task: &str,
            room: &str,
            dedupe_key: Option<&str>,
        ) -> Result<Option<Task>, StoreError> {
            self.inner.find_coalescable(task, room, dedupe_key).await
        }
        async fn update_queued_params(
            &self,
            id: Uuid,
            params: serde_json::Value,
            trace_id: Option<String>,
        ) -> Result<Option<Task>, StoreError> {
            self.inner.update_queued_params(id, params, trace_id).await
        }
        async fn list_claimable(
            &self,
            now: chrono::DateTime<Utc>,
            limit: i64,
            age_bonus_secs: i64,
            excluded_keys: &[String],
        ) -> Result<Vec<Task>, StoreError> {
            self.inner
                .list_claimable(now, limit, age_bonus_secs, excluded_keys)
                .await
        }
        async fn try_claim(
            &self,
            id: Uuid,
            lease_token: Uuid,
            lease_expires_at: chrono::DateTime<Utc>,
        ) -> Result<Option<Task>, StoreError> {
            self.inner.try_claim(id, lease_token, lease_expires_at).await
        }
        async fn list_expired_leases(
            &self,
            now: chrono::DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<Task>, StoreError> {
            self.inner.list_expired_leases(now, limit).await
        }
        async fn try_reclaim(
            &self,
            id: Uuid,
            old_token: Uuid,
            new_token: Uuid,
            lease_expires_at: chrono::DateTime<Utc>,
        ) -> Result<Option<Task>, StoreError> {
            self.inner
                .try_reclaim(id, old_token, new_token, lease_expires_at)
                .await
        }
        async fn renew_lease(
            &self,
            id: Uuid,
            lease_token: Uuid,
            lease_expires_at: chrono::DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.renew_lease(id, lease_token, lease_expires_at).await
        }
        async fn complete_task(
            &self,
            id: Uuid,
            lease_token: Uuid,
            status: TaskStatus,
            result: Option<serde_json::Value>,
            error: Option<String>,
        ) -> Result<FinalizeOutcome, StoreError> {
            self.inner
                .complete_task(id, lease_token, status, result, error)
                .await
        }
        async fn requeue_task(
            &self,
            id: Uuid,
            lease_token: Uuid,
            run_at: Option<chrono::DateTime<Utc>>,
            resource_keys: Option<Vec<String>>,
            error: Option<String>,
        ) -> Result<FinalizeOutcome, StoreError> {
            self.inner
                .requeue_task(id, lease_token, run_at, resource_keys, error)
                .await
        }
        async fn cancel_queued(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.cancel_queued(id).await
        }
        async fn running_resource_keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.running_resource_keys().await
        }
        async fn oldest_due_age_ms(
            &self,
            now: chrono::DateTime<Utc>,
        ) -> Result<Option<i64>, StoreError> {
            self.inner.oldest_due_age_ms(now).await
        }
    }

    #[tokio::test]
    async fn conflict_falls_back_to_the_existing_row() {
        let inner = Arc::new(MemoryStore::new());
        let existing = queue_with(inner.clone())
            .enqueue(intent_request("req-1"))
            .await
            .unwrap();

        // This queue's first lookup misses, so its insert hits the
        // constraint and must fall back to the winner's row.
        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            missed_once: AtomicBool::new(false),
        });
        let queue = queue_with(racing);
        let task = queue.enqueue(intent_request("req-1")).await.unwrap();

        assert_eq!(task.id, existing.id);
        assert_eq!(inner.tasks_with_status(TaskStatus::Queued).len(), 1);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        let enqueue = |priority: i32, utterance: &str| {
            EnqueueRequest::builder()
                .room("r1")
                .task("fairy.intent")
                .params(json!({ "utterance": utterance }))
                .priority(Some(priority))
                .build()
        };
        queue.enqueue(enqueue(200, "later")).await.unwrap();
        queue.enqueue(enqueue(50, "first")).await.unwrap();
        queue.enqueue(enqueue(100, "second")).await.unwrap();

        let claimed = queue.claim_local_scope(&claim_options(3)).await.unwrap();
        let order: Vec<_> = claimed
            .iter()
            .map(|c| c.task.params["utterance"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "later"]);
    }

    #[tokio::test]
    async fn conflicting_resource_keys_never_run_together() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        let prompt = |message: &str| {
            EnqueueRequest::builder()
                .room("r1")
                .task("fairy.intent")
                .params(json!({ "message": message }))
                .resource_keys(Some(vec!["room:r1:canvas".to_string()]))
                .build()
        };
        queue.enqueue(prompt("one")).await.unwrap();
        queue.enqueue(prompt("two")).await.unwrap();

        let claimed = queue.claim_local_scope(&claim_options(4)).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Releasing the key frees the second task on the next pass.
        let first = claimed.into_iter().next().unwrap();
        queue
            .complete(
                first.task.id,
                first.task.lease_token.unwrap(),
                TaskStatus::Succeeded,
                None,
                None,
            )
            .await
            .unwrap();
        queue.release(first.grant);

        let claimed = queue.claim_local_scope(&claim_options(4)).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn requeue_keeps_attempt_and_applies_overrides() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        queue.enqueue(intent_request("req-1")).await.unwrap();

        let claimed = queue.claim_local_scope(&claim_options(1)).await.unwrap();
        let claimed = claimed.into_iter().next().unwrap();
        assert_eq!(claimed.task.attempt, 1);

        let run_at = Utc::now() + chrono::Duration::minutes(2);
        let outcome = queue
            .requeue(
                claimed.task.id,
                claimed.task.lease_token.unwrap(),
                Some(run_at),
                Some(vec!["room:r1:search".to_string()]),
            )
            .await
            .unwrap();
        queue.release(claimed.grant);

        let FinalizeOutcome::Applied(task) = outcome else {
            panic!("requeue must apply under a live lease");
        };
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.run_at.unwrap(), run_at);
        assert_eq!(task.resource_keys, vec!["room:r1:search".to_string()]);
        assert!(task.lease_token.is_none());
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_with_a_fresh_token() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        let task = queue.enqueue(intent_request("req-1")).await.unwrap();

        // Simulate a worker that claimed and then went dark.
        let old_token = Uuid::new_v4();
        store
            .try_claim(task.id, old_token, Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap()
            .expect("claim");

        let claimed = queue.claim_local_scope(&claim_options(1)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let reclaimed = &claimed[0];
        assert!(reclaimed.reclaimed);
        assert_eq!(reclaimed.task.status, TaskStatus::Running);
        assert_ne!(reclaimed.task.lease_token.unwrap(), old_token);
        // attempt was charged at the original claim, not again on reclaim
        assert_eq!(reclaimed.task.attempt, 1);
    }

    #[tokio::test]
    async fn live_lease_is_not_stolen() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        let task = queue.enqueue(intent_request("req-1")).await.unwrap();

        store
            .try_claim(task.id, Uuid::new_v4(), Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .expect("claim");

        let claimed = queue.claim_local_scope(&claim_options(1)).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn scoped_tasks_only_claim_on_matching_workers() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        queue
            .enqueue(
                EnqueueRequest::builder()
                    .room("r1")
                    .task("canvas.followup")
                    .resource_keys(Some(vec!["scope:edge".to_string()]))
                    .build(),
            )
            .await
            .unwrap();

        let unscoped = queue.claim_local_scope(&claim_options(1)).await.unwrap();
        assert!(unscoped.is_empty());

        let scoped = queue
            .claim_local_scope(
                &ClaimOptions::builder()
                    .worker_id("worker-edge")
                    .runtime_scope(Some("edge".to_string()))
                    .limit(1)
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
    }

    #[tokio::test]
    async fn cancel_flips_queued_and_signals_running() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());

        let queued = queue.enqueue(intent_request("req-1")).await.unwrap();
        assert_eq!(queue.cancel(queued.id).await.unwrap(), CancelOutcome::Cancelled);

        let running = queue.enqueue(intent_request("req-2")).await.unwrap();
        store
            .try_claim(running.id, Uuid::new_v4(), Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(
            queue.cancel(running.id).await.unwrap(),
            CancelOutcome::RunningSignalNeeded
        );

        assert_eq!(
            queue.cancel(queued.id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
        assert_eq!(
            queue.cancel(Uuid::new_v4()).await.unwrap(),
            CancelOutcome::NotFound
        );
    }
}
