//! Worker runtime: claim, dispatch, renew, finalize.
//!
//! ```text
//! WorkerRuntime
//!     │
//!     ├─► claim_local_scope (lease + arbiter + stale-lease sweep)
//!     ├─► StewardRegistry.execute(task, ctx)
//!     │       ├─ lease renewal every lease_ttl / 3
//!     │       ├─ cooperative CancellationToken
//!     │       └─ outer deadline = min(lease_ttl - renew_margin, soft cap)
//!     └─► finalize: complete / requeue-with-backoff / abandon on lease loss
//! ```
//!
//! A worker that loses its lease mid-execution abandons the task without
//! finalizing; exclusivity comes from the lease token, so another worker may
//! already be re-running it.

pub mod heartbeat;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::envelope::Envelope;
use crate::kernel::budget::SearchBudget;
use crate::kernel::followup::FollowupScheduler;
use crate::kernel::queue::{CancelOutcome, ClaimOptions, ClaimedTask, Task, TaskQueue, TaskStatus};
use crate::kernel::replay::{EventParent, ReplayRecorder, ToolIo};
use crate::kernel::store::{FinalizeOutcome, HeartbeatStore, StoreError};

use heartbeat::HeartbeatEmitter;
use registry::{StewardContext, StewardError, StewardRegistry};

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Execution slots; handlers run concurrently up to this budget.
    pub concurrency: usize,
    pub lease_ttl: Duration,
    /// Headroom subtracted from the lease for the outer deadline.
    pub renew_margin: Duration,
    /// Per-task soft cap on handler wall time.
    pub soft_cap: Duration,
    /// Idle sleep between empty claim passes.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_attempts: i32,
    pub runtime_scope: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 4,
            lease_ttl: Duration::from_secs(60),
            renew_margin: Duration::from_secs(5),
            soft_cap: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            max_attempts: 5,
            runtime_scope: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    fn handler_deadline(&self) -> Duration {
        self.lease_ttl
            .saturating_sub(self.renew_margin)
            .min(self.soft_cap)
    }
}

/// Cancellation signals for running tasks, shared with the HTTP surface so
/// `POST /tasks/:id/cancel` can reach a handler mid-flight.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid, token: CancellationToken) {
        self.tokens.write().await.insert(id, token);
    }

    pub async fn remove(&self, id: Uuid) {
        self.tokens.write().await.remove(&id);
    }

    /// Signal a running task; true when a live token was found.
    pub async fn signal(&self, id: Uuid) -> bool {
        match self.tokens.read().await.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

pub struct WorkerRuntime {
    queue: Arc<TaskQueue>,
    registry: Arc<StewardRegistry>,
    heartbeats: Arc<dyn HeartbeatStore>,
    replay: ReplayRecorder,
    followups: Arc<FollowupScheduler>,
    budget: Arc<SearchBudget>,
    cancels: Arc<CancelRegistry>,
    config: WorkerConfig,
    active: Arc<AtomicUsize>,
}

impl WorkerRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<StewardRegistry>,
        heartbeats: Arc<dyn HeartbeatStore>,
        replay: ReplayRecorder,
        followups: Arc<FollowupScheduler>,
        budget: Arc<SearchBudget>,
        cancels: Arc<CancelRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            heartbeats,
            replay,
            followups,
            budget,
            cancels,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Cancel a task: queued rows flip in the store, running ones get the
    /// cooperative signal.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let outcome = self.queue.cancel(id).await?;
        if outcome == CancelOutcome::RunningSignalNeeded {
            self.cancels.signal(id).await;
        }
        Ok(outcome)
    }

    /// Run until `shutdown` fires, then drain running handlers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let this = Arc::new(self);
        info!(
            worker_id = %this.config.worker_id,
            concurrency = this.config.concurrency,
            lease_ttl_ms = this.config.lease_ttl.as_millis() as u64,
            "worker runtime starting"
        );

        let emitter = HeartbeatEmitter::new(
            Arc::clone(&this.heartbeats),
            Arc::clone(this.queue.store()),
            this.config.worker_id.clone(),
            this.config.heartbeat_interval,
            Arc::clone(&this.active),
        );
        let heartbeat_handle = tokio::spawn(emitter.run(shutdown.clone()));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let free = this
                .config
                .concurrency
                .saturating_sub(this.active.load(Ordering::SeqCst));
            if free == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }

            let options = ClaimOptions::builder()
                .worker_id(this.config.worker_id.clone())
                .runtime_scope(this.config.runtime_scope.clone())
                .limit(free as i64)
                .lease_ttl(this.config.lease_ttl)
                .build();

            let claimed = match this.queue.claim_local_scope(&options).await {
                Ok(claimed) => claimed,
                Err(error) => {
                    error!(%error, "claim pass failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = claimed.len(), "claimed tasks");
            for task in claimed {
                this.active.fetch_add(1, Ordering::SeqCst);
                let runner = Arc::clone(&this);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    runner.process_task(task, shutdown).await;
                });
            }
        }

        // Drain: signal every running handler, then wait bounded.
        let draining = this.active.load(Ordering::SeqCst);
        if draining > 0 {
            info!(count = draining, "waiting for running tasks to finish");
            let deadline = Instant::now() + Duration::from_secs(30);
            while this.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        let _ = heartbeat_handle.await;
        info!(worker_id = %this.config.worker_id, "worker runtime stopped");
        Ok(())
    }

    async fn process_task(self: Arc<Self>, claimed: ClaimedTask, shutdown: CancellationToken) {
        let ClaimedTask { task, grant, .. } = claimed;
        let Some(lease_token) = task.lease_token else {
            // A claim without a lease cannot be finalized; give the keys back.
            error!(task_id = %task.id, "claimed task is missing its lease token");
            self.queue.release(grant);
            self.active.fetch_sub(1, Ordering::SeqCst);
            return;
        };

        let token = shutdown.child_token();
        self.cancels.register(task.id, token.clone()).await;

        let envelope = Envelope::from_params(&task.params);
        let parent = EventParent {
            task_id: Some(task.id),
            trace_id: task.trace_id.clone().or_else(|| envelope.trace_id.clone()),
            request_id: task.request_id.clone().or_else(|| envelope.request_id.clone()),
            intent_id: envelope.intent_id.clone(),
        };

        // Independent renewal timer; a rejected renewal marks the lease lost
        // and cancels the handler.
        let lease_lost = Arc::new(AtomicBool::new(false));
        let renewal = {
            let store = Arc::clone(self.queue.store());
            let lease_lost = Arc::clone(&lease_lost);
            let token = token.clone();
            let lease_ttl = self.config.lease_ttl;
            let task_id = task.id;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(lease_ttl / 3);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let expires = Utc::now()
                                + chrono::Duration::from_std(lease_ttl)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                            match store.renew_lease(task_id, lease_token, expires).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    lease_lost.store(true, Ordering::SeqCst);
                                    token.cancel();
                                    break;
                                }
                                Err(error) => {
                                    // Transient; the lease may still expire and
                                    // be reclaimed, which is the safe outcome.
                                    warn!(task_id = %task_id, %error, "lease renewal errored");
                                }
                            }
                        }
                    }
                }
            })
        };

        let ctx = StewardContext {
            task: task.clone(),
            envelope,
            cancel: token.clone(),
            replay: self.replay.scope(parent.clone()),
            followups: Arc::clone(&self.followups),
            budget: Arc::clone(&self.budget),
        };

        let deadline = self.config.handler_deadline();
        let started = Instant::now();
        let outcome = tokio::select! {
            result = self.registry.execute(&task, ctx) => result,
            _ = token.cancelled() => Err(StewardError::Cancelled),
            _ = tokio::time::sleep(deadline) => {
                token.cancel();
                Err(StewardError::transient(anyhow!(
                    "handler deadline exceeded after {:?}",
                    deadline
                )))
            }
        };

        token.cancel();
        let _ = renewal.await;

        if lease_lost.load(Ordering::SeqCst) {
            // Another worker may already own the task; abandon quietly.
            warn!(task_id = %task.id, task = %task.task, "lease lost mid-execution, abandoning");
        } else {
            self.finalize(&task, lease_token, outcome, &parent, started, &shutdown)
                .await;
        }

        self.cancels.remove(task.id).await;
        self.queue.release(grant);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn finalize(
        &self,
        task: &Task,
        lease_token: Uuid,
        outcome: Result<registry::StewardOutcome, StewardError>,
        parent: &EventParent,
        started: Instant,
        shutdown: &CancellationToken,
    ) {
        let duration_ms = started.elapsed().as_millis() as i64;
        let (finalize, status_label, error_label) = match outcome {
            Ok(outcome) => {
                let warnings = if outcome.warnings.is_empty() {
                    None
                } else {
                    Some(outcome.warnings.join("; "))
                };
                info!(task_id = %task.id, task = %task.task, duration_ms, "task succeeded");
                (
                    self.queue
                        .complete(
                            task.id,
                            lease_token,
                            TaskStatus::Succeeded,
                            outcome.result,
                            warnings,
                        )
                        .await,
                    "succeeded",
                    None,
                )
            }
            Err(StewardError::Cancelled) if shutdown.is_cancelled() => {
                // Graceful shutdown is a yield, not a cancellation.
                info!(task_id = %task.id, task = %task.task, "requeueing task for shutdown");
                (
                    self.queue.requeue(task.id, lease_token, None, None).await,
                    "requeued",
                    None,
                )
            }
            Err(StewardError::Cancelled) => {
                info!(task_id = %task.id, task = %task.task, "task cancelled");
                (
                    self.queue
                        .complete(
                            task.id,
                            lease_token,
                            TaskStatus::Cancelled,
                            None,
                            Some("cancelled".to_string()),
                        )
                        .await,
                    "cancelled",
                    Some("cancelled".to_string()),
                )
            }
            Err(StewardError::Fatal(error)) => {
                warn!(task_id = %task.id, task = %task.task, error = %error, "task failed (fatal)");
                let message = error.to_string();
                (
                    self.queue
                        .complete(
                            task.id,
                            lease_token,
                            TaskStatus::Failed,
                            None,
                            Some(message.clone()),
                        )
                        .await,
                    "failed",
                    Some(message),
                )
            }
            Err(StewardError::Transient { source, retry_after }) => {
                let message = source.to_string();
                if task.attempt >= self.config.max_attempts {
                    warn!(
                        task_id = %task.id,
                        task = %task.task,
                        attempt = task.attempt,
                        error = %message,
                        "task failed (attempts exhausted)"
                    );
                    let final_message = format!(
                        "max attempts ({}) exhausted: {}",
                        self.config.max_attempts, message
                    );
                    (
                        self.queue
                            .complete(
                                task.id,
                                lease_token,
                                TaskStatus::Failed,
                                None,
                                Some(final_message.clone()),
                            )
                            .await,
                        "failed",
                        Some(final_message),
                    )
                } else {
                    warn!(
                        task_id = %task.id,
                        task = %task.task,
                        attempt = task.attempt,
                        error = %message,
                        "task failed, backing off"
                    );
                    (
                        self.queue
                            .fail_with_backoff(task, lease_token, message.clone(), retry_after)
                            .await,
                        "backoff",
                        Some(message),
                    )
                }
            }
        };

        match finalize {
            Ok(FinalizeOutcome::Applied(_)) => {}
            Ok(FinalizeOutcome::LeaseLost) => {
                debug!(task_id = %task.id, "finalize lost the lease race");
                return;
            }
            Err(error) => {
                error!(task_id = %task.id, %error, "finalize write failed");
                return;
            }
        }

        // Worker-side telemetry at the finalize seam.
        let scope = self.replay.scope(parent.clone());
        scope.tool_io(
            ToolIo::builder()
                .event_type("task_finalize")
                .tool_name(task.task.clone())
                .status(status_label)
                .metadata(json!({
                    "attempt": task.attempt,
                    "duration_ms": duration_ms,
                    "worker_id": self.config.worker_id,
                }))
                .error(error_label)
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplayConfig;
    use crate::kernel::followup::FollowupSpec;
    use crate::kernel::queue::{CoalescePolicy, EnqueueRequest, QueueConfig};
    use crate::kernel::store::{MemoryStore, TaskStore};
    use registry::StewardOutcome;
    use serde_json::Value;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<TaskQueue>,
        runtime: Arc<WorkerRuntime>,
    }

    fn harness(registry: StewardRegistry, config: WorkerConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            CoalescePolicy::standard(),
            QueueConfig::default(),
        ));
        let followups = Arc::new(FollowupScheduler::new(
            Arc::clone(&queue),
            Default::default(),
        ));
        let runtime = Arc::new(WorkerRuntime::new(
            Arc::clone(&queue),
            Arc::new(registry),
            store.clone(),
            ReplayRecorder::new(ReplayConfig::default()),
            followups,
            Arc::new(SearchBudget::unlimited()),
            Arc::new(CancelRegistry::new()),
            config,
        ));
        Harness {
            store,
            queue,
            runtime,
        }
    }

    async fn enqueue_and_claim(harness: &Harness, task: &str, request_id: &str) -> ClaimedTask {
        harness
            .queue
            .enqueue(
                EnqueueRequest::builder()
                    .room("r1")
                    .task(task)
                    .params(serde_json::json!({"message": "go"}))
                    .request_id(Some(request_id.to_string()))
                    .build(),
            )
            .await
            .unwrap();
        let mut claimed = harness
            .queue
            .claim_local_scope(
                &ClaimOptions::builder()
                    .worker_id("worker-test")
                    .limit(1)
                    .build(),
            )
            .await
            .unwrap();
        claimed.remove(0)
    }

    #[tokio::test]
    async fn successful_handler_finalizes_succeeded() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("canvas.agent_prompt", |_params, _ctx| async move {
            Ok(StewardOutcome::with_result(serde_json::json!({"drawn": true})))
        });
        let harness = harness(registry, WorkerConfig::with_worker_id("w1"));

        let claimed = enqueue_and_claim(&harness, "canvas.agent_prompt", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result.unwrap()["drawn"], true);
        assert!(task.lease_token.is_none());
    }

    #[tokio::test]
    async fn warnings_are_retained_on_success() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("canvas.agent_prompt", |_params, _ctx| async move {
            Ok(StewardOutcome::ok().warn("shape snapped to grid"))
        });
        let harness = harness(registry, WorkerConfig::with_worker_id("w1"));

        let claimed = enqueue_and_claim(&harness, "canvas.agent_prompt", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.error.as_deref(), Some("shape snapped to grid"));
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("search.general", |_params, _ctx| async move {
            Err::<StewardOutcome, _>(StewardError::transient(anyhow!("upstream 503")))
        });
        let harness = harness(registry, WorkerConfig::with_worker_id("w1"));

        let claimed = enqueue_and_claim(&harness, "search.general", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 1);
        assert!(task.run_at.unwrap() > Utc::now());
        assert_eq!(task.error.as_deref(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn transient_failure_past_max_attempts_fails() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("search.general", |_params, _ctx| async move {
            Err::<StewardOutcome, _>(StewardError::transient(anyhow!("still down")))
        });
        let mut config = WorkerConfig::with_worker_id("w1");
        config.max_attempts = 1;
        let harness = harness(registry, config);

        let claimed = enqueue_and_claim(&harness, "search.general", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("max attempts"));
    }

    #[tokio::test]
    async fn fatal_failure_does_not_retry() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("scorecard.run", |_params, _ctx| async move {
            Err::<StewardOutcome, _>(StewardError::fatal(anyhow!("malformed target")))
        });
        let harness = harness(registry, WorkerConfig::with_worker_id("w1"));

        let claimed = enqueue_and_claim(&harness, "scorecard.run", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("malformed target"));
    }

    #[tokio::test]
    async fn cancel_signal_finalizes_cancelled() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("canvas.agent_prompt", |_params, ctx| async move {
            ctx.cancel.cancelled().await;
            Err::<StewardOutcome, _>(StewardError::Cancelled)
        });
        let harness = harness(registry, WorkerConfig::with_worker_id("w1"));

        let claimed = enqueue_and_claim(&harness, "canvas.agent_prompt", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);

        let runtime = Arc::clone(&harness.runtime);
        let handle = tokio::spawn(runtime.process_task(claimed, CancellationToken::new()));

        // Wait for the handler to register, then deliver the signal.
        for _ in 0..100 {
            if harness.runtime.cancels.active_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(harness.runtime.cancels.signal(id).await);
        handle.await.unwrap();

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn handler_followups_land_in_the_queue() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("canvas.agent_prompt", |_params, ctx| async move {
            let accepted = ctx
                .followups
                .enqueue_followup(
                    &ctx.task,
                    FollowupSpec::builder().message("refine the corners").build(),
                )
                .await
                .map_err(StewardError::fatal)?;
            assert!(accepted);
            Ok(StewardOutcome::ok())
        });
        let harness = harness(registry, WorkerConfig::with_worker_id("w1"));

        let claimed = enqueue_and_claim(&harness, "canvas.agent_prompt", "req-1").await;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let queued = harness.store.tasks_with_status(TaskStatus::Queued);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].task, "canvas.followup");
    }

    #[tokio::test]
    async fn deadline_overrun_backs_off() {
        let mut registry = StewardRegistry::new();
        registry.register::<Value, _, _>("canvas.agent_prompt", |_params, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StewardOutcome::ok())
        });
        let mut config = WorkerConfig::with_worker_id("w1");
        config.lease_ttl = Duration::from_millis(400);
        config.renew_margin = Duration::from_millis(200);
        config.soft_cap = Duration::from_millis(200);
        let harness = harness(registry, config);

        let claimed = enqueue_and_claim(&harness, "canvas.agent_prompt", "req-1").await;
        let id = claimed.task.id;
        harness.runtime.active.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&harness.runtime)
            .process_task(claimed, CancellationToken::new())
            .await;

        let task = harness.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.error.unwrap().contains("deadline"));
    }
}
