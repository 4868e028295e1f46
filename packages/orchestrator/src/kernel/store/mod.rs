//! Store adapters for the durable queue.
//!
//! The queue core talks to storage through the seam traits in this module:
//! - [`TaskStore`] - typed CRUD with optimistic-concurrency primitives
//! - [`HeartbeatStore`] - worker liveness rows
//! - [`OverviewStore`] - derived read models and the ops audit log
//!
//! Adapters return distinguished outcomes (`InsertOutcome::Conflict`,
//! [`FinalizeOutcome::LeaseLost`]) instead of raising, so the queue treats
//! contention as a signal rather than an exception. Schema drift (an older
//! database missing `trace_id` or the trace-events table) is surfaced as
//! [`SchemaFeatures`] flags, probed at startup and re-probed whenever the
//! store reports a schema error.

mod memory;
mod postgres;
mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use schema::SchemaFeatures;

use super::queue::task::{Task, TaskStatus};

/// Storage-level failures, partitioned so callers can pattern-match.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (duplicate request_id).
    #[error("duplicate key")]
    Conflict,
    /// The database predates a column this build knows about.
    #[error("column {0} does not exist")]
    MissingColumn(&'static str),
    /// The database predates a table this build knows about.
    #[error("table {0} does not exist")]
    MissingTable(&'static str),
    /// Transient storage failure; retry at the caller's discretion.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl StoreError {
    /// Schema-drift errors: the caller should re-probe features and degrade.
    pub fn is_schema_drift(&self) -> bool {
        matches!(self, StoreError::MissingColumn(_) | StoreError::MissingTable(_))
    }
}

/// Result of an insert attempt.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Task),
    /// The uniqueness constraint on in-flight `request_id` fired.
    Conflict,
}

/// Result of a lease-conditioned write.
#[derive(Debug)]
pub enum FinalizeOutcome {
    Applied(Task),
    /// The lease token no longer matches; the caller forfeited the task.
    LeaseLost,
}

impl FinalizeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, FinalizeOutcome::Applied(_))
    }
}

/// Typed CRUD over `agent_tasks` with row-level claim primitives.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Current schema feature flags (cheap, cached).
    fn features(&self) -> SchemaFeatures;

    /// Re-probe the schema; called at startup and after schema errors.
    async fn refresh_features(&self) -> Result<SchemaFeatures, StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Insert a queued row. `Conflict` means the in-flight request-id
    /// uniqueness constraint fired.
    async fn insert_task(&self, task: Task) -> Result<InsertOutcome, StoreError>;

    /// Any `{queued, running}` row carrying this request id.
    async fn find_in_flight_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// The most recent queued row matching `(task, room)` and, when given,
    /// `dedupe_key`; used by the coalescing path.
    async fn find_coalescable(
        &self,
        task: &str,
        room: &str,
        dedupe_key: Option<&str>,
    ) -> Result<Option<Task>, StoreError>;

    /// Overwrite `params` (and mirrored trace id) of a still-queued row.
    /// Returns `None` when the row was claimed or finalized in the meantime.
    async fn update_queued_params(
        &self,
        id: Uuid,
        params: Value,
        trace_id: Option<String>,
    ) -> Result<Option<Task>, StoreError>;

    /// Due queued rows ordered by aged priority then FIFO, excluding rows
    /// whose resource keys intersect `excluded_keys`.
    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        age_bonus_secs: i64,
        excluded_keys: &[String],
    ) -> Result<Vec<Task>, StoreError>;

    /// queued -> running, conditioned on `status='queued' AND lease_token IS
    /// NULL`. Bumps `attempt`. `None` means another claimant won the race.
    async fn try_claim(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Running rows whose lease expired at or before `now`.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError>;

    /// Re-lease a stale running row under a new token, conditioned on the
    /// old token still matching (a live renewal must not be stolen).
    /// `attempt` is untouched: it was already charged at the original claim.
    async fn try_reclaim(
        &self,
        id: Uuid,
        old_token: Uuid,
        new_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Extend a live lease. `false` means the lease was lost.
    async fn renew_lease(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Terminal finalize conditioned on `(id, lease_token)`. Clears the
    /// lease. `error = None` retains any previous error text.
    async fn complete_task(
        &self,
        id: Uuid,
        lease_token: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// running -> queued conditioned on `(id, lease_token)`. Overwrites
    /// `run_at` / `resource_keys` when supplied and records `error` when the
    /// requeue models a failed attempt; `attempt` is not incremented.
    async fn requeue_task(
        &self,
        id: Uuid,
        lease_token: Uuid,
        run_at: Option<DateTime<Utc>>,
        resource_keys: Option<Vec<String>>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// Cancel a queued row directly (running rows cancel cooperatively).
    async fn cancel_queued(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Resource keys currently held by running rows.
    async fn running_resource_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Age in ms of the oldest due queued row, for heartbeat queue lag.
    async fn oldest_due_age_ms(&self, now: DateTime<Utc>) -> Result<Option<i64>, StoreError>;
}

/// One row of `agent_worker_heartbeats`.
#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub host: String,
    pub pid: i32,
    pub version: String,
    pub active_tasks: i32,
    pub queue_lag_ms: i64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError>;
    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError>;
}

/// Count of tasks per status inside the overview window.
#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct StatusCount {
    pub status: TaskStatus,
    pub count: i64,
}

/// Provider traffic and failures over the overview window.
#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct ProviderCount {
    pub provider: String,
    pub count: i64,
    pub failures: i64,
}

/// One row of `agent_ops_audit_log`: who did what to which task.
#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct OpsAuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub task_id: Option<Uuid>,
    pub detail: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl OpsAuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        task_id: Option<Uuid>,
        detail: Option<Value>,
    ) -> Self {
        Self {
            id: crate::common::ids::db_id(),
            actor: actor.into(),
            action: action.into(),
            task_id,
            detail,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait OverviewStore: Send + Sync {
    async fn count_tasks_by_status(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusCount>, StoreError>;

    /// Provider mix from `agent_trace_events`; may report `MissingTable` /
    /// `MissingColumn` on older databases, which the overview degrades.
    async fn provider_mix(&self, since: DateTime<Utc>) -> Result<Vec<ProviderCount>, StoreError>;

    async fn append_ops_audit(&self, entry: &OpsAuditEntry) -> Result<(), StoreError>;
}
