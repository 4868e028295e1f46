//! Task model for the durable agent queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::ids::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "agent_task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are immutable once committed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Queued or running: counts against in-flight request-id uniqueness.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

/// One row of `agent_tasks`.
///
/// `params` and `result` are opaque JSON; the queue core only reads the
/// correlation envelope mirrored into the indexed columns.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub room: String,
    pub task: String,
    pub params: Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub run_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub error: Option<String>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub resource_keys: Vec<String>,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Default priority for tasks that do not ask for anything special.
/// Lower claims first.
pub const DEFAULT_PRIORITY: i32 = 100;

impl Task {
    /// Build a fresh queued row.
    #[allow(clippy::too_many_arguments)]
    pub fn queued(
        room: impl Into<String>,
        task: impl Into<String>,
        params: Value,
        request_id: Option<String>,
        trace_id: Option<String>,
        dedupe_key: Option<String>,
        resource_keys: Vec<String>,
        priority: i32,
        run_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: db_id(),
            room: room.into(),
            task: task.into(),
            params,
            status: TaskStatus::Queued,
            priority,
            run_at,
            attempt: 0,
            error: None,
            request_id,
            trace_id,
            dedupe_key,
            resource_keys,
            lease_token: None,
            lease_expires_at: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the row is eligible for claiming at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued
            && self.lease_token.is_none()
            && self.run_at.map_or(true, |run_at| run_at <= now)
    }

    /// Priority with the starvation-ageing bonus applied; lower claims first.
    pub fn effective_priority(&self, now: DateTime<Utc>, age_bonus_secs: i64) -> i64 {
        let age_secs = (now - self.created_at).num_seconds().max(0);
        self.priority as i64 - age_secs / age_bonus_secs.max(1)
    }

    /// Dotted task-family prefix (`canvas.agent_prompt` -> `canvas`).
    pub fn family(&self) -> &str {
        self.task.split('.').next().unwrap_or(&self.task)
    }
}
