//! PostgreSQL-backed store adapter.
//!
//! All queue-safety derives from two database facts: the conditional
//! `UPDATE ... WHERE lease_token = $n` pattern, and the partial unique index
//! on in-flight `request_id`. Everything else is ordinary CRUD.
//!
//! Older databases are tolerated: a missing `trace_id` column or a missing
//! `agent_trace_events` table is reported as a schema-drift error and
//! reflected in [`SchemaFeatures`], never panicked on.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::schema::SchemaFeatures;
use super::{
    FinalizeOutcome, HeartbeatStore, InsertOutcome, OpsAuditEntry, OverviewStore, ProviderCount,
    StatusCount, StoreError, TaskStore, WorkerHeartbeat,
};
use crate::kernel::queue::task::{Task, TaskStatus};
use crate::kernel::replay::{BlobRow, ModelIoRow, ReplaySink, ToolIoRow, TraceEventRow};

const TASK_COLUMNS: &str = "id, room, task, params, status, priority, run_at, attempt, error, \
     request_id, trace_id, dedupe_key, resource_keys, lease_token, lease_expires_at, result, \
     created_at, updated_at";

pub struct PostgresStore {
    pool: PgPool,
    features: RwLock<SchemaFeatures>,
}

impl PostgresStore {
    /// Wrap a pool. Call [`TaskStore::refresh_features`] once at startup so
    /// the adapter knows what the connected schema actually has.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            features: RwLock::new(SchemaFeatures::full()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn cached_features(&self) -> SchemaFeatures {
        *self.features.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Column list for SELECT/RETURNING, substituting NULL when the
    /// database predates `trace_id`.
    fn task_columns(&self) -> String {
        if self.cached_features().has_trace_id_column {
            TASK_COLUMNS.to_string()
        } else {
            TASK_COLUMNS.replace("trace_id", "NULL::TEXT AS trace_id")
        }
    }
}

/// Map task-table errors. `42703` can only be `trace_id` here: it is the one
/// column the adapter treats as optional.
fn map_task_err(error: sqlx::Error) -> StoreError {
    map_err(error, "trace_id", "agent_tasks")
}

/// Map telemetry-table errors; the optional pieces are the `provider`
/// column and the `agent_trace_events` table itself.
fn map_trace_err(error: sqlx::Error) -> StoreError {
    map_err(error, "provider", "agent_trace_events")
}

fn map_err(
    error: sqlx::Error,
    missing_column: &'static str,
    missing_table: &'static str,
) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if let Some(code) = db.code() {
            match code.as_ref() {
                // unique_violation
                "23505" => return StoreError::Conflict,
                // undefined_column
                "42703" => return StoreError::MissingColumn(missing_column),
                // undefined_table
                "42P01" => return StoreError::MissingTable(missing_table),
                _ => {}
            }
        }
    }
    StoreError::Unavailable(error.into())
}

#[async_trait]
impl TaskStore for PostgresStore {
    fn features(&self) -> SchemaFeatures {
        self.cached_features()
    }

    async fn refresh_features(&self) -> Result<SchemaFeatures, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                EXISTS (
                    SELECT 1 FROM information_schema.columns
                    WHERE table_name = 'agent_tasks' AND column_name = 'trace_id'
                ) AS has_trace_id_column,
                EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_name = 'agent_trace_events'
                ) AS has_trace_events_table
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_task_err)?;

        let probed = SchemaFeatures {
            has_trace_id_column: row.get("has_trace_id_column"),
            has_trace_events_table: row.get("has_trace_events_table"),
        };
        *self.features.write().unwrap_or_else(|e| e.into_inner()) = probed;
        Ok(probed)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            "SELECT {} FROM agent_tasks WHERE id = $1",
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn insert_task(&self, task: Task) -> Result<InsertOutcome, StoreError> {
        let has_trace = self.cached_features().has_trace_id_column;
        let sql = if has_trace {
            format!(
                r#"
                INSERT INTO agent_tasks (
                    id, room, task, params, status, priority, run_at, attempt, error,
                    request_id, trace_id, dedupe_key, resource_keys, lease_token,
                    lease_expires_at, result, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                RETURNING {}
                "#,
                self.task_columns()
            )
        } else {
            format!(
                r#"
                INSERT INTO agent_tasks (
                    id, room, task, params, status, priority, run_at, attempt, error,
                    request_id, dedupe_key, resource_keys, lease_token,
                    lease_expires_at, result, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                RETURNING {}
                "#,
                self.task_columns()
            )
        };

        let mut query = sqlx::query_as::<_, Task>(&sql)
            .bind(task.id)
            .bind(&task.room)
            .bind(&task.task)
            .bind(&task.params)
            .bind(task.status)
            .bind(task.priority)
            .bind(task.run_at)
            .bind(task.attempt)
            .bind(&task.error)
            .bind(&task.request_id);
        if has_trace {
            query = query.bind(&task.trace_id);
        }
        let query = query
            .bind(&task.dedupe_key)
            .bind(&task.resource_keys)
            .bind(task.lease_token)
            .bind(task.lease_expires_at)
            .bind(&task.result)
            .bind(task.created_at)
            .bind(task.updated_at);

        match query.fetch_one(&self.pool).await {
            Ok(inserted) => Ok(InsertOutcome::Inserted(inserted)),
            Err(error) => match map_task_err(error) {
                StoreError::Conflict => Ok(InsertOutcome::Conflict),
                other => Err(other),
            },
        }
    }

    async fn find_in_flight_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM agent_tasks
            WHERE request_id = $1 AND status IN ('queued', 'running')
            LIMIT 1
            "#,
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn find_coalescable(
        &self,
        task: &str,
        room: &str,
        dedupe_key: Option<&str>,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM agent_tasks
            WHERE status = 'queued'
              AND task = $1
              AND room = $2
              AND ($3::TEXT IS NULL OR dedupe_key = $3)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(task)
            .bind(room)
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn update_queued_params(
        &self,
        id: Uuid,
        params: Value,
        trace_id: Option<String>,
    ) -> Result<Option<Task>, StoreError> {
        let has_trace = self.cached_features().has_trace_id_column;
        let sql = if has_trace {
            format!(
                r#"
                UPDATE agent_tasks
                SET params = $2,
                    trace_id = COALESCE($3, trace_id),
                    updated_at = NOW()
                WHERE id = $1 AND status = 'queued'
                RETURNING {}
                "#,
                self.task_columns()
            )
        } else {
            format!(
                r#"
                UPDATE agent_tasks
                SET params = $2,
                    updated_at = NOW()
                WHERE id = $1 AND status = 'queued'
                RETURNING {}
                "#,
                self.task_columns()
            )
        };

        let mut query = sqlx::query_as::<_, Task>(&sql).bind(id).bind(&params);
        if has_trace {
            query = query.bind(&trace_id);
        }
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        age_bonus_secs: i64,
        excluded_keys: &[String],
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM agent_tasks
            WHERE status = 'queued'
              AND lease_token IS NULL
              AND (run_at IS NULL OR run_at <= $1)
              AND NOT (resource_keys && $2)
            ORDER BY
                priority - FLOOR(EXTRACT(EPOCH FROM ($1 - created_at)) / $3)::INT ASC,
                created_at ASC
            LIMIT $4
            "#,
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(excluded_keys)
            .bind(age_bonus_secs.max(1))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            UPDATE agent_tasks
            SET status = 'running',
                lease_token = $2,
                lease_expires_at = $3,
                attempt = attempt + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued' AND lease_token IS NULL
            RETURNING {}
            "#,
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(lease_token)
            .bind(lease_expires_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM agent_tasks
            WHERE status = 'running' AND lease_expires_at <= $1
            ORDER BY lease_expires_at ASC
            LIMIT $2
            "#,
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn try_reclaim(
        &self,
        id: Uuid,
        old_token: Uuid,
        new_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            UPDATE agent_tasks
            SET lease_token = $3,
                lease_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            RETURNING {}
            "#,
            self.task_columns()
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(old_token)
            .bind(new_token)
            .bind(lease_expires_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_tasks
            SET lease_expires_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            "#,
        )
        .bind(id)
        .bind(lease_token)
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_task_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        lease_token: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError> {
        let sql = format!(
            r#"
            UPDATE agent_tasks
            SET status = $3,
                result = $4,
                error = COALESCE($5, error),
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            RETURNING {}
            "#,
            self.task_columns()
        );
        let updated = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(lease_token)
            .bind(status)
            .bind(&result)
            .bind(&error)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)?;

        Ok(match updated {
            Some(task) => FinalizeOutcome::Applied(task),
            None => FinalizeOutcome::LeaseLost,
        })
    }

    async fn requeue_task(
        &self,
        id: Uuid,
        lease_token: Uuid,
        run_at: Option<DateTime<Utc>>,
        resource_keys: Option<Vec<String>>,
        error: Option<String>,
    ) -> Result<FinalizeOutcome, StoreError> {
        let sql = format!(
            r#"
            UPDATE agent_tasks
            SET status = 'queued',
                lease_token = NULL,
                lease_expires_at = NULL,
                run_at = COALESCE($3, run_at),
                resource_keys = COALESCE($4, resource_keys),
                error = COALESCE($5, error),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            RETURNING {}
            "#,
            self.task_columns()
        );
        let updated = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(lease_token)
            .bind(run_at)
            .bind(&resource_keys)
            .bind(&error)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_task_err)?;

        Ok(match updated {
            Some(task) => FinalizeOutcome::Applied(task),
            None => FinalizeOutcome::LeaseLost,
        })
    }

    async fn cancel_queued(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_tasks
            SET status = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_task_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn running_resource_keys(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT UNNEST(resource_keys)
            FROM agent_tasks
            WHERE status = 'running'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_task_err)
    }

    async fn oldest_due_age_ms(&self, now: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let oldest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT MIN(created_at)
            FROM agent_tasks
            WHERE status = 'queued'
              AND lease_token IS NULL
              AND (run_at IS NULL OR run_at <= $1)
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_task_err)?;

        Ok(oldest.map(|created_at| (now - created_at).num_milliseconds()))
    }
}

#[async_trait]
impl HeartbeatStore for PostgresStore {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_worker_heartbeats (
                worker_id, host, pid, version, active_tasks, queue_lag_ms, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_id) DO UPDATE SET
                host = EXCLUDED.host,
                pid = EXCLUDED.pid,
                version = EXCLUDED.version,
                active_tasks = EXCLUDED.active_tasks,
                queue_lag_ms = EXCLUDED.queue_lag_ms,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&heartbeat.worker_id)
        .bind(&heartbeat.host)
        .bind(heartbeat.pid)
        .bind(&heartbeat.version)
        .bind(heartbeat.active_tasks)
        .bind(heartbeat.queue_lag_ms)
        .bind(heartbeat.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_task_err)?;

        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        sqlx::query_as::<_, WorkerHeartbeat>(
            r#"
            SELECT worker_id, host, pid, version, active_tasks, queue_lag_ms, updated_at
            FROM agent_worker_heartbeats
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_task_err)
    }
}

#[async_trait]
impl OverviewStore for PostgresStore {
    async fn count_tasks_by_status(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusCount>, StoreError> {
        sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT status, COUNT(*) AS count
            FROM agent_tasks
            WHERE updated_at >= $1
            GROUP BY status
            ORDER BY count DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_task_err)
    }

    async fn provider_mix(&self, since: DateTime<Utc>) -> Result<Vec<ProviderCount>, StoreError> {
        sqlx::query_as::<_, ProviderCount>(
            r#"
            SELECT COALESCE(provider, 'unknown') AS provider,
                   COUNT(*) AS count,
                   COUNT(*) FILTER (WHERE error IS NOT NULL OR status = 'error') AS failures
            FROM agent_trace_events
            WHERE created_at >= $1
            GROUP BY 1
            ORDER BY count DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_trace_err)
    }

    async fn append_ops_audit(&self, entry: &OpsAuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_ops_audit_log (id, actor, action, task_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(entry.task_id)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_task_err)?;

        Ok(())
    }
}

#[async_trait]
impl ReplaySink for PostgresStore {
    async fn upsert_trace_events(&self, rows: &[TraceEventRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO agent_trace_events (event_id, task_id, trace_id, request_id, intent_id, \
             source, event_type, status, provider, model, provider_source, provider_path, \
             provider_request_id, input_payload, output_payload, metadata, error, created_at, \
             expires_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.event_id.clone())
                .push_bind(row.task_id)
                .push_bind(row.trace_id.clone())
                .push_bind(row.request_id.clone())
                .push_bind(row.intent_id.clone())
                .push_bind(row.source.clone())
                .push_bind(row.event_type.clone())
                .push_bind(row.status.clone())
                .push_bind(row.provider.clone())
                .push_bind(row.model.clone())
                .push_bind(row.provider_source.clone())
                .push_bind(row.provider_path.clone())
                .push_bind(row.provider_request_id.clone())
                .push_bind(row.input_payload.clone())
                .push_bind(row.output_payload.clone())
                .push_bind(row.metadata.clone())
                .push_bind(row.error.clone())
                .push_bind(row.created_at)
                .push_bind(row.expires_at);
        });
        builder.push(" ON CONFLICT (event_id) DO NOTHING");
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_trace_err)?;
        Ok(())
    }

    async fn upsert_model_io(&self, rows: &[ModelIoRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO agent_model_io (event_id, task_id, trace_id, request_id, intent_id, \
             status, provider, model, provider_source, provider_path, provider_request_id, \
             input_payload, output_payload, metadata, error, latency_ms, prompt_tokens, \
             completion_tokens, created_at, expires_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.event_id.clone())
                .push_bind(row.task_id)
                .push_bind(row.trace_id.clone())
                .push_bind(row.request_id.clone())
                .push_bind(row.intent_id.clone())
                .push_bind(row.status.clone())
                .push_bind(row.provider.clone())
                .push_bind(row.model.clone())
                .push_bind(row.provider_source.clone())
                .push_bind(row.provider_path.clone())
                .push_bind(row.provider_request_id.clone())
                .push_bind(row.input_payload.clone())
                .push_bind(row.output_payload.clone())
                .push_bind(row.metadata.clone())
                .push_bind(row.error.clone())
                .push_bind(row.latency_ms)
                .push_bind(row.prompt_tokens)
                .push_bind(row.completion_tokens)
                .push_bind(row.created_at)
                .push_bind(row.expires_at);
        });
        builder.push(" ON CONFLICT (event_id) DO NOTHING");
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_trace_err)?;
        Ok(())
    }

    async fn upsert_tool_io(&self, rows: &[ToolIoRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO agent_tool_io (event_id, task_id, trace_id, request_id, intent_id, \
             status, tool_name, input_payload, output_payload, metadata, error, duration_ms, \
             created_at, expires_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.event_id.clone())
                .push_bind(row.task_id)
                .push_bind(row.trace_id.clone())
                .push_bind(row.request_id.clone())
                .push_bind(row.intent_id.clone())
                .push_bind(row.status.clone())
                .push_bind(row.tool_name.clone())
                .push_bind(row.input_payload.clone())
                .push_bind(row.output_payload.clone())
                .push_bind(row.metadata.clone())
                .push_bind(row.error.clone())
                .push_bind(row.duration_ms)
                .push_bind(row.created_at)
                .push_bind(row.expires_at);
        });
        builder.push(" ON CONFLICT (event_id) DO NOTHING");
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_trace_err)?;
        Ok(())
    }

    async fn upsert_blobs(&self, rows: &[BlobRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO agent_io_blobs (event_id, kind, payload, sha256, size_bytes, truncated, \
             created_at, expires_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.event_id.clone())
                .push_bind(row.kind.as_str())
                .push_bind(row.payload.clone())
                .push_bind(row.sha256.clone())
                .push_bind(row.size_bytes)
                .push_bind(row.truncated)
                .push_bind(row.created_at)
                .push_bind(row.expires_at);
        });
        builder.push(" ON CONFLICT (event_id, kind) DO NOTHING");
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_trace_err)?;
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut deleted = 0u64;
        for table in [
            "agent_trace_events",
            "agent_model_io",
            "agent_tool_io",
            "agent_io_blobs",
        ] {
            let sql = format!("DELETE FROM {} WHERE expires_at < $1", table);
            match sqlx::query(&sql).bind(now).execute(&self.pool).await {
                Ok(result) => deleted += result.rows_affected(),
                // Older databases without the telemetry tables sweep nothing.
                Err(error) => match map_trace_err(error) {
                    StoreError::MissingTable(_) => continue,
                    other => return Err(other),
                },
            }
        }
        Ok(deleted)
    }
}
