//! Enqueue request shapes and the coalescing policy.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::common::envelope::Envelope;
use crate::kernel::store::StoreError;

/// Enqueue failures surfaced synchronously to the caller; the task is not
/// created for the first two.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("TRACE_ID_REQUIRED:{0}")]
    TraceIdRequired(String),
    #[error("TRACE_ID_COLUMN_REQUIRED:{0}")]
    TraceIdColumnRequired(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inputs to [`TaskQueue::enqueue`](super::TaskQueue::enqueue).
///
/// The envelope is merged into `params` before persistence and mirrored into
/// the indexed correlation columns.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EnqueueRequest {
    #[builder(setter(into))]
    pub room: String,
    #[builder(setter(into))]
    pub task: String,
    #[builder(default = Value::Null)]
    pub params: Value,
    #[builder(default)]
    pub envelope: Envelope,
    #[builder(default)]
    pub request_id: Option<String>,
    #[builder(default)]
    pub dedupe_key: Option<String>,
    #[builder(default)]
    pub resource_keys: Option<Vec<String>>,
    #[builder(default)]
    pub priority: Option<i32>,
    #[builder(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub require_trace_id: bool,
}

impl EnqueueRequest {
    /// The request id governing dedupe: an explicit one wins over the
    /// envelope's.
    pub fn effective_request_id(&self) -> Option<String> {
        self.request_id
            .clone()
            .or_else(|| self.envelope.request_id.clone())
    }

    /// Trace id derived from the envelope or a bare `traceId` in params.
    pub fn effective_trace_id(&self) -> Option<String> {
        self.envelope.trace_id.clone().or_else(|| {
            self.params
                .get("traceId")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

/// Which task families coalesce at enqueue.
///
/// Registered at queue construction rather than hard-coded: the canvas
/// prompt stream folds rapid-fire re-prompts into one queued row, while
/// intent dispatches must each run.
#[derive(Debug, Clone, Default)]
pub struct CoalescePolicy {
    tasks: HashSet<String>,
}

impl CoalescePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The product's default set.
    pub fn standard() -> Self {
        let mut policy = Self::new();
        policy.register("canvas.agent_prompt");
        policy
    }

    pub fn register(&mut self, task: impl Into<String>) -> &mut Self {
        self.tasks.insert(task.into());
        self
    }

    pub fn coalesces(&self, task: &str) -> bool {
        self.tasks.contains(task)
    }
}

/// Shallow merge for coalesced params: the newer caller's keys win, which
/// also carries its envelope over.
pub(super) fn merge_params(existing: &Value, newer: &Value) -> Value {
    match (existing, newer) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => newer.clone(),
    }
}
