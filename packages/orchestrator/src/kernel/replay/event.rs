//! Replay event model: deterministic ids, inline truncation, blob sidecars.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ReplayConfig;

/// Correlation anchors of a captured event.
#[derive(Debug, Clone, Default)]
pub struct EventParent {
    pub task_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub intent_id: Option<String>,
}

impl EventParent {
    /// The id component the deterministic event id hangs off: task first,
    /// then request, then trace.
    pub fn anchor(&self) -> String {
        if let Some(task_id) = self.task_id {
            return task_id.to_string();
        }
        if let Some(request_id) = &self.request_id {
            return request_id.clone();
        }
        if let Some(trace_id) = &self.trace_id {
            return trace_id.clone();
        }
        "unparented".to_string()
    }
}

/// Deterministic event id: parent anchor + type + status + sequence.
/// Replays of the same capture collide on upsert instead of duplicating.
pub fn compose_event_id(parent: &EventParent, event_type: &str, status: &str, seq: u32) -> String {
    format!("{}:{}:{}:{}", parent.anchor(), event_type, status, seq)
}

/// Common-shape row destined for `agent_trace_events`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEventRow {
    pub event_id: String,
    pub task_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub intent_id: Option<String>,
    pub source: String,
    pub event_type: String,
    pub status: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub provider_source: Option<String>,
    pub provider_path: Option<String>,
    pub provider_request_id: Option<String>,
    pub input_payload: Option<Value>,
    pub output_payload: Option<Value>,
    pub metadata: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Stream row destined for `agent_model_io`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelIoRow {
    pub event_id: String,
    pub task_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub intent_id: Option<String>,
    pub status: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub provider_source: Option<String>,
    pub provider_path: Option<String>,
    pub provider_request_id: Option<String>,
    pub input_payload: Option<Value>,
    pub output_payload: Option<Value>,
    pub metadata: Option<Value>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Stream row destined for `agent_tool_io`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolIoRow {
    pub event_id: String,
    pub task_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub intent_id: Option<String>,
    pub status: String,
    pub tool_name: String,
    pub input_payload: Option<Value>,
    pub output_payload: Option<Value>,
    pub metadata: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Input,
    Output,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Input => "input",
            BlobKind::Output => "output",
        }
    }
}

/// Sidecar row destined for `agent_io_blobs`. Shares `event_id` with its
/// parent so pre-issued ids line up without a store round-trip.
#[derive(Debug, Clone, Serialize)]
pub struct BlobRow {
    pub event_id: String,
    pub kind: BlobKind,
    pub payload: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Inline representation of a payload after the size policy is applied.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub inline: Value,
    pub blob: Option<BlobSpec>,
}

/// Blob content before it is stamped with an event id.
#[derive(Debug, Clone)]
pub struct BlobSpec {
    pub payload: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub truncated: bool,
}

impl BlobSpec {
    pub fn into_row(
        self,
        event_id: &str,
        kind: BlobKind,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> BlobRow {
        BlobRow {
            event_id: event_id.to_string(),
            kind,
            payload: self.payload,
            sha256: self.sha256,
            size_bytes: self.size_bytes,
            truncated: self.truncated,
            created_at,
            expires_at,
        }
    }
}

/// Apply the inline/blob size policy to one payload.
///
/// Payloads at or under `inline_max_bytes` are stored inline as structured
/// JSON. Larger payloads are replaced with a `{truncated, size_bytes,
/// preview}` stub, and the serialized text is captured as a sidecar blob up
/// to `blob_max_bytes`, with the sha256 of the bytes actually stored.
pub fn encode_payload(value: &Value, config: &ReplayConfig) -> EncodedPayload {
    if value.is_null() {
        return EncodedPayload {
            inline: Value::Null,
            blob: None,
        };
    }

    let serialized = value.to_string();
    if serialized.len() <= config.inline_max_bytes {
        return EncodedPayload {
            inline: value.clone(),
            blob: None,
        };
    }

    let preview: String = serialized.chars().take(config.preview_chars).collect();
    let stored = truncate_utf8(&serialized, config.blob_max_bytes);
    let mut hasher = Sha256::new();
    hasher.update(stored.as_bytes());

    EncodedPayload {
        inline: json!({
            "truncated": true,
            "size_bytes": serialized.len(),
            "preview": preview,
        }),
        blob: Some(BlobSpec {
            sha256: hex::encode(hasher.finalize()),
            size_bytes: stored.len() as i64,
            truncated: stored.len() < serialized.len(),
            payload: stored,
        }),
    }
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
