//! Correlation envelope carried through every hop of the queue.
//!
//! The envelope rides inside `params` (the upstream callers speak camelCase
//! JSON) and is mirrored into top-level task columns where indexed
//! (`request_id`, `trace_id`). The queue core never inspects the rest of
//! `params`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Key under which the envelope is merged into `params`.
pub const ENVELOPE_KEY: &str = "envelope";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("requestId must be a non-blank string")]
    BlankRequestId,
}

/// Correlation ids for one enqueue intent.
///
/// `request_id` is globally unique per enqueue intent; `trace_id` propagates
/// through telemetry; `intent_id` groups the tasks fanned out from one user
/// utterance; `execution_id` names one orchestration invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

impl Envelope {
    /// Envelope with a freshly minted request id and execution id.
    pub fn minted() -> Self {
        Self {
            request_id: Some(mint_request_id()),
            execution_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        }
    }

    /// Validate correlation fields that must not be blank when present.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if let Some(request_id) = &self.request_id {
            if request_id.trim().is_empty() {
                return Err(EnvelopeError::BlankRequestId);
            }
        }
        Ok(())
    }

    /// The scope key used to serialize derivative work from this envelope:
    /// intent first, then trace, then request.
    pub fn scope_key(&self) -> Option<String> {
        if let Some(intent) = &self.intent_id {
            return Some(format!("intent:{}", intent));
        }
        if let Some(trace) = &self.trace_id {
            return Some(format!("trace:{}", trace));
        }
        self.request_id.as_ref().map(|r| format!("request:{}", r))
    }

    /// Read the envelope back out of a `params` object.
    pub fn from_params(params: &Value) -> Self {
        params
            .get(ENVELOPE_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Merge this envelope into `params` under [`ENVELOPE_KEY`].
    ///
    /// Non-object params are wrapped into an object so the envelope always
    /// survives the trip through the store.
    pub fn merge_into(&self, params: Value) -> Value {
        let mut object = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if let Ok(Value::Object(envelope)) = serde_json::to_value(self) {
            object.insert(ENVELOPE_KEY.to_string(), Value::Object(envelope));
        }
        Value::Object(object)
    }
}

/// Mint a request id for callers that did not supply one.
pub fn mint_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// Derive the default resource keys for a task from its envelope and params.
///
/// Preference order: explicit `lockKey`, then `widget:<componentId>`, then
/// `widget-type:<componentType>`, then the task-family room key for the
/// canvas/search/scorecard families. Unknown families run unconstrained.
pub fn derive_default_lock_key(
    envelope: &Envelope,
    params: &Value,
    task: &str,
    room: &str,
) -> Option<String> {
    if let Some(lock_key) = &envelope.lock_key {
        if !lock_key.is_empty() {
            return Some(lock_key.clone());
        }
    }
    if let Some(component_id) = params.get("componentId").and_then(Value::as_str) {
        return Some(format!("widget:{}", component_id));
    }
    if let Some(component_type) = params.get("componentType").and_then(Value::as_str) {
        return Some(format!("widget-type:{}", component_type));
    }
    let family = task.split('.').next().unwrap_or(task);
    match family {
        "canvas" => Some(format!("room:{}:canvas", room)),
        "search" => Some(format!("room:{}:search", room)),
        "scorecard" => Some(format!("room:{}:scorecard", room)),
        _ => None,
    }
}
