//! Replay telemetry: capture model-I/O and tool-I/O at the seams, batch in
//! memory, flush to the store with a quota-aware drop policy.
//!
//! ```text
//! Steward code
//!     │  scope.model_io(..) / scope.tool_io(..)
//!     ▼
//! ReplayRecorder ──► ReplayQueue (bounded, priority admission)
//!                         │ drain batches
//!                         ▼
//!                   ReplayFlusher ──► ReplaySink (bulk upsert, dedupe on
//!                                     deterministic event ids)
//! ```
//!
//! Telemetry never fails the parent task: saturation drops events, and the
//! flusher degrades from bulk writes to per-row isolation before giving up.

pub mod event;
mod flush;
pub mod queue;
mod sink;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::config::ReplayConfig;

pub use event::{
    compose_event_id, encode_payload, BlobKind, BlobRow, EventParent, ModelIoRow, ToolIoRow,
    TraceEventRow,
};
pub use flush::{flush_once, FlushReport, ReplayFlusher};
pub use queue::{DropCounters, EventPriority, ReplayEntry, ReplayQueue, ReplayRow};
pub use sink::ReplaySink;

/// A captured model-provider exchange.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ModelIo {
    #[builder(default = "model_call".to_string())]
    pub event_type: String,
    #[builder(default = "ok".to_string())]
    pub status: String,
    #[builder(default)]
    pub provider: Option<String>,
    #[builder(default)]
    pub model: Option<String>,
    #[builder(default)]
    pub provider_source: Option<String>,
    #[builder(default)]
    pub provider_path: Option<String>,
    #[builder(default)]
    pub provider_request_id: Option<String>,
    #[builder(default = Value::Null)]
    pub input: Value,
    #[builder(default = Value::Null)]
    pub output: Value,
    #[builder(default = Value::Null)]
    pub metadata: Value,
    #[builder(default)]
    pub error: Option<String>,
    #[builder(default)]
    pub latency_ms: Option<i64>,
    #[builder(default)]
    pub prompt_tokens: Option<i32>,
    #[builder(default)]
    pub completion_tokens: Option<i32>,
}

/// A captured internal tool invocation.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ToolIo {
    #[builder(default = "tool_call".to_string())]
    pub event_type: String,
    #[builder(default = "ok".to_string())]
    pub status: String,
    pub tool_name: String,
    #[builder(default = Value::Null)]
    pub input: Value,
    #[builder(default = Value::Null)]
    pub output: Value,
    #[builder(default = Value::Null)]
    pub metadata: Value,
    #[builder(default)]
    pub error: Option<String>,
    #[builder(default)]
    pub duration_ms: Option<i64>,
}

pub(crate) struct ReplayShared {
    pub queue: Mutex<ReplayQueue>,
    pub config: ReplayConfig,
}

/// Cheap-to-clone handle for enqueueing replay events.
#[derive(Clone)]
pub struct ReplayRecorder {
    shared: Arc<ReplayShared>,
}

impl ReplayRecorder {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            shared: Arc::new(ReplayShared {
                queue: Mutex::new(ReplayQueue::new(config.queue_max)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.shared.config
    }

    /// A per-execution scope with its own deterministic sequence counters.
    ///
    /// One scope per handler invocation: a re-run of the same task emits the
    /// same event ids from zero and dedupes at the sink.
    pub fn scope(&self, parent: EventParent) -> ReplayScope {
        ReplayScope {
            recorder: self.clone(),
            parent,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn drop_counters(&self) -> DropCounters {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drops()
    }

    pub(crate) fn shared(&self) -> Arc<ReplayShared> {
        Arc::clone(&self.shared)
    }

    fn admit(
        &self,
        priority: EventPriority,
        event_id: &str,
        parents: Vec<ReplayRow>,
        blobs: Vec<BlobRow>,
    ) -> bool {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit_bundle(priority, event_id, parents, blobs)
    }
}

/// Recorder scoped to one handler execution.
pub struct ReplayScope {
    recorder: ReplayRecorder,
    parent: EventParent,
    seqs: Mutex<HashMap<(String, String), u32>>,
}

impl ReplayScope {
    pub fn parent(&self) -> &EventParent {
        &self.parent
    }

    fn next_seq(&self, event_type: &str, status: &str) -> u32 {
        let mut seqs = self.seqs.lock().unwrap_or_else(|e| e.into_inner());
        let counter = seqs
            .entry((event_type.to_string(), status.to_string()))
            .or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }

    /// Capture one model-provider exchange. Returns whether the event was
    /// admitted (dropped events are accounted, never surfaced as errors).
    pub fn model_io(&self, io: ModelIo) -> bool {
        let config = self.recorder.config().clone();
        let now = Utc::now();
        let expires_at = now + ChronoDuration::days(config.retention_days);
        let seq = self.next_seq(&io.event_type, &io.status);
        let event_id = compose_event_id(&self.parent, &io.event_type, &io.status, seq);

        let input = encode_payload(&io.input, &config);
        let output = encode_payload(&io.output, &config);
        let metadata = encode_payload(&io.metadata, &config);

        let mut blobs = Vec::new();
        if let Some(spec) = input.blob {
            blobs.push(spec.into_row(&event_id, BlobKind::Input, now, expires_at));
        }
        if let Some(spec) = output.blob {
            blobs.push(spec.into_row(&event_id, BlobKind::Output, now, expires_at));
        }

        let trace_row = TraceEventRow {
            event_id: event_id.clone(),
            task_id: self.parent.task_id,
            trace_id: self.parent.trace_id.clone(),
            request_id: self.parent.request_id.clone(),
            intent_id: self.parent.intent_id.clone(),
            source: "model_io".to_string(),
            event_type: io.event_type.clone(),
            status: io.status.clone(),
            provider: io.provider.clone(),
            model: io.model.clone(),
            provider_source: io.provider_source.clone(),
            provider_path: io.provider_path.clone(),
            provider_request_id: io.provider_request_id.clone(),
            input_payload: Some(input.inline.clone()),
            output_payload: Some(output.inline.clone()),
            metadata: Some(metadata.inline.clone()),
            error: io.error.clone(),
            created_at: now,
            expires_at,
        };
        let stream_row = ModelIoRow {
            event_id: event_id.clone(),
            task_id: self.parent.task_id,
            trace_id: self.parent.trace_id.clone(),
            request_id: self.parent.request_id.clone(),
            intent_id: self.parent.intent_id.clone(),
            status: io.status.clone(),
            provider: io.provider,
            model: io.model,
            provider_source: io.provider_source,
            provider_path: io.provider_path,
            provider_request_id: io.provider_request_id,
            input_payload: Some(input.inline),
            output_payload: Some(output.inline),
            metadata: Some(metadata.inline),
            error: io.error.clone(),
            latency_ms: io.latency_ms,
            prompt_tokens: io.prompt_tokens,
            completion_tokens: io.completion_tokens,
            created_at: now,
            expires_at,
        };

        self.recorder.admit(
            EventPriority::for_error(io.error.as_deref()),
            &event_id,
            vec![ReplayRow::Event(trace_row), ReplayRow::ModelIo(stream_row)],
            blobs,
        )
    }

    /// Capture one tool invocation.
    pub fn tool_io(&self, io: ToolIo) -> bool {
        let config = self.recorder.config().clone();
        let now = Utc::now();
        let expires_at = now + ChronoDuration::days(config.retention_days);
        let seq = self.next_seq(&io.event_type, &io.status);
        let event_id = compose_event_id(&self.parent, &io.event_type, &io.status, seq);

        let input = encode_payload(&io.input, &config);
        let output = encode_payload(&io.output, &config);
        let metadata = encode_payload(&io.metadata, &config);

        let mut blobs = Vec::new();
        if let Some(spec) = input.blob {
            blobs.push(spec.into_row(&event_id, BlobKind::Input, now, expires_at));
        }
        if let Some(spec) = output.blob {
            blobs.push(spec.into_row(&event_id, BlobKind::Output, now, expires_at));
        }

        let trace_row = TraceEventRow {
            event_id: event_id.clone(),
            task_id: self.parent.task_id,
            trace_id: self.parent.trace_id.clone(),
            request_id: self.parent.request_id.clone(),
            intent_id: self.parent.intent_id.clone(),
            source: "tool_io".to_string(),
            event_type: io.event_type.clone(),
            status: io.status.clone(),
            provider: None,
            model: None,
            provider_source: None,
            provider_path: None,
            provider_request_id: None,
            input_payload: Some(input.inline.clone()),
            output_payload: Some(output.inline.clone()),
            metadata: Some(metadata.inline.clone()),
            error: io.error.clone(),
            created_at: now,
            expires_at,
        };
        let stream_row = ToolIoRow {
            event_id: event_id.clone(),
            task_id: self.parent.task_id,
            trace_id: self.parent.trace_id.clone(),
            request_id: self.parent.request_id.clone(),
            intent_id: self.parent.intent_id.clone(),
            status: io.status.clone(),
            tool_name: io.tool_name,
            input_payload: Some(input.inline),
            output_payload: Some(output.inline),
            metadata: Some(metadata.inline),
            error: io.error.clone(),
            duration_ms: io.duration_ms,
            created_at: now,
            expires_at,
        };

        self.recorder.admit(
            EventPriority::for_error(io.error.as_deref()),
            &event_id,
            vec![ReplayRow::Event(trace_row), ReplayRow::ToolIo(stream_row)],
            blobs,
        )
    }
}

/// Hourly retention sweep over the telemetry tables.
pub async fn run_retention_sweeper(
    sink: Arc<dyn ReplaySink>,
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match sink.sweep_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "replay retention sweep"),
            Err(error) => tracing::warn!(%error, "replay retention sweep failed"),
        }
    }
}
