//! Replay telemetry pipeline: capture → bounded queue → batched flush.
//!
//! Drives the recorder and flusher against the in-memory sink, including the
//! degradation ladder (bulk retry, per-row isolation, full-batch requeue)
//! and orphan-blob prevention.

use std::sync::Arc;

use chrono::Utc;
use orchestrator_core::config::ReplayConfig;
use orchestrator_core::kernel::replay::{
    flush_once, EventParent, ModelIo, ReplayRecorder, ReplaySink, ToolIo,
};
use orchestrator_core::kernel::store::MemoryStore;
use serde_json::json;
use uuid::Uuid;

fn recorder_with(config: ReplayConfig) -> ReplayRecorder {
    ReplayRecorder::new(config)
}

fn parent() -> EventParent {
    EventParent {
        task_id: Some(Uuid::new_v4()),
        trace_id: Some("trace-1".to_string()),
        request_id: Some("req-1".to_string()),
        intent_id: Some("intent-1".to_string()),
    }
}

fn small_inline_config() -> ReplayConfig {
    ReplayConfig {
        inline_max_bytes: 64,
        blob_max_bytes: 512,
        preview_chars: 16,
        ..ReplayConfig::default()
    }
}

#[tokio::test]
async fn model_and_tool_events_flush_to_their_tables() {
    let recorder = recorder_with(ReplayConfig::default());
    let store = Arc::new(MemoryStore::new());
    let scope = recorder.scope(parent());

    scope.model_io(
        ModelIo::builder()
            .provider(Some("anthropic".to_string()))
            .model(Some("claude-sonnet".to_string()))
            .input(json!({"prompt": "describe the canvas"}))
            .output(json!({"text": "a canvas"}))
            .latency_ms(Some(420))
            .build(),
    );
    scope.tool_io(
        ToolIo::builder()
            .tool_name("canvas.draw")
            .input(json!({"shapes": 2}))
            .build(),
    );

    let report = flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();
    assert_eq!(report.attempted, 4);
    assert_eq!(report.written, 4);

    assert_eq!(store.trace_event_count(), 2);
    assert_eq!(store.model_io_count(), 1);
    assert_eq!(store.tool_io_count(), 1);
    assert_eq!(recorder.queue_len(), 0);
}

#[tokio::test]
async fn replayed_executions_dedupe_at_the_sink() {
    let recorder = recorder_with(ReplayConfig::default());
    let store = Arc::new(MemoryStore::new());
    let anchor = parent();

    // Two executions of the same task emit identical deterministic ids.
    for _ in 0..2 {
        let scope = recorder.scope(anchor.clone());
        scope.tool_io(ToolIo::builder().tool_name("web_search").build());
    }

    flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();
    assert_eq!(store.trace_event_count(), 1);
    assert_eq!(store.tool_io_count(), 1);
}

#[tokio::test]
async fn oversize_payloads_store_stub_and_blob() {
    let recorder = recorder_with(small_inline_config());
    let store = Arc::new(MemoryStore::new());
    let anchor = parent();
    let scope = recorder.scope(anchor.clone());

    scope.tool_io(
        ToolIo::builder()
            .tool_name("web_search")
            .input(json!({"query": "q".repeat(400)}))
            .build(),
    );

    flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();

    let event_id = format!("{}:tool_call:ok:0", anchor.task_id.unwrap());
    let event = store
        .stored_trace_event(&event_id)
        .expect("trace event stored");

    // The inline payload is a truncation stub pointing at the sidecar.
    let inline = event.input_payload.as_ref().unwrap();
    assert_eq!(inline["truncated"], true);
    assert!(inline["preview"].as_str().unwrap().len() <= 16);

    let blob = store
        .stored_blob(&event_id, "input")
        .expect("input blob stored");
    assert_eq!(blob.sha256.len(), 64);
    assert!(blob.size_bytes > 0);
}

#[tokio::test]
async fn bulk_failure_degrades_to_isolation() {
    let recorder = recorder_with(ReplayConfig::default());
    let store = Arc::new(MemoryStore::new());
    let scope = recorder.scope(parent());

    scope.tool_io(ToolIo::builder().tool_name("a").build());
    scope.tool_io(ToolIo::builder().tool_name("b").build());

    // Both bulk attempts fail; per-row isolation lands everything.
    store.fail_next_sink_writes(2);
    let report = flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();

    assert_eq!(report.written, report.attempted);
    assert_eq!(report.dropped, 0);
    assert_eq!(store.trace_event_count(), 2);
    assert_eq!(store.tool_io_count(), 2);
}

#[tokio::test]
async fn total_failure_requeues_the_batch() {
    let recorder = recorder_with(ReplayConfig::default());
    let store = Arc::new(MemoryStore::new());
    let scope = recorder.scope(parent());

    scope.tool_io(ToolIo::builder().tool_name("a").build());
    let queued_before = recorder.queue_len();

    // Bulk, bulk retry, and both isolation writes (event + stream row) fail.
    store.fail_next_sink_writes(4);
    let report = flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();

    assert!(report.all_failed);
    assert_eq!(recorder.queue_len(), queued_before);
    assert_eq!(store.trace_event_count(), 0);

    // Once the sink recovers the same batch lands.
    let report = flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();
    assert_eq!(report.written, report.attempted);
    assert_eq!(store.trace_event_count(), 1);
}

#[tokio::test]
async fn blob_is_dropped_when_its_parent_event_fails() {
    let recorder = recorder_with(small_inline_config());
    let store = Arc::new(MemoryStore::new());
    let scope = recorder.scope(parent());

    scope.tool_io(
        ToolIo::builder()
            .tool_name("web_search")
            .input(json!({"query": "q".repeat(400)}))
            .build(),
    );

    // Bulk x2 fail, then the first isolated parent write fails too; the
    // blob whose parent never landed must not be stored.
    store.fail_next_sink_writes(3);
    let report = flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();

    assert!(report.dropped >= 2);
    assert_eq!(store.trace_event_count(), 0);
    assert_eq!(store.blob_count(), 0);
}

#[tokio::test]
async fn retention_sweep_deletes_expired_rows() {
    let recorder = recorder_with(ReplayConfig {
        retention_days: 1,
        ..ReplayConfig::default()
    });
    let store = Arc::new(MemoryStore::new());
    let scope = recorder.scope(parent());
    scope.tool_io(ToolIo::builder().tool_name("a").build());
    flush_once(&recorder, store.as_ref() as &dyn ReplaySink)
        .await
        .unwrap();

    // Nothing expires inside the window...
    assert_eq!(store.sweep_expired(Utc::now()).await.unwrap(), 0);
    // ...everything expires beyond it.
    let deleted = store
        .sweep_expired(Utc::now() + chrono::Duration::days(2))
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.trace_event_count(), 0);
    assert_eq!(store.tool_io_count(), 0);
}
