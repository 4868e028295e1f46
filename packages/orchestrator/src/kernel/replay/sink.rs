//! Flush destination for replay rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::event::{BlobRow, ModelIoRow, ToolIoRow, TraceEventRow};
use crate::kernel::store::StoreError;

/// Batched, idempotent writes into the telemetry tables.
///
/// Upserts ignore duplicates: event ids are deterministic, so a retried
/// batch overlapping a previously committed one is harmless.
#[async_trait]
pub trait ReplaySink: Send + Sync {
    async fn upsert_trace_events(&self, rows: &[TraceEventRow]) -> Result<(), StoreError>;
    async fn upsert_model_io(&self, rows: &[ModelIoRow]) -> Result<(), StoreError>;
    async fn upsert_tool_io(&self, rows: &[ToolIoRow]) -> Result<(), StoreError>;
    async fn upsert_blobs(&self, rows: &[BlobRow]) -> Result<(), StoreError>;

    /// Retention sweep; returns deleted row count across the tables.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
