//! Single-flight batched flush from the replay queue into the sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{ReplayEntry, ReplayRow};
use super::sink::ReplaySink;
use super::ReplayShared;
use crate::kernel::store::StoreError;

/// Floor for the rescheduled delay after a fully failed flush.
const RETRY_DELAY_FLOOR: Duration = Duration::from_millis(250);
const RETRY_DELAY_CAP: Duration = Duration::from_secs(30);

/// What one flush attempt accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushReport {
    pub attempted: usize,
    pub written: usize,
    pub dropped: usize,
    /// Every row failed; the batch was re-queued for a later attempt.
    pub all_failed: bool,
}

/// Drain one batch from a recorder's queue and write it.
///
/// Escalation ladder: bulk upsert per destination table, one whole-batch
/// retry, then per-row isolation that drops irrecoverable rows. If nothing
/// at all could be written the batch goes back to the front of the queue and
/// the caller backs off.
pub async fn flush_once(
    recorder: &super::ReplayRecorder,
    sink: &dyn ReplaySink,
) -> Result<FlushReport, StoreError> {
    flush_shared(&recorder.shared(), sink).await
}

async fn flush_shared(
    shared: &ReplayShared,
    sink: &dyn ReplaySink,
) -> Result<FlushReport, StoreError> {
    let batch = {
        let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(shared.config.batch_size)
    };
    if batch.is_empty() {
        return Ok(FlushReport::default());
    }

    let mut report = FlushReport {
        attempted: batch.len(),
        ..Default::default()
    };

    match write_bulk(&batch, sink).await {
        Ok(()) => {
            report.written = batch.len();
            return Ok(report);
        }
        Err(first) => {
            debug!(error = %first, "replay bulk flush failed, retrying batch");
        }
    }

    // Whole-batch retry before degrading to row-at-a-time writes.
    if write_bulk(&batch, sink).await.is_ok() {
        report.written = batch.len();
        return Ok(report);
    }

    let (written, dropped, survivors) = write_isolated(&batch, sink).await;
    report.written = written;
    report.dropped = dropped;

    if written == 0 && dropped == 0 {
        report.all_failed = true;
        let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.requeue_front(survivors);
    }

    Ok(report)
}

/// Group the batch by destination table and bulk-upsert each group.
/// Parent tables are written before blobs.
async fn write_bulk(batch: &[ReplayEntry], sink: &dyn ReplaySink) -> Result<(), StoreError> {
    let mut events = Vec::new();
    let mut model_io = Vec::new();
    let mut tool_io = Vec::new();
    let mut blobs = Vec::new();

    for entry in batch {
        match &entry.row {
            ReplayRow::Event(row) => events.push(row.clone()),
            ReplayRow::ModelIo(row) => model_io.push(row.clone()),
            ReplayRow::ToolIo(row) => tool_io.push(row.clone()),
            ReplayRow::Blob(row) => blobs.push(row.clone()),
        }
    }

    if !events.is_empty() {
        sink.upsert_trace_events(&events).await?;
    }
    if !model_io.is_empty() {
        sink.upsert_model_io(&model_io).await?;
    }
    if !tool_io.is_empty() {
        sink.upsert_tool_io(&tool_io).await?;
    }
    if !blobs.is_empty() {
        sink.upsert_blobs(&blobs).await?;
    }
    Ok(())
}

/// Per-row isolation pass. Blobs whose parent event failed in this batch are
/// dropped rather than stored as orphans.
async fn write_isolated(
    batch: &[ReplayEntry],
    sink: &dyn ReplaySink,
) -> (usize, usize, Vec<ReplayEntry>) {
    let mut written = 0usize;
    let mut dropped = 0usize;
    let mut survivors: Vec<ReplayEntry> = Vec::new();
    let mut failed_parents: HashSet<String> = HashSet::new();

    // Parents first so the blob pass knows which events made it.
    for entry in batch.iter().filter(|e| !e.row.is_blob()) {
        let result = match &entry.row {
            ReplayRow::Event(row) => sink.upsert_trace_events(std::slice::from_ref(row)).await,
            ReplayRow::ModelIo(row) => sink.upsert_model_io(std::slice::from_ref(row)).await,
            ReplayRow::ToolIo(row) => sink.upsert_tool_io(std::slice::from_ref(row)).await,
            ReplayRow::Blob(_) => unreachable!("blobs handled below"),
        };
        match result {
            Ok(()) => written += 1,
            Err(error) => {
                warn!(event_id = %entry.event_id, %error, "dropping replay row after isolation retry");
                failed_parents.insert(entry.event_id.clone());
                dropped += 1;
                survivors.push(entry.clone());
            }
        }
    }

    for entry in batch.iter().filter(|e| e.row.is_blob()) {
        if failed_parents.contains(&entry.event_id) {
            warn!(event_id = %entry.event_id, "dropping blob whose parent event failed");
            dropped += 1;
            continue;
        }
        let ReplayRow::Blob(row) = &entry.row else {
            continue;
        };
        match sink.upsert_blobs(std::slice::from_ref(row)).await {
            Ok(()) => written += 1,
            Err(error) => {
                warn!(event_id = %entry.event_id, %error, "dropping replay blob after isolation retry");
                dropped += 1;
                survivors.push(entry.clone());
            }
        }
    }

    if written == 0 {
        // Nothing stuck; report the whole batch back for requeueing.
        (0, 0, batch.to_vec())
    } else {
        (written, dropped, survivors)
    }
}

/// Long-running flusher service. Runs until shutdown, then drains what it
/// can in a best-effort final flush.
pub struct ReplayFlusher {
    shared: Arc<ReplayShared>,
    sink: Arc<dyn ReplaySink>,
}

impl ReplayFlusher {
    pub fn new(recorder: &super::ReplayRecorder, sink: Arc<dyn ReplaySink>) -> Self {
        Self {
            shared: recorder.shared(),
            sink,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let base = self.shared.config.flush_interval;
        let mut delay = base;
        info!(flush_ms = base.as_millis() as u64, "replay flusher starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match flush_shared(&self.shared, self.sink.as_ref()).await {
                Ok(report) if report.all_failed => {
                    delay = (delay * 2).clamp(RETRY_DELAY_FLOOR, RETRY_DELAY_CAP);
                    warn!(
                        attempted = report.attempted,
                        next_delay_ms = delay.as_millis() as u64,
                        "replay flush failed for the whole batch, backing off"
                    );
                }
                Ok(report) => {
                    if report.dropped > 0 {
                        warn!(dropped = report.dropped, "replay flush dropped rows");
                    }
                    delay = base;
                }
                Err(error) => {
                    delay = (delay * 2).clamp(RETRY_DELAY_FLOOR, RETRY_DELAY_CAP);
                    warn!(%error, "replay flush errored, backing off");
                }
            }
        }

        // Best-effort final flush before the process exits.
        let mut rounds = 0;
        loop {
            match flush_shared(&self.shared, self.sink.as_ref()).await {
                Ok(report) if report.attempted == 0 => break,
                Ok(report) if report.all_failed => break,
                Ok(_) => {}
                Err(_) => break,
            }
            rounds += 1;
            if rounds > 64 {
                break;
            }
        }
        info!("replay flusher stopped");
    }
}
