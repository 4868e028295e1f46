//! Bounded in-memory queue feeding the replay flusher.
//!
//! Admission policy at saturation: high-priority entries evict the oldest
//! normal-priority entry; a high-priority entry with nothing evictable is
//! dropped with a rate-limited warning; normal-priority entries are dropped
//! silently and show up in the periodic summary counters.

use std::collections::VecDeque;

use tracing::warn;

use super::event::{BlobRow, ModelIoRow, ToolIoRow, TraceEventRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    Normal,
    High,
}

impl EventPriority {
    /// Events carrying an error are worth keeping over routine traffic.
    pub fn for_error(error: Option<&str>) -> Self {
        if error.is_some() {
            EventPriority::High
        } else {
            EventPriority::Normal
        }
    }
}

/// One queued row plus routing metadata.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub priority: EventPriority,
    pub event_id: String,
    pub row: ReplayRow,
}

#[derive(Debug, Clone)]
pub enum ReplayRow {
    Event(TraceEventRow),
    ModelIo(ModelIoRow),
    ToolIo(ToolIoRow),
    Blob(BlobRow),
}

impl ReplayRow {
    pub fn is_blob(&self) -> bool {
        matches!(self, ReplayRow::Blob(_))
    }
}

/// Drop counters reported in the periodic summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropCounters {
    pub normal: u64,
    pub high: u64,
    pub orphaned_blobs: u64,
}

pub struct ReplayQueue {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
    drops: DropCounters,
    drops_since_warn: u64,
}

impl ReplayQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            drops: DropCounters::default(),
            drops_since_warn: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drops(&self) -> DropCounters {
        self.drops
    }

    /// Admit a parent event with its stream row and blob sidecars.
    ///
    /// The trace row and the stream row are the parent pair: if either fails
    /// admission the whole bundle is rolled back and the sidecars are never
    /// queued, so a blob can never outlive its parent.
    pub fn admit_bundle(
        &mut self,
        priority: EventPriority,
        event_id: &str,
        parents: Vec<ReplayRow>,
        blobs: Vec<BlobRow>,
    ) -> bool {
        let mut admitted = 0usize;
        for row in parents {
            if self.try_admit(ReplayEntry {
                priority,
                event_id: event_id.to_string(),
                row,
            }) {
                admitted += 1;
            } else {
                // Roll back the partial parent and account the orphans.
                if admitted > 0 {
                    self.entries.retain(|e| e.event_id != event_id);
                }
                self.drops.orphaned_blobs += blobs.len() as u64;
                return false;
            }
        }

        for blob in blobs {
            let entry = ReplayEntry {
                priority,
                event_id: event_id.to_string(),
                row: ReplayRow::Blob(blob),
            };
            if !self.try_admit(entry) {
                self.drops.orphaned_blobs += 1;
            }
        }
        true
    }

    /// Admit one entry, applying the eviction policy at capacity.
    pub fn try_admit(&mut self, entry: ReplayEntry) -> bool {
        if self.entries.len() < self.capacity {
            self.entries.push_back(entry);
            return true;
        }

        match entry.priority {
            EventPriority::Normal => {
                self.drops.normal += 1;
                false
            }
            EventPriority::High => {
                let evictable = self
                    .entries
                    .iter()
                    .position(|e| e.priority == EventPriority::Normal);
                match evictable {
                    Some(index) => {
                        self.entries.remove(index);
                        self.drops.normal += 1;
                        self.entries.push_back(entry);
                        true
                    }
                    None => {
                        self.drops.high += 1;
                        self.drops_since_warn += 1;
                        if self.drops_since_warn >= 32 || self.drops.high == 1 {
                            warn!(
                                dropped_high = self.drops.high,
                                queue_len = self.entries.len(),
                                "replay queue saturated with high-priority events"
                            );
                            self.drops_since_warn = 0;
                        }
                        false
                    }
                }
            }
        }
    }

    /// Take up to `limit` entries off the front.
    pub fn drain(&mut self, limit: usize) -> Vec<ReplayEntry> {
        let take = limit.min(self.entries.len());
        self.entries.drain(..take).collect()
    }

    /// Put a failed batch back at the front, preserving order.
    pub fn requeue_front(&mut self, batch: Vec<ReplayEntry>) {
        for entry in batch.into_iter().rev() {
            if self.entries.len() >= self.capacity {
                // The queue refilled while the batch was out; the tail loses.
                match self.entries.pop_back() {
                    Some(evicted) if evicted.priority == EventPriority::Normal => {
                        self.drops.normal += 1
                    }
                    Some(_) => self.drops.high += 1,
                    None => {}
                }
            }
            self.entries.push_front(entry);
        }
    }

    /// Drop every queued blob belonging to `event_id`.
    pub fn drop_blobs_for(&mut self, event_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.event_id == event_id && e.row.is_blob()));
        let dropped = before - self.entries.len();
        self.drops.orphaned_blobs += dropped as u64;
        dropped
    }
}
