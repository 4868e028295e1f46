//! In-process agent-dispatch deduper.
//!
//! A voice transcript can trigger the same steward for the same room several
//! times inside one utterance window. This TTL map is the cheap first line;
//! the database's request-id constraint stays authoritative.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

pub struct DispatchDeduper {
    ttl: Duration,
    seen: DashMap<(String, String), DateTime<Utc>>,
}

impl DispatchDeduper {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl: Duration::milliseconds(ttl_ms.max(0)),
            seen: DashMap::new(),
        }
    }

    /// True when no dispatch for `(room, agent)` happened inside the window;
    /// records this one.
    pub fn should_dispatch(&self, room: &str, agent: &str) -> bool {
        let now = Utc::now();
        let key = (room.to_string(), agent.to_string());
        let mut fresh = true;
        self.seen
            .entry(key)
            .and_modify(|last| {
                if now - *last < self.ttl {
                    fresh = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        fresh
    }

    /// Drop expired entries; called opportunistically from the dispatch path.
    pub fn prune(&self) {
        let now = Utc::now();
        self.seen.retain(|_, last| now - *last < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
