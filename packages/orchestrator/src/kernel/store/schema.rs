//! Schema feature probes.
//!
//! Deployed databases can trail the code: an older `agent_tasks` without the
//! `trace_id` column, or a fleet that never ran the telemetry migration. The
//! adapters model that drift as flags instead of letting undefined-column
//! errors leak into the queue core.

use serde::Serialize;

/// What the connected database actually has.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchemaFeatures {
    pub has_trace_id_column: bool,
    pub has_trace_events_table: bool,
}

impl SchemaFeatures {
    /// Everything present; what a freshly migrated database reports.
    pub fn full() -> Self {
        Self {
            has_trace_id_column: true,
            has_trace_events_table: true,
        }
    }
}

impl Default for SchemaFeatures {
    fn default() -> Self {
        Self::full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_features_by_default() {
        let features = SchemaFeatures::default();
        assert!(features.has_trace_id_column);
        assert!(features.has_trace_events_table);
    }
}
