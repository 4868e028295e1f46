//! Orchestration kernel: the process-wide state behind the queue, workers,
//! telemetry, and ops read models.
//!
//! Lifecycle: build a [`Kernel`] at startup (Postgres in production, the
//! in-memory store for tests and local development), run the worker runtime
//! and replay flusher against it, drain on shutdown.

pub mod arbiter;
pub mod audit;
pub mod budget;
pub mod dedupe;
pub mod followup;
pub mod queue;
pub mod replay;
pub mod store;
pub mod worker;

use std::sync::Arc;

use crate::config::Config;

use audit::OverviewService;
use budget::SearchBudget;
use dedupe::DispatchDeduper;
use followup::{FollowupConfig, FollowupScheduler};
use queue::{CoalescePolicy, QueueConfig, TaskQueue};
use replay::{ReplayRecorder, ReplaySink};
use store::{HeartbeatStore, MemoryStore, OverviewStore, PostgresStore, TaskStore};
use worker::CancelRegistry;

/// Process-wide orchestration state.
///
/// Every field is shared-ownership on purpose: the HTTP surface, the worker
/// runtime, and the background services all hang off one kernel.
pub struct Kernel {
    pub config: Config,
    pub tasks: Arc<dyn TaskStore>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
    pub queue: Arc<TaskQueue>,
    pub replay: ReplayRecorder,
    pub replay_sink: Arc<dyn ReplaySink>,
    pub followups: Arc<FollowupScheduler>,
    pub budget: Arc<SearchBudget>,
    pub dispatch_dedupe: DispatchDeduper,
    pub overview: OverviewService,
    pub cancels: Arc<CancelRegistry>,
}

impl Kernel {
    /// Production wiring over one Postgres adapter.
    pub fn from_postgres(store: Arc<PostgresStore>, config: Config) -> Self {
        Self::assemble(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            config,
        )
    }

    /// In-memory wiring for tests and local development; the returned store
    /// handle allows direct inspection.
    pub fn in_memory(config: Config) -> (Arc<MemoryStore>, Self) {
        let store = Arc::new(MemoryStore::new());
        let kernel = Self::assemble(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            config,
        );
        (store, kernel)
    }

    fn assemble(
        tasks: Arc<dyn TaskStore>,
        heartbeats: Arc<dyn HeartbeatStore>,
        overview_store: Arc<dyn OverviewStore>,
        replay_sink: Arc<dyn ReplaySink>,
        config: Config,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&tasks),
            CoalescePolicy::standard(),
            QueueConfig::default(),
        ));
        let followups = Arc::new(FollowupScheduler::new(
            Arc::clone(&queue),
            FollowupConfig::default(),
        ));
        let replay = ReplayRecorder::new(config.replay.clone());
        let budget = Arc::new(SearchBudget::new(config.cost_search_per_minute_limit));
        let dispatch_dedupe = DispatchDeduper::new(config.canvas_agent_transcript_window_ms);
        let overview = OverviewService::new(overview_store, Arc::clone(&heartbeats));

        Self {
            config,
            tasks,
            heartbeats,
            queue,
            replay,
            replay_sink,
            followups,
            budget,
            dispatch_dedupe,
            overview,
            cancels: Arc::new(CancelRegistry::new()),
        }
    }
}
