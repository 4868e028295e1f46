//! Steward registry: maps task names to typed handler closures.
//!
//! Stewards register at startup. The worker claims a task, looks up the
//! steward by the task's name, deserializes `params` into the steward's own
//! input type, and invokes it with a [`StewardContext`]. The queue core
//! never inspects `params`; validation belongs to the steward.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::common::envelope::Envelope;
use crate::kernel::budget::SearchBudget;
use crate::kernel::followup::FollowupScheduler;
use crate::kernel::queue::task::Task;
use crate::kernel::replay::ReplayScope;

/// What a steward reports back on success.
#[derive(Debug, Default)]
pub struct StewardOutcome {
    pub result: Option<Value>,
    /// Non-fatal warnings; retained on the task row even though it succeeded.
    pub warnings: Vec<String>,
}

impl StewardOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Steward failures, partitioned by what the worker should do next.
///
/// Stewards never retry on their own: a transient error asks the worker for
/// backoff, a fatal one finalizes the task as failed.
#[derive(Debug, Error)]
pub enum StewardError {
    #[error("{0}")]
    Fatal(anyhow::Error),
    #[error("{source}")]
    Transient {
        source: anyhow::Error,
        /// Hint from budget/rate circuit breakers.
        retry_after: Option<Duration>,
    },
    #[error("cancelled")]
    Cancelled,
}

impl StewardError {
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        StewardError::Fatal(error.into())
    }

    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        StewardError::Transient {
            source: error.into(),
            retry_after: None,
        }
    }

    pub fn transient_after(error: impl Into<anyhow::Error>, retry_after: Duration) -> Self {
        StewardError::Transient {
            source: error.into(),
            retry_after: Some(retry_after),
        }
    }
}

/// Everything a steward may touch besides its own params.
pub struct StewardContext {
    pub task: Task,
    pub envelope: Envelope,
    /// Cooperative cancellation; bail within a bounded time once signalled.
    pub cancel: CancellationToken,
    pub replay: ReplayScope,
    pub followups: Arc<FollowupScheduler>,
    pub budget: Arc<SearchBudget>,
}

type BoxedSteward = Box<
    dyn Fn(Value, StewardContext) -> Pin<Box<dyn Future<Output = Result<StewardOutcome, StewardError>> + Send>>
        + Send
        + Sync,
>;

/// Registry of stewards keyed by task name.
#[derive(Default)]
pub struct StewardRegistry {
    stewards: HashMap<String, BoxedSteward>,
}

impl StewardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a steward for `task`. The closure receives the deserialized
    /// params and the context; a params shape the steward rejects is fatal.
    pub fn register<P, F, Fut>(&mut self, task: impl Into<String>, steward: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, StewardContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<StewardOutcome, StewardError>> + Send + 'static,
    {
        let task = task.into();
        let name = task.clone();
        let boxed: BoxedSteward = Box::new(move |value, ctx| {
            let steward = steward.clone();
            let name = name.clone();
            Box::pin(async move {
                let params: P = serde_json::from_value(value).map_err(|e| {
                    StewardError::fatal(anyhow!("invalid params for {}: {}", name, e))
                })?;
                steward(params, ctx).await
            })
        });
        self.stewards.insert(task, boxed);
    }

    pub fn is_registered(&self, task: &str) -> bool {
        self.stewards.contains_key(task)
    }

    pub fn registered_tasks(&self) -> Vec<&str> {
        self.stewards.keys().map(String::as_str).collect()
    }

    /// Execute the steward registered for `task`'s name.
    pub async fn execute(
        &self,
        task: &Task,
        ctx: StewardContext,
    ) -> Result<StewardOutcome, StewardError> {
        let steward = self
            .stewards
            .get(&task.task)
            .ok_or_else(|| StewardError::fatal(anyhow!("unknown task: {}", task.task)))?;
        (steward)(task.params.clone(), ctx).await
    }
}
