//! Follow-up scheduler: bounded-depth derivative enqueue with fingerprint
//! dedupe.
//!
//! A steward may emit refinement work while it runs (redraw a region, rerun
//! a scorecard with better targets). Two guards bound the cost: a per-family
//! depth ceiling, and a content fingerprint that collapses identical
//! follow-ups into one queued row via the queue's request-id dedupe.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::common::envelope::Envelope;
use crate::common::ids::{fingerprint_hex, short_hash};
use crate::kernel::queue::{
    CoalescePolicy, EnqueueError, EnqueueRequest, QueueConfig, Task, TaskQueue, SCOPE_KEY_PREFIX,
};
use crate::kernel::store::MemoryStore;

/// Params key carrying follow-up bookkeeping (depth, fingerprint).
pub const FOLLOWUP_KEY: &str = "followup";

#[derive(Debug, Clone)]
pub struct FollowupConfig {
    pub default_max_depth: i32,
    /// Per task-family overrides (`canvas`, `scorecard`, ...).
    pub max_depth_per_family: HashMap<String, i32>,
    /// Appended as a `scope:<tag>` resource key when set.
    pub runtime_scope: Option<String>,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            default_max_depth: 3,
            max_depth_per_family: HashMap::new(),
            runtime_scope: None,
        }
    }
}

/// What a steward asks to enqueue.
#[derive(Debug, Clone, TypedBuilder)]
pub struct FollowupSpec {
    #[builder(default = "canvas.followup".to_string(), setter(into))]
    pub task: String,
    #[builder(setter(into))]
    pub message: String,
    #[builder(default)]
    pub original_message: Option<String>,
    #[builder(default)]
    pub hint: Option<String>,
    #[builder(default)]
    pub reason: Option<String>,
    #[builder(default)]
    pub target_ids: Vec<String>,
    #[builder(default)]
    pub strict: bool,
    /// Extra params merged under the follow-up's own fields.
    #[builder(default = Value::Null)]
    pub extra_params: Value,
    #[builder(default)]
    pub priority: Option<i32>,
    #[builder(default)]
    pub run_at: Option<DateTime<Utc>>,
}

pub struct FollowupScheduler {
    queue: Arc<TaskQueue>,
    config: FollowupConfig,
}

impl FollowupScheduler {
    pub fn new(queue: Arc<TaskQueue>, config: FollowupConfig) -> Self {
        Self { queue, config }
    }

    /// Scheduler over a throwaway in-memory queue; test harnesses and
    /// contexts that must not touch the real store.
    pub fn disconnected() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(
            Arc::new(TaskQueue::new(
                store,
                CoalescePolicy::standard(),
                QueueConfig::default(),
            )),
            FollowupConfig::default(),
        )
    }

    /// Depth of a task in its follow-up chain; 0 for roots.
    pub fn depth_of(task: &Task) -> i32 {
        task.params
            .get(FOLLOWUP_KEY)
            .and_then(|f| f.get("depth"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32
    }

    fn max_depth_for(&self, family: &str) -> i32 {
        self.config
            .max_depth_per_family
            .get(family)
            .copied()
            .unwrap_or(self.config.default_max_depth)
    }

    /// Enqueue a derivative task.
    ///
    /// Returns `Ok(false)` when the depth bound rejects it; an identical
    /// fingerprint dedupes to the already-queued row and still reports
    /// `Ok(true)`.
    pub async fn enqueue_followup(
        &self,
        parent: &Task,
        spec: FollowupSpec,
    ) -> Result<bool, EnqueueError> {
        let depth = Self::depth_of(parent) + 1;
        let family = spec.task.split('.').next().unwrap_or(&spec.task).to_string();
        let max_depth = self.max_depth_for(&family);
        if depth > max_depth {
            debug!(
                parent_id = %parent.id,
                task = %spec.task,
                depth,
                max_depth,
                "follow-up rejected by depth bound"
            );
            return Ok(false);
        }

        let parent_envelope = Envelope::from_params(&parent.params);
        let correlation = parent_envelope
            .intent_id
            .clone()
            .or_else(|| parent_envelope.trace_id.clone())
            .or_else(|| parent.request_id.clone())
            .unwrap_or_else(|| parent.id.to_string());

        let mut sorted_targets = spec.target_ids.clone();
        sorted_targets.sort();
        let canonical = json!([
            parent.room,
            correlation,
            depth,
            spec.message,
            spec.original_message,
            spec.hint,
            spec.reason,
            sorted_targets,
            spec.strict,
        ])
        .to_string();
        let fingerprint = fingerprint_hex(&canonical);
        let request_id = format!(
            "{}:d{}:{}",
            correlation,
            depth,
            short_hash(&canonical, 12)
        );

        let mut resource_keys = vec![
            format!("{}:followup", family),
            format!("followup-depth:{}", depth),
        ];
        if let Some(scope_key) = parent_envelope.scope_key() {
            resource_keys.push(scope_key);
        }
        if let Some(scope) = &self.config.runtime_scope {
            resource_keys.push(format!("{}{}", SCOPE_KEY_PREFIX, scope));
        }

        let mut params = match spec.extra_params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        params.insert("message".to_string(), json!(spec.message));
        if let Some(original) = &spec.original_message {
            params.insert("originalMessage".to_string(), json!(original));
        }
        if let Some(hint) = &spec.hint {
            params.insert("hint".to_string(), json!(hint));
        }
        if let Some(reason) = &spec.reason {
            params.insert("reason".to_string(), json!(reason));
        }
        params.insert("targetIds".to_string(), json!(sorted_targets));
        params.insert("strict".to_string(), json!(spec.strict));
        params.insert(
            FOLLOWUP_KEY.to_string(),
            json!({ "depth": depth, "fingerprint": fingerprint }),
        );

        let envelope = Envelope {
            request_id: Some(request_id.clone()),
            trace_id: parent_envelope.trace_id.clone().or_else(|| parent.trace_id.clone()),
            intent_id: parent_envelope.intent_id.clone(),
            execution_id: parent_envelope.execution_id.clone(),
            ..Default::default()
        };

        let request = EnqueueRequest::builder()
            .room(parent.room.clone())
            .task(spec.task.clone())
            .params(Value::Object(params))
            .envelope(envelope)
            .request_id(Some(request_id))
            .dedupe_key(Some(fingerprint))
            .resource_keys(Some(resource_keys))
            .priority(spec.priority)
            .run_at(spec.run_at)
            .build();

        self.queue.enqueue(request).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::queue::task::{TaskStatus, DEFAULT_PRIORITY};

    fn harness() -> (Arc<MemoryStore>, FollowupScheduler) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            CoalescePolicy::standard(),
            QueueConfig::default(),
        ));
        (store, FollowupScheduler::new(queue, FollowupConfig::default()))
    }

    fn parent_task(depth: Option<i32>) -> Task {
        let envelope = Envelope {
            request_id: Some("req-parent".into()),
            trace_id: Some("trace-1".into()),
            intent_id: Some("intent-1".into()),
            ..Default::default()
        };
        let params = match depth {
            Some(depth) => envelope.merge_into(json!({
                FOLLOWUP_KEY: {"depth": depth, "fingerprint": "parent"}
            })),
            None => envelope.merge_into(json!({"message": "draw"})),
        };
        Task::queued(
            "r1",
            "canvas.agent_prompt",
            params,
            Some("req-parent".into()),
            Some("trace-1".into()),
            None,
            vec![],
            DEFAULT_PRIORITY,
            None,
        )
    }

    fn spec(message: &str) -> FollowupSpec {
        FollowupSpec::builder()
            .message(message)
            .target_ids(vec!["shape-b".into(), "shape-a".into()])
            .build()
    }

    #[tokio::test]
    async fn followup_carries_depth_and_scope_keys() {
        let (store, scheduler) = harness();
        let accepted = scheduler
            .enqueue_followup(&parent_task(None), spec("refine the sketch"))
            .await
            .unwrap();
        assert!(accepted);

        let rows = store.tasks_with_status(TaskStatus::Queued);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(FollowupScheduler::depth_of(row), 1);
        assert!(row.resource_keys.contains(&"canvas:followup".to_string()));
        assert!(row.resource_keys.contains(&"followup-depth:1".to_string()));
        assert!(row.resource_keys.contains(&"intent:intent-1".to_string()));
        // target ids are canonicalized for the fingerprint
        assert_eq!(row.params["targetIds"], json!(["shape-a", "shape-b"]));
        let request_id = row.request_id.as_deref().unwrap();
        assert!(request_id.starts_with("intent-1:d1:"));
    }

    #[tokio::test]
    async fn identical_fingerprints_dedupe_to_one_row() {
        let (store, scheduler) = harness();
        let parent = parent_task(None);

        assert!(scheduler.enqueue_followup(&parent, spec("same")).await.unwrap());
        assert!(scheduler.enqueue_followup(&parent, spec("same")).await.unwrap());

        assert_eq!(store.tasks_with_status(TaskStatus::Queued).len(), 1);
    }

    #[tokio::test]
    async fn different_messages_fan_out() {
        let (store, scheduler) = harness();
        let parent = parent_task(None);

        scheduler.enqueue_followup(&parent, spec("first")).await.unwrap();
        scheduler.enqueue_followup(&parent, spec("second")).await.unwrap();

        assert_eq!(store.tasks_with_status(TaskStatus::Queued).len(), 2);
    }

    #[tokio::test]
    async fn depth_bound_rejects_without_enqueueing() {
        let (store, scheduler) = harness();
        let deep_parent = parent_task(Some(3));

        let accepted = scheduler
            .enqueue_followup(&deep_parent, spec("too deep"))
            .await
            .unwrap();
        assert!(!accepted);
        assert!(store.tasks_with_status(TaskStatus::Queued).is_empty());
    }

    #[tokio::test]
    async fn per_family_depth_override_applies() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            CoalescePolicy::standard(),
            QueueConfig::default(),
        ));
        let mut config = FollowupConfig::default();
        config.max_depth_per_family.insert("scorecard".to_string(), 1);
        let scheduler = FollowupScheduler::new(queue, config);

        let parent = parent_task(Some(1));
        let rejected = scheduler
            .enqueue_followup(
                &parent,
                FollowupSpec::builder()
                    .task("scorecard.refresh")
                    .message("again")
                    .build(),
            )
            .await
            .unwrap();
        assert!(!rejected);

        // The same depth is fine for a family still under its ceiling.
        let accepted = scheduler
            .enqueue_followup(&parent, spec("canvas can go deeper"))
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(store.tasks_with_status(TaskStatus::Queued).len(), 1);
    }

    #[tokio::test]
    async fn runtime_scope_tag_is_appended() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            CoalescePolicy::standard(),
            QueueConfig::default(),
        ));
        let scheduler = FollowupScheduler::new(
            queue,
            FollowupConfig {
                runtime_scope: Some("edge".to_string()),
                ..Default::default()
            },
        );

        scheduler
            .enqueue_followup(&parent_task(None), spec("scoped"))
            .await
            .unwrap();
        let rows = store.tasks_with_status(TaskStatus::Queued);
        assert!(rows[0].resource_keys.contains(&"scope:edge".to_string()));
    }
}
