//! In-memory store backends
//!
//! Reference implementations of [`TaskStore`] and [`PreferenceStore`]
//! backed by `Arc<RwLock<...>>` maps. Suitable for tests and single-node
//! deployments; production backends implement the same traits against a
//! database.
//!
//! Readers always receive deep-cloned, fully committed snapshots. Writers
//! go through a per-task revision counter: a caller that passes the
//! revision it loaded gets compare-and-swap semantics, and a lost race
//! surfaces as [`StoreError::Conflict`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use taskgraph_core::task::{Finding, StepPatch, Task, TaskPatch, TaskStatus};

use crate::error::{Result, StoreError};
use crate::preference::{Preference, PreferenceDecision, PreferenceMatch};
use crate::traits::{PreferenceStore, TaskRecord, TaskStore};

#[derive(Debug, Clone)]
struct StoredTask {
    task: Task,
    revision: u64,
}

/// Thread-safe in-memory task store
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, StoredTask>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Drop everything (tests)
    pub async fn clear(&self) {
        self.tasks.write().await.clear();
    }
}

/// A patch that only sets `superseded_by` - the single write allowed on a
/// terminal task
fn only_supersedes(patch: &TaskPatch) -> bool {
    patch.superseded_by.is_some()
        && patch.status.is_none()
        && patch.current_step_index.is_none()
        && patch.max_parallel_steps.is_none()
        && patch.tree_id.is_none()
        && patch.metadata.is_none()
        && patch.completed_at.is_none()
}

fn check_revision(stored: &StoredTask, expected: Option<u64>) -> Result<()> {
    if let Some(expected) = expected {
        if stored.revision != expected {
            return Err(StoreError::Conflict {
                task_id: stored.task.id.clone(),
                expected,
                actual: stored.revision,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<String> {
        task.validate_plan()?;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Validation(format!(
                "task '{}' already exists",
                task.id
            )));
        }
        let id = task.id.clone();
        tracing::debug!(task_id = %id, steps = task.steps.len(), "task created");
        tasks.insert(id.clone(), StoredTask { task, revision: 1 });
        Ok(id)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(task_id).map(|stored| TaskRecord {
            task: stored.task.clone(),
            revision: stored.revision,
        }))
    }

    async fn update_task(
        &self,
        task_id: &str,
        expected_revision: Option<u64>,
        patch: TaskPatch,
    ) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        check_revision(stored, expected_revision)?;

        if stored.task.status.is_terminal() && !only_supersedes(&patch) {
            return Err(StoreError::TerminalTask(task_id.to_string()));
        }

        patch.apply(&mut stored.task);
        stored.revision += 1;
        Ok(TaskRecord {
            task: stored.task.clone(),
            revision: stored.revision,
        })
    }

    async fn update_step(
        &self,
        task_id: &str,
        step_id: &str,
        expected_revision: Option<u64>,
        patch: StepPatch,
    ) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        check_revision(stored, expected_revision)?;

        let superseded = stored.task.superseded_by.is_some();
        let step = stored
            .task
            .get_step_mut(step_id)
            .ok_or_else(|| StoreError::StepNotFound {
                task_id: task_id.to_string(),
                step_id: step_id.to_string(),
            })?;

        if step.status.is_terminal() && !superseded {
            return Err(StoreError::TerminalStep {
                task_id: task_id.to_string(),
                step_id: step_id.to_string(),
            });
        }

        patch.apply(step);
        stored.task.updated_at = Utc::now();
        stored.revision += 1;
        Ok(TaskRecord {
            task: stored.task.clone(),
            revision: stored.revision,
        })
    }

    async fn append_finding(&self, task_id: &str, finding: Finding) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        stored.task.add_finding(finding);
        stored.revision += 1;
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|stored| stored.task.user_id == user_id)
            .filter(|stored| status.map(|s| stored.task.status == s).unwrap_or(true))
            .map(|stored| stored.task.clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn version_history(&self, task_id: &str, limit: usize) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut history = Vec::new();
        let mut cursor = Some(task_id.to_string());
        while let Some(id) = cursor {
            if history.len() >= limit {
                break;
            }
            match tasks.get(&id) {
                Some(stored) => {
                    cursor = stored.task.parent_task_id.clone();
                    history.push(stored.task.clone());
                }
                None => {
                    if history.is_empty() {
                        return Err(StoreError::NotFound(id));
                    }
                    break;
                }
            }
        }
        Ok(history)
    }

    async fn supersede(&self, original_id: &str, replacement: Task) -> Result<TaskRecord> {
        replacement.validate_plan()?;
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(original_id) {
            return Err(StoreError::NotFound(original_id.to_string()));
        }
        if tasks.contains_key(&replacement.id) {
            return Err(StoreError::Validation(format!(
                "task '{}' already exists",
                replacement.id
            )));
        }

        let replacement_id = replacement.id.clone();
        let record = StoredTask {
            task: replacement,
            revision: 1,
        };
        tasks.insert(replacement_id.clone(), record.clone());

        let original = tasks.get_mut(original_id).expect("checked above");
        original.task.superseded_by = Some(replacement_id.clone());
        if !original.task.status.is_terminal() {
            original.task.status = TaskStatus::Superseded;
        }
        original.task.updated_at = Utc::now();
        original.revision += 1;

        tracing::info!(
            original_id,
            replacement_id = %replacement_id,
            "task superseded by replan"
        );
        Ok(TaskRecord {
            task: record.task,
            revision: record.revision,
        })
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        Ok(tasks.remove(task_id).is_some())
    }

    async fn list_active(&self) -> Result<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|stored| !stored.task.is_template && !stored.task.status.is_terminal())
            .map(|stored| TaskRecord {
                task: stored.task.clone(),
                revision: stored.revision,
            })
            .collect())
    }

    async fn list_templates(&self) -> Result<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|stored| stored.task.is_template)
            .map(|stored| TaskRecord {
                task: stored.task.clone(),
                revision: stored.revision,
            })
            .collect())
    }
}

/// Thread-safe in-memory preference store
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceStore {
    preferences: Arc<RwLock<Vec<Preference>>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed preference (tests and migrations)
    pub async fn insert(&self, preference: Preference) {
        self.preferences.write().await.push(preference);
    }

    pub async fn len(&self) -> usize {
        self.preferences.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.preferences.read().await.is_empty()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn record_decision(
        &self,
        user_id: &str,
        preference_key: &str,
        context: HashMap<String, Value>,
        decision: PreferenceDecision,
    ) -> Result<Preference> {
        let mut preferences = self.preferences.write().await;
        let existing = preferences.iter_mut().find(|p| {
            p.user_id == user_id && p.preference_key == preference_key && p.matches_context(&context)
        });
        match existing {
            Some(preference) => {
                preference.absorb_decision(decision);
                tracing::debug!(
                    user_id,
                    preference_key,
                    confidence = preference.confidence,
                    "preference updated"
                );
                Ok(preference.clone())
            }
            None => {
                let preference = Preference::new(user_id, preference_key, context, decision);
                tracing::debug!(user_id, preference_key, "preference recorded");
                preferences.push(preference.clone());
                Ok(preference)
            }
        }
    }

    async fn find_matching(
        &self,
        user_id: &str,
        preference_key: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Option<PreferenceMatch>> {
        let preferences = self.preferences.read().await;
        let best = preferences
            .iter()
            .filter(|p| {
                p.user_id == user_id
                    && p.preference_key == preference_key
                    && p.matches_context(context)
            })
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        Ok(best.map(|preference| PreferenceMatch {
            preference: preference.clone(),
            confidence: preference.confidence,
        }))
    }

    async fn increment_usage(&self, preference_id: &str) -> Result<()> {
        let mut preferences = self.preferences.write().await;
        let preference = preferences
            .iter_mut()
            .find(|p| p.id == preference_id)
            .ok_or_else(|| StoreError::PreferenceNotFound(preference_id.to_string()))?;
        preference.usage_count += 1;
        preference.updated_at = Utc::now();
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Preference>> {
        let preferences = self.preferences.read().await;
        Ok(preferences
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskgraph_core::task::{StepStatus, TaskStep};

    fn sample_task() -> Task {
        Task::new("user-1", "fetch and summarize").with_steps(vec![
            TaskStep::new("a", "Fetch", "http_fetch"),
            TaskStep::new("b", "Summarize", "summarize").with_dependencies(vec!["a".to_string()]),
        ])
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        let id = store.create_task(task.clone()).await.unwrap();
        let record = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.task, task);
        assert_eq!(record.revision, 1);
        assert!(store.get_task("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_rejects_invalid_dag() {
        let store = MemoryTaskStore::new();
        let task = Task::new("user-1", "bad plan").with_steps(vec![
            TaskStep::new("a", "A", "noop").with_dependencies(vec!["b".to_string()]),
            TaskStep::new("b", "B", "noop"),
        ]);
        let err = store.create_task(task).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn cas_write_conflict_is_distinguishable() {
        let store = MemoryTaskStore::new();
        let id = store.create_task(sample_task()).await.unwrap();
        let record = store.get_task(&id).await.unwrap().unwrap();

        // First writer wins
        store
            .update_task(
                &id,
                Some(record.revision),
                TaskPatch::status(TaskStatus::Executing),
            )
            .await
            .unwrap();

        // Second writer with the stale revision loses
        let err = store
            .update_task(
                &id,
                Some(record.revision),
                TaskPatch::status(TaskStatus::Paused),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Reload and retry succeeds
        let fresh = store.get_task(&id).await.unwrap().unwrap();
        store
            .update_task(&id, Some(fresh.revision), TaskPatch::status(TaskStatus::Paused))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_task_only_accepts_superseded_by() {
        let store = MemoryTaskStore::new();
        let id = store.create_task(sample_task()).await.unwrap();
        store
            .update_task(&id, None, TaskPatch::status(TaskStatus::Failed))
            .await
            .unwrap();

        let err = store
            .update_task(&id, None, TaskPatch::status(TaskStatus::Executing))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalTask(_)));

        store
            .update_task(&id, None, TaskPatch::superseded_by("t2"))
            .await
            .unwrap();
        let record = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.task.superseded_by.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn terminal_step_writes_rejected_unless_superseded() {
        let store = MemoryTaskStore::new();
        let id = store.create_task(sample_task()).await.unwrap();
        store
            .update_step(&id, "a", None, StepPatch::done(HashMap::new()))
            .await
            .unwrap();

        let err = store
            .update_step(&id, "a", None, StepPatch::status(StepStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalStep { .. }));

        store
            .update_task(&id, None, TaskPatch::superseded_by("t2"))
            .await
            .unwrap();
        store
            .update_step(&id, "a", None, StepPatch::status(StepStatus::Pending))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn findings_append_without_cas() {
        let store = MemoryTaskStore::new();
        let id = store.create_task(sample_task()).await.unwrap();
        store
            .append_finding(&id, Finding::new("a", "http_fetch", json!({"bytes": 1024})))
            .await
            .unwrap();
        store
            .append_finding(&id, Finding::new("b", "summarize", json!({"words": 80})))
            .await
            .unwrap();
        let record = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.task.accumulated_findings.len(), 2);
        assert_eq!(record.task.accumulated_findings[0].finding_type, "http_fetch");
    }

    #[tokio::test]
    async fn list_by_user_filters_and_limits() {
        let store = MemoryTaskStore::new();
        for i in 0..3 {
            let mut task = sample_task();
            task.id = format!("t{}", i);
            store.create_task(task).await.unwrap();
        }
        let mut other = sample_task();
        other.id = "other".to_string();
        other.user_id = "user-2".to_string();
        store.create_task(other).await.unwrap();

        let all = store.list_by_user("user-1", None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let limited = store.list_by_user("user-1", None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        store
            .update_task("t1", None, TaskPatch::status(TaskStatus::Executing))
            .await
            .unwrap();
        let executing = store
            .list_by_user("user-1", Some(TaskStatus::Executing), 10)
            .await
            .unwrap();
        assert_eq!(executing.len(), 1);
        assert_eq!(executing[0].id, "t1");
    }

    #[tokio::test]
    async fn version_history_walks_parent_chain() {
        let store = MemoryTaskStore::new();
        let mut v1 = sample_task();
        v1.id = "v1".to_string();
        let mut v2 = sample_task();
        v2.id = "v2".to_string();
        v2.version = 2;
        v2.parent_task_id = Some("v1".to_string());
        let mut v3 = sample_task();
        v3.id = "v3".to_string();
        v3.version = 3;
        v3.parent_task_id = Some("v2".to_string());

        for task in [v1, v2, v3] {
            store.create_task(task).await.unwrap();
        }

        let history = store.version_history("v3", 10).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["v3", "v2", "v1"]);

        let capped = store.version_history("v3", 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_cas_writers_all_land_exactly_once() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = store.create_task(sample_task()).await.unwrap();

        // Eight writers each bump a metadata counter through the
        // reload/compare-and-swap/retry protocol
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    loop {
                        let record = store.get_task(&id).await.unwrap().unwrap();
                        let current = record
                            .task
                            .metadata
                            .get("counter")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0);
                        let mut metadata = HashMap::new();
                        metadata.insert("counter".to_string(), json!(current + 1));
                        let patch = TaskPatch {
                            metadata: Some(metadata),
                            ..Default::default()
                        };
                        match store.update_task(&id, Some(record.revision), patch).await {
                            Ok(_) => break,
                            Err(e) if e.is_conflict() => continue,
                            Err(e) => panic!("unexpected store error: {}", e),
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.task.metadata.get("counter"), Some(&json!(80)));
    }

    #[tokio::test]
    async fn list_templates_returns_only_templates() {
        let store = MemoryTaskStore::new();
        store.create_task(sample_task()).await.unwrap();
        let mut template = sample_task();
        template.id = "template".to_string();
        template.is_template = true;
        store.create_task(template).await.unwrap();

        let templates = store.list_templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].task.id, "template");
    }

    #[tokio::test]
    async fn supersede_links_lineage_atomically() {
        let store = MemoryTaskStore::new();
        let original_id = store.create_task(sample_task()).await.unwrap();

        let mut successor = sample_task();
        successor.id = "v2".to_string();
        successor.version = 2;
        successor.parent_task_id = Some(original_id.clone());
        let record = store.supersede(&original_id, successor).await.unwrap();
        assert_eq!(record.task.id, "v2");

        let original = store.get_task(&original_id).await.unwrap().unwrap();
        assert_eq!(original.task.status, TaskStatus::Superseded);
        assert_eq!(original.task.superseded_by.as_deref(), Some("v2"));

        // Duplicate successor id is rejected
        let mut duplicate = sample_task();
        duplicate.id = "v2".to_string();
        assert!(store.supersede(&original_id, duplicate).await.is_err());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryTaskStore::new();
        let id = store.create_task(sample_task()).await.unwrap();
        assert!(store.delete_task(&id).await.unwrap());
        assert!(!store.delete_task(&id).await.unwrap());
    }

    #[tokio::test]
    async fn active_excludes_templates_and_terminal() {
        let store = MemoryTaskStore::new();
        let id = store.create_task(sample_task()).await.unwrap();
        let mut template = sample_task();
        template.id = "template".to_string();
        template.is_template = true;
        store.create_task(template).await.unwrap();
        let mut done = sample_task();
        done.id = "done".to_string();
        done.status = TaskStatus::Completed;
        store.create_task(done).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task.id, id);
    }

    #[tokio::test]
    async fn preferences_record_find_and_count_usage() {
        let store = MemoryPreferenceStore::new();
        let mut context = HashMap::new();
        context.insert("agent_type".to_string(), json!("notify"));

        let recorded = store
            .record_decision("u1", "notify_default", context.clone(), PreferenceDecision::Approved)
            .await
            .unwrap();
        assert_eq!(recorded.confidence, crate::preference::INITIAL_CONFIDENCE);

        // Consistent repeats strengthen the same record
        for _ in 0..4 {
            store
                .record_decision(
                    "u1",
                    "notify_default",
                    context.clone(),
                    PreferenceDecision::Approved,
                )
                .await
                .unwrap();
        }
        let matched = store
            .find_matching("u1", "notify_default", &context)
            .await
            .unwrap()
            .unwrap();
        assert!(matched.confidence >= 0.9);
        assert_eq!(store.len().await, 1);

        store.increment_usage(&matched.preference.id).await.unwrap();
        let after = store
            .find_matching("u1", "notify_default", &context)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.preference.usage_count, 1);

        // Other users and keys see nothing
        assert!(store
            .find_matching("u2", "notify_default", &context)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_matching("u1", "other_key", &context)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn contradicting_decision_resets_confidence() {
        let store = MemoryPreferenceStore::new();
        let context = HashMap::new();
        for _ in 0..5 {
            store
                .record_decision("u1", "k", context.clone(), PreferenceDecision::Approved)
                .await
                .unwrap();
        }
        let flipped = store
            .record_decision("u1", "k", context.clone(), PreferenceDecision::Rejected)
            .await
            .unwrap();
        assert_eq!(flipped.decision, PreferenceDecision::Rejected);
        assert_eq!(flipped.confidence, crate::preference::RESET_CONFIDENCE);
    }
}
