//! Trigger binding - map external events to cloned task instances
//!
//! Tasks carrying a trigger configuration in their metadata are templates:
//! they never execute directly. When an event arrives whose type matches
//! the trigger's glob pattern, whose source starts with the configured
//! prefix, and whose condition evaluates truthy against `{event}`, the
//! template is cloned - fresh ids, steps reset to pending, event payload
//! injected under `metadata.trigger_event` - and the clone is scheduled.
//!
//! `${trigger_event.<path>}` references in step inputs are resolved at
//! input materialization time, not at clone time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use taskgraph_core::condition;
use taskgraph_core::task::{StepStatus, Task, TaskStatus, TriggerConfig, TRIGGER_METADATA_KEY};
use taskgraph_store::TaskStore;

use crate::error::{EngineError, Result};

/// An external event as delivered by the ingress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            data,
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// The payload injected into clones as `metadata.trigger_event`
    fn payload(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.event_type,
            "source": self.source,
            "data": self.data,
            "metadata": self.metadata,
            "timestamp": self.timestamp,
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledBinding {
    config: TriggerConfig,
    pattern: Regex,
}

/// Registry of trigger-bearing template tasks, indexed at creation time
pub struct TriggerBinding {
    store: Arc<dyn TaskStore>,
    bindings: RwLock<HashMap<String, CompiledBinding>>,
}

impl TriggerBinding {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Index a task's trigger, if it has an enabled one
    ///
    /// Returns whether a binding was registered.
    pub async fn register(&self, task: &Task) -> Result<bool> {
        let Some(config) = task.trigger_config() else {
            return Ok(false);
        };
        if !config.enabled {
            return Ok(false);
        }
        let pattern = glob_to_regex(&config.event_pattern).map_err(|e| {
            EngineError::Configuration(format!(
                "invalid event pattern '{}': {}",
                config.event_pattern, e
            ))
        })?;
        tracing::info!(
            task_id = %task.id,
            pattern = %config.event_pattern,
            "trigger registered"
        );
        self.bindings
            .write()
            .await
            .insert(task.id.clone(), CompiledBinding { config, pattern });
        Ok(true)
    }

    pub async fn unregister(&self, task_id: &str) {
        self.bindings.write().await.remove(task_id);
    }

    /// Re-index every stored template (restart recovery)
    ///
    /// Returns the number of bindings registered.
    pub async fn rebuild_from_store(&self) -> Result<usize> {
        let mut registered = 0;
        for record in self.store.list_templates().await? {
            if self.register(&record.task).await? {
                registered += 1;
            }
        }
        tracing::info!(registered, "trigger index rebuilt");
        Ok(registered)
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Dispatch one event: clone every matching template
    ///
    /// Returns the ids of the scheduled clones.
    pub async fn handle_event(&self, event: &Event) -> Result<Vec<String>> {
        let matching: Vec<String> = {
            let bindings = self.bindings.read().await;
            bindings
                .iter()
                .filter(|(_, binding)| binding_matches(binding, event))
                .map(|(task_id, _)| task_id.clone())
                .collect()
        };

        let mut scheduled = Vec::with_capacity(matching.len());
        for template_id in matching {
            let Some(record) = self.store.get_task(&template_id).await? else {
                // Template deleted since registration; drop the binding
                self.unregister(&template_id).await;
                continue;
            };
            let clone = clone_from_template(&record.task, event);
            let clone_id = self.store.create_task(clone).await?;
            tracing::info!(
                template_id = %template_id,
                clone_id = %clone_id,
                event_type = %event.event_type,
                "trigger fired"
            );
            scheduled.push(clone_id);
        }
        Ok(scheduled)
    }
}

fn binding_matches(binding: &CompiledBinding, event: &Event) -> bool {
    if !binding.pattern.is_match(&event.event_type) {
        return false;
    }
    if let Some(prefix) = &binding.config.source_filter {
        if !event.source.starts_with(prefix.as_str()) {
            return false;
        }
    }
    let context = json!({ "event": event.payload() });
    condition::evaluate(binding.config.condition.as_ref(), &context)
}

/// Compile a glob (`*` and `?` wildcards) into an anchored regex
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
}

/// Deep-copy a template into a runnable instance
///
/// Steps reset to pending with all runtime state cleared; the trigger
/// configuration itself is dropped from the clone (instances do not
/// re-trigger) and the event payload is injected for `${trigger_event...}`
/// substitution.
pub fn clone_from_template(template: &Task, event: &Event) -> Task {
    let now = Utc::now();
    let mut clone = template.clone();
    clone.id = Uuid::new_v4().to_string();
    clone.version = 1;
    clone.parent_task_id = None;
    clone.superseded_by = None;
    clone.is_template = false;
    clone.status = TaskStatus::Ready;
    clone.current_step_index = 0;
    clone.accumulated_findings.clear();
    clone.tree_id = None;
    clone.created_at = now;
    clone.updated_at = now;
    clone.completed_at = None;
    clone.metadata.remove(TRIGGER_METADATA_KEY);
    clone.metadata.insert(
        taskgraph_core::task::TRIGGER_EVENT_METADATA_KEY.to_string(),
        event.payload(),
    );

    for step in &mut clone.steps {
        step.status = StepStatus::Pending;
        step.outputs.clear();
        step.inputs_override = None;
        step.checkpoint_inputs = None;
        step.selected_alternative = None;
        step.qa_answers = None;
        step.retry_count = 0;
        step.error_message = None;
        step.started_at = None;
        step.completed_at = None;
        step.execution_time_ms = None;
    }
    clone
}
