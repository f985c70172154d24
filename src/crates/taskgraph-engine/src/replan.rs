//! Strategic replanning with work preservation
//!
//! When tactical recovery (retry, fallback, modify, skip) cannot rescue a
//! critical step, the engine escalates to the external planner with a
//! diagnosis of what went wrong and everything already accomplished. The
//! planner returns a revised step list; the engine builds a successor task
//! one version up the lineage and atomically supersedes the original.
//!
//! Invariant: no completed step is ever re-executed across a replan. Any
//! step the planner carries over by id is forcibly restored to `done` with
//! the original's outputs, whatever the planner returned for it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use taskgraph_core::error::StepError;
use taskgraph_core::task::{Finding, StepStatus, Task, TaskStatus, TaskStep};
use taskgraph_store::{TaskRecord, TaskStore};

use crate::error::{EngineError, Result};

/// Finding type reserved for replan records
pub const REPLAN_FINDING_TYPE: &str = "replan";

/// Context handed to the planner when strategic replanning is needed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplanContext {
    /// What went wrong and why tactical recovery was not possible
    pub diagnosis: String,
    /// Step ids that need revision (the failed step and its dependents)
    pub affected_step_ids: Vec<String>,
    /// Outputs of completed steps, keyed by step id; must be preserved
    pub completed_outputs: HashMap<String, HashMap<String, Value>>,
    /// New constraints discovered during execution
    pub constraints: Vec<String>,
    /// Optional suggestion from the failure controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_approach: Option<String>,
}

impl ReplanContext {
    /// Build a context from a failed step and its task snapshot
    pub fn from_failure(task: &Task, failed_step_id: &str, error: &StepError) -> Self {
        let mut affected = vec![failed_step_id.to_string()];
        affected.extend(transitive_dependents(task, failed_step_id));

        let completed_outputs = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| (s.id.clone(), s.outputs.clone()))
            .collect();

        Self {
            diagnosis: format!("step '{}' failed: {}", failed_step_id, error),
            affected_step_ids: affected,
            completed_outputs,
            constraints: Vec::new(),
            suggested_approach: None,
        }
    }
}

/// Steps that transitively depend on `root`, in document order
fn transitive_dependents(task: &Task, root: &str) -> Vec<String> {
    let mut affected: HashSet<String> = HashSet::new();
    affected.insert(root.to_string());
    // Dependencies always point backwards, so one forward pass suffices
    let mut result = Vec::new();
    for step in &task.steps {
        if step.id != root && step.dependencies.iter().any(|d| affected.contains(d)) {
            affected.insert(step.id.clone());
            result.push(step.id.clone());
        }
    }
    result
}

/// The external planner: natural-language goals in, validated DAGs out
///
/// Semantic quality is the planner's contract; the engine validates only
/// structural correctness.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce a step list for a fresh goal
    async fn plan(
        &self,
        goal: &str,
        constraints: &HashMap<String, Value>,
    ) -> std::result::Result<Vec<TaskStep>, String>;

    /// Produce a revised step list preserving completed work
    async fn replan(
        &self,
        original: &Task,
        failed_step: &TaskStep,
        context: &ReplanContext,
    ) -> std::result::Result<Vec<TaskStep>, String>;
}

/// Drive one strategic replan end to end
///
/// Calls the planner, enforces the preservation invariant, constructs the
/// successor (fresh id, version + 1, copied findings plus a `replan`
/// finding), and atomically supersedes the original.
pub async fn execute_replan(
    store: &Arc<dyn TaskStore>,
    planner: &Arc<dyn Planner>,
    original: &Task,
    failed_step_id: &str,
    context: ReplanContext,
) -> Result<TaskRecord> {
    let failed_step = original
        .get_step(failed_step_id)
        .ok_or_else(|| EngineError::InvalidState(format!("unknown step '{}'", failed_step_id)))?;

    let mut steps = planner
        .replan(original, failed_step, &context)
        .await
        .map_err(EngineError::Planner)?;

    // Preservation invariant: carried-over completed steps keep their
    // status and outputs bit-identically, whatever the planner emitted.
    let mut preserved = 0usize;
    for step in steps.iter_mut() {
        if let Some(done) = original
            .get_step(&step.id)
            .filter(|s| s.status == StepStatus::Done)
        {
            step.status = StepStatus::Done;
            step.outputs = done.outputs.clone();
            step.started_at = done.started_at;
            step.completed_at = done.completed_at;
            step.execution_time_ms = done.execution_time_ms;
            step.error_message = None;
            preserved += 1;
        }
    }

    let now = Utc::now();
    let mut successor = Task {
        id: Uuid::new_v4().to_string(),
        version: original.version + 1,
        user_id: original.user_id.clone(),
        organization_id: original.organization_id.clone(),
        goal: original.goal.clone(),
        constraints: original.constraints.clone(),
        success_criteria: original.success_criteria.clone(),
        steps,
        accumulated_findings: original.accumulated_findings.clone(),
        current_step_index: 0,
        status: TaskStatus::Executing,
        max_parallel_steps: original.max_parallel_steps,
        tree_id: original.tree_id.clone(),
        parent_task_id: Some(original.id.clone()),
        superseded_by: None,
        metadata: original.metadata.clone(),
        is_template: false,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    successor.validate_plan().map_err(|e| {
        EngineError::Planner(format!("replan produced an invalid plan: {}", e))
    })?;

    let revised = successor
        .steps
        .iter()
        .filter(|s| s.status != StepStatus::Done)
        .count();
    successor.add_finding(Finding::new(
        failed_step_id,
        REPLAN_FINDING_TYPE,
        json!({
            "diagnosis": context.diagnosis,
            "affected_step_ids": context.affected_step_ids,
            "preserved_steps": preserved,
            "revised_steps": revised,
            "previous_version": original.version,
        }),
    ));

    tracing::info!(
        original_id = %original.id,
        successor_id = %successor.id,
        version = successor.version,
        preserved,
        revised,
        "strategic replan"
    );

    Ok(store.supersede(&original.id, successor).await?)
}
