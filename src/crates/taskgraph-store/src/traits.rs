//! Storage traits for task documents and checkpoint preferences
//!
//! The engine talks to persistence exclusively through these traits, so
//! backends can be swapped (in-memory for tests and single-node setups, a
//! database for production) without touching orchestration code.
//!
//! # Concurrency contract
//!
//! Every mutation is atomic per task. Reads return fully committed
//! snapshots - never a partially applied patch. Writers pass the revision
//! they loaded; a write whose expected revision no longer matches returns
//! [`StoreError::Conflict`](crate::StoreError::Conflict) and the caller
//! must reload and re-decide. Passing `None` skips the check for
//! commutative mutations (e.g. appending findings).

use async_trait::async_trait;
use std::collections::HashMap;

use serde_json::Value;
use taskgraph_core::task::{Finding, StepPatch, Task, TaskPatch, TaskStatus};

use crate::error::Result;
use crate::preference::{Preference, PreferenceDecision, PreferenceMatch};

/// A committed task snapshot plus the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task: Task,
    /// Internal optimistic-concurrency counter; bumped on every commit
    pub revision: u64,
}

/// Durable persistence for tasks, steps, findings, and version lineage
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task atomically
    ///
    /// Enforces DAG validity: unique step ids, every dependency resolvable
    /// to an earlier-declared step, no cycles. Returns the task id.
    async fn create_task(&self, task: Task) -> Result<String>;

    /// Load a committed snapshot
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Merge a partial update of top-level fields
    ///
    /// Terminal tasks only accept patches that set `superseded_by`.
    async fn update_task(
        &self,
        task_id: &str,
        expected_revision: Option<u64>,
        patch: TaskPatch,
    ) -> Result<TaskRecord>;

    /// Merge a partial update of one step
    ///
    /// Writes to a step whose status is already terminal are rejected
    /// unless the task has been superseded.
    async fn update_step(
        &self,
        task_id: &str,
        step_id: &str,
        expected_revision: Option<u64>,
        patch: StepPatch,
    ) -> Result<TaskRecord>;

    /// Append to the task's finding log
    async fn append_finding(&self, task_id: &str, finding: Finding) -> Result<()>;

    /// Tasks owned by a user, newest first
    async fn list_by_user(
        &self,
        user_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Version lineage starting at `task_id`, walking `parent_task_id`
    async fn version_history(&self, task_id: &str, limit: usize) -> Result<Vec<Task>>;

    /// Atomically install a replan successor
    ///
    /// Writes `replacement` (validating its plan), sets the original's
    /// `superseded_by` to the replacement id and, when the original is not
    /// already terminal, its status to superseded. One commit; no
    /// observer sees the successor without the back-link.
    async fn supersede(&self, original_id: &str, replacement: Task) -> Result<TaskRecord>;

    /// Remove a task and everything it owns; returns whether it existed
    async fn delete_task(&self, task_id: &str) -> Result<bool>;

    /// All non-template tasks in a non-terminal status (restart recovery)
    async fn list_active(&self) -> Result<Vec<TaskRecord>>;

    /// All template tasks (trigger index rebuild on restart)
    async fn list_templates(&self) -> Result<Vec<TaskRecord>>;

    /// Liveness probe
    async fn health_check(&self) -> bool {
        true
    }
}

/// Storage for learned checkpoint-approval preferences
///
/// Organization-scoped and independent of task lifetime. Reads scan and
/// aggregate; writes append decision records keyed by
/// `(user_id, preference_key)`.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Record an approval/rejection decision
    ///
    /// A consistent repeat strengthens the stored preference; a
    /// contradiction flips the decision and resets confidence.
    async fn record_decision(
        &self,
        user_id: &str,
        preference_key: &str,
        context: HashMap<String, Value>,
        decision: PreferenceDecision,
    ) -> Result<Preference>;

    /// Best preference for `(user_id, preference_key)` compatible with the
    /// query context, if any
    async fn find_matching(
        &self,
        user_id: &str,
        preference_key: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Option<PreferenceMatch>>;

    /// Bump a preference's usage counter after an auto-approval
    async fn increment_usage(&self, preference_id: &str) -> Result<()>;

    /// All preferences recorded for a user
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Preference>>;
}
