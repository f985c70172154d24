//! The persistent task document - source of truth for autonomous execution
//!
//! A [`Task`] captures one goal broken into a DAG of typed [`TaskStep`]s,
//! plus the accumulated [`Finding`]s produced while executing them. The
//! document persists across orchestrator invocations: each decision cycle
//! loads it fresh, acts, writes it back, and exits.
//!
//! Key properties:
//! - Immutable version history via `parent_task_id` / `superseded_by`
//! - Steps reference each other only by id; no back-pointers
//! - Plan structure is validated at acceptance ([`Task::validate_plan`])
//! - Parallel execution via `parallel_group` on steps
//!
//! Partial updates travel as [`TaskPatch`] / [`StepPatch`] values so that
//! stores can merge them atomically under optimistic concurrency.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result, StepError};

/// Default cap on simultaneously running steps per task
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 5;

/// Default per-step retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default checkpoint timeout: 48 hours
pub const DEFAULT_CHECKPOINT_TIMEOUT_MINUTES: i64 = 2880;

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is being planned
    Planning,
    /// Plan accepted, ready to execute
    Ready,
    /// Task is running
    Executing,
    /// Manually paused
    Paused,
    /// Waiting for human approval
    Checkpoint,
    /// Successfully completed
    Completed,
    /// Failed with error
    Failed,
    /// Cancelled by user
    Cancelled,
    /// Replaced by a newer version via replan
    Superseded,
}

impl TaskStatus {
    /// Terminal tasks are immutable except for `superseded_by`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Superseded
        )
    }

    /// Stable wire name, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Planning => "planning",
            TaskStatus::Ready => "ready",
            TaskStatus::Executing => "executing",
            TaskStatus::Paused => "paused",
            TaskStatus::Checkpoint => "checkpoint",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Superseded => "superseded",
        }
    }
}

/// Status of an individual step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,
    /// Currently executing
    Running,
    /// Successfully completed
    Done,
    /// Failed with error
    Failed,
    /// Waiting for approval
    Checkpoint,
    /// Skipped (non-critical failure or rejected)
    Skipped,
    /// Expanded into dynamically planned children; counts as completed
    /// for dependency purposes
    Expanded,
}

impl StepStatus {
    /// Terminal step statuses never transition again within one lineage
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Skipped)
    }

    /// Whether dependents may treat this step as satisfied
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped | StepStatus::Expanded)
    }

    /// Stable wire name, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Checkpoint => "checkpoint",
            StepStatus::Skipped => "skipped",
            StepStatus::Expanded => "expanded",
        }
    }
}

/// Type of approval for checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// Always requires explicit approval
    #[default]
    Explicit,
    /// Approve automatically once the timeout elapses
    Timeout,
    /// Auto-approve based on learned preferences
    Auto,
}

/// Type of interactive checkpoint
///
/// Extends beyond binary approve/reject to richer interactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Binary approve/reject (default)
    #[default]
    Approval,
    /// Collect structured user input against a JSON schema
    Input,
    /// Allow the user to rewrite whitelisted step inputs
    Modify,
    /// Choose from predefined alternatives
    Select,
    /// Answer specific questions before proceeding
    Qa,
}

/// Policy for handling failures within a parallel step group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the entire group if any member fails
    #[default]
    AllOrNothing,
    /// Continue with partial results
    BestEffort,
    /// Cancel remaining members on first failure
    FailFast,
}

/// Ordered fallback options consumed left-to-right during recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FallbackConfig {
    /// Alternative models to rebind the step to
    #[serde(default)]
    pub models: Vec<String>,
    /// Alternative API endpoints
    #[serde(default)]
    pub apis: Vec<String>,
    /// Alternative approaches/strategies
    #[serde(default)]
    pub strategies: Vec<String>,
    /// Opt-in allowing retry/fallback of a non-idempotent handler
    #[serde(default)]
    pub retry_safe: bool,
}

/// One fallback choice, in consumption order: models, then apis, then
/// strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOption {
    Model(String),
    Api(String),
    Strategy(String),
}

impl FallbackConfig {
    pub fn has_options(&self) -> bool {
        !self.models.is_empty() || !self.apis.is_empty() || !self.strategies.is_empty()
    }

    /// Remove and return the next unused option
    pub fn take_next(&mut self) -> Option<FallbackOption> {
        if !self.models.is_empty() {
            return Some(FallbackOption::Model(self.models.remove(0)));
        }
        if !self.apis.is_empty() {
            return Some(FallbackOption::Api(self.apis.remove(0)));
        }
        if !self.strategies.is_empty() {
            return Some(FallbackOption::Strategy(self.strategies.remove(0)));
        }
        None
    }
}

/// Configuration for a checkpoint requiring human interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub approval_type: ApprovalType,
    /// Minutes until a pending gate expires (default 48h)
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i64,
    /// Key for learned-preference lookup; falls back to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_key: Option<String>,
    #[serde(default = "default_required_approvers")]
    pub required_approvers: u32,
    /// Step-input fields shown to the user in the preview
    #[serde(default)]
    pub preview_fields: Vec<String>,
    #[serde(default)]
    pub checkpoint_type: CheckpointType,
    /// JSON schema for INPUT checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Questions for QA checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<String>>,
    /// Options for SELECT checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<Value>>,
    /// Step-input keys the user may rewrite for MODIFY checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifiable_fields: Option<Vec<String>>,
    /// Free-form material shown to the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Value>,
}

fn default_timeout_minutes() -> i64 {
    DEFAULT_CHECKPOINT_TIMEOUT_MINUTES
}

fn default_required_approvers() -> u32 {
    1
}

impl CheckpointConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            approval_type: ApprovalType::default(),
            timeout_minutes: DEFAULT_CHECKPOINT_TIMEOUT_MINUTES,
            preference_key: None,
            required_approvers: 1,
            preview_fields: Vec::new(),
            checkpoint_type: CheckpointType::default(),
            input_schema: None,
            questions: None,
            alternatives: None,
            modifiable_fields: None,
            context_data: None,
        }
    }

    pub fn with_approval_type(mut self, approval_type: ApprovalType) -> Self {
        self.approval_type = approval_type;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn with_preference_key(mut self, key: impl Into<String>) -> Self {
        self.preference_key = Some(key.into());
        self
    }

    pub fn with_preview_fields(mut self, fields: Vec<String>) -> Self {
        self.preview_fields = fields;
        self
    }

    pub fn with_checkpoint_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_questions(mut self, questions: Vec<String>) -> Self {
        self.questions = Some(questions);
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<Value>) -> Self {
        self.alternatives = Some(alternatives);
        self
    }

    pub fn with_modifiable_fields(mut self, fields: Vec<String>) -> Self {
        self.modifiable_fields = Some(fields);
        self
    }

    pub fn with_context_data(mut self, context: Value) -> Self {
        self.context_data = Some(context);
        self
    }

    /// The key used for preference lookups
    pub fn effective_preference_key(&self) -> &str {
        self.preference_key.as_deref().unwrap_or(&self.name)
    }
}

/// Declarative rule mapping external events to cloned task instances
///
/// Stored under `task.metadata.trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Trigger category, free-form (e.g. "event")
    #[serde(rename = "type", default)]
    pub trigger_type: String,
    /// Glob over the event type, e.g. "ext.*"
    pub event_pattern: String,
    /// Events match when their source starts with this prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filter: Option<String>,
    /// Minimal JSONLogic condition evaluated against `{event}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default = "default_trigger_enabled")]
    pub enabled: bool,
}

fn default_trigger_enabled() -> bool {
    true
}

/// Metadata key holding a task's [`TriggerConfig`]
pub const TRIGGER_METADATA_KEY: &str = "trigger";

/// Metadata key holding the payload of the event that instantiated a clone
pub const TRIGGER_EVENT_METADATA_KEY: &str = "trigger_event";

/// Single step in a task execution plan
///
/// Each step is executed by one capability handler with fresh context.
/// `dependencies` controls ordering; `parallel_group` only groups steps
/// that have no dependencies between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Logical capability name (http_fetch, summarize, notify, ...)
    pub agent_type: String,
    /// Optional disambiguator for cross-domain capability resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    /// Rewrites applied by a MODIFY checkpoint; merged over `inputs` at
    /// materialization time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_override: Option<HashMap<String, Value>>,
    /// Structured user input collected by an INPUT checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_inputs: Option<HashMap<String, Value>>,
    /// Zero-based choice recorded by a SELECT checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_alternative: Option<usize>,
    /// Answers recorded by a QA checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_answers: Option<HashMap<String, String>>,
    /// Ids of steps that must complete before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    /// Steps sharing a non-null group are dispatched concurrently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub checkpoint_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_config: Option<CheckpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_config: Option<FallbackConfig>,
    /// If false, the step may be skipped on failure
    #[serde(default = "default_is_critical")]
    pub is_critical: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
}

fn default_is_critical() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Pending
    }
}

impl TaskStep {
    /// Create a new pending step
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        let mut id = id.into();
        if id.is_empty() {
            id = format!("step_{}", &Uuid::new_v4().to_string()[..8]);
        }
        Self {
            id,
            name: name.into(),
            description: String::new(),
            agent_type: agent_type.into(),
            domain: None,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            inputs_override: None,
            checkpoint_inputs: None,
            selected_alternative: None,
            qa_answers: None,
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            parallel_group: None,
            failure_policy: FailurePolicy::default(),
            checkpoint_required: false,
            checkpoint_config: None,
            fallback_config: None,
            is_critical: true,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_message: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_checkpoint(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint_required = true;
        self.checkpoint_config = Some(config);
        self
    }

    pub fn with_fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback_config = Some(config);
        self
    }

    pub fn with_is_critical(mut self, is_critical: bool) -> Self {
        self.is_critical = is_critical;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Ready iff pending and every dependency is satisfied
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.status == StepStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// An observation accumulated during task execution
///
/// Findings are append-only and persist across orchestrator invocations;
/// they are the only channel by which handler output survives beyond a
/// single step when not explicitly consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    #[serde(default)]
    pub step_id: String,
    /// Finding category: usually the producing agent_type, or an
    /// orchestrator-reserved type such as "replan" or "warning"
    #[serde(rename = "type")]
    pub finding_type: String,
    #[serde(default)]
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    pub fn new(step_id: impl Into<String>, finding_type: impl Into<String>, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            finding_type: finding_type.into(),
            content,
            timestamp: Utc::now(),
        }
    }
}

/// The persistent task document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Monotonic within a lineage; replans produce version + 1
    #[serde(default = "default_version")]
    pub version: u32,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub goal: String,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub accumulated_findings: Vec<Finding>,
    /// Advisory cursor; true readiness is computed from step statuses
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,
    /// Links to the execution-tree projection for observers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<String>,
    /// The task this one replaced (set on replan successors)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Id of the task that replaced this one (set when superseded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Templates are never executed directly, only cloned by triggers
    #[serde(default)]
    pub is_template: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    1
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Planning
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL_STEPS
}

impl Task {
    /// Create a new task in planning state
    pub fn new(user_id: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            version: 1,
            user_id: user_id.into(),
            organization_id: None,
            goal: goal.into(),
            constraints: HashMap::new(),
            success_criteria: Vec::new(),
            steps: Vec::new(),
            accumulated_findings: Vec::new(),
            current_step_index: 0,
            status: TaskStatus::Planning,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            tree_id: None,
            parent_task_id: None,
            superseded_by: None,
            metadata: HashMap::new(),
            is_template: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<TaskStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max;
        self
    }

    pub fn with_constraints(mut self, constraints: HashMap<String, Value>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_trigger(mut self, trigger: &TriggerConfig) -> Result<Self> {
        let value = serde_json::to_value(trigger)?;
        self.metadata.insert(TRIGGER_METADATA_KEY.to_string(), value);
        self.is_template = true;
        Ok(self)
    }

    /// Parse the trigger configuration out of metadata, if present
    pub fn trigger_config(&self) -> Option<TriggerConfig> {
        self.metadata
            .get(TRIGGER_METADATA_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The event payload injected when this task was cloned by a trigger
    pub fn trigger_event(&self) -> Option<&Value> {
        self.metadata.get(TRIGGER_EVENT_METADATA_KEY)
    }

    pub fn get_step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn get_step_mut(&mut self, step_id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Ids of steps whose status satisfies dependents
    pub fn completed_step_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status.satisfies_dependency())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Number of steps currently running
    pub fn running_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    /// Completion percentage over all steps
    pub fn progress_percentage(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count();
        (done as f64 / self.steps.len() as f64) * 100.0
    }

    /// Whether every step has reached a dependency-satisfying or failed state
    pub fn all_steps_settled(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.status.satisfies_dependency() || s.status == StepStatus::Failed)
    }

    pub fn add_finding(&mut self, finding: Finding) {
        self.accumulated_findings.push(finding);
        self.updated_at = Utc::now();
    }

    /// Validate the plan structure at acceptance time
    ///
    /// Enforces: non-empty user/goal, unique step ids, and that every
    /// dependency refers to an earlier-declared step id. The declaration
    /// ordering rule makes the graph acyclic by construction; forward and
    /// unknown references are reported individually.
    pub fn validate_plan(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(CoreError::Validation("user_id is required".to_string()));
        }
        if self.goal.is_empty() {
            return Err(CoreError::Validation("goal is required".to_string()));
        }

        let mut declared: HashSet<&str> = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(CoreError::Validation("step id must not be empty".to_string()));
            }
            if !declared.insert(step.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            for dep in &step.dependencies {
                if dep == &step.id {
                    return Err(CoreError::Validation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !declared.contains(dep.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "step '{}' dependency '{}' must refer to an earlier-declared step",
                        step.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record a step failure message without deciding recovery
    pub fn record_step_error(&mut self, step_id: &str, error: &StepError) {
        if let Some(step) = self.get_step_mut(step_id) {
            step.error_message = Some(error.to_string());
        }
        self.updated_at = Utc::now();
    }

    /// Render a compact XML view of the plan for planner prompts
    ///
    /// Shows structure and progress, not payloads; planners replanning a
    /// task get inputs and outputs separately through the replan context.
    pub fn to_xml(&self) -> String {
        let mut steps_xml = String::new();
        for step in &self.steps {
            let mut attrs = format!("id=\"{}\" status=\"{}\"", step.id, step.status.as_str());
            if let Some(domain) = &step.domain {
                attrs.push_str(&format!(" domain=\"{}\"", domain));
            }
            if let Some(group) = &step.parallel_group {
                attrs.push_str(&format!(" parallel_group=\"{}\"", group));
            }
            steps_xml.push_str(&format!(
                "    <step {}>\n      <name>{}</name>\n      <description>{}</description>\n      <agent_type>{}</agent_type>\n      <checkpoint_required>{}</checkpoint_required>\n    </step>\n",
                attrs,
                xml_escape(&step.name),
                xml_escape(&step.description),
                step.agent_type,
                step.checkpoint_required,
            ));
        }
        format!(
            "<task id=\"{}\" version=\"{}\">\n  <goal>{}</goal>\n  <status>{}</status>\n  <progress_pct>{:.1}</progress_pct>\n  <max_parallel_steps>{}</max_parallel_steps>\n  <steps>\n{}  </steps>\n</task>",
            self.id,
            self.version,
            xml_escape(&self.goal),
            self.status.as_str(),
            self.progress_percentage(),
            self.max_parallel_steps,
            steps_xml,
        )
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Partial update of top-level task fields
///
/// `None` leaves a field untouched; metadata entries are merged over the
/// existing map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<String>,
    /// Keys merged into task metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn superseded_by(task_id: impl Into<String>) -> Self {
        Self {
            superseded_by: Some(task_id.into()),
            ..Default::default()
        }
    }

    /// Merge into a task document; bumps `updated_at`
    pub fn apply(self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
            if status == TaskStatus::Completed && task.completed_at.is_none() {
                task.completed_at = Some(Utc::now());
            }
        }
        if let Some(index) = self.current_step_index {
            task.current_step_index = index;
        }
        if let Some(max) = self.max_parallel_steps {
            task.max_parallel_steps = max;
        }
        if let Some(superseded_by) = self.superseded_by {
            task.superseded_by = Some(superseded_by);
        }
        if let Some(tree_id) = self.tree_id {
            task.tree_id = Some(tree_id);
        }
        if let Some(metadata) = self.metadata {
            task.metadata.extend(metadata);
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = Some(completed_at);
        }
        task.updated_at = Utc::now();
    }
}

/// Partial update of a single step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_override: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_inputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_alternative: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_answers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_config: Option<FallbackConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// True clears any recorded error message
    #[serde(default)]
    pub clear_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
}

impl StepPatch {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(StepStatus::Failed),
            error_message: Some(message.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn done(outputs: HashMap<String, Value>) -> Self {
        Self {
            status: Some(StepStatus::Done),
            outputs: Some(outputs),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn apply(self, step: &mut TaskStep) {
        if let Some(status) = self.status {
            step.status = status;
        }
        if let Some(outputs) = self.outputs {
            step.outputs = outputs;
        }
        if let Some(inputs) = self.inputs {
            step.inputs = inputs;
        }
        if let Some(inputs_override) = self.inputs_override {
            step.inputs_override = Some(inputs_override);
        }
        if let Some(checkpoint_inputs) = self.checkpoint_inputs {
            step.checkpoint_inputs = Some(checkpoint_inputs);
        }
        if let Some(selected) = self.selected_alternative {
            step.selected_alternative = Some(selected);
        }
        if let Some(answers) = self.qa_answers {
            step.qa_answers = Some(answers);
        }
        if let Some(required) = self.checkpoint_required {
            step.checkpoint_required = required;
        }
        if let Some(fallback) = self.fallback_config {
            step.fallback_config = Some(fallback);
        }
        if let Some(retry_count) = self.retry_count {
            step.retry_count = retry_count;
        }
        if let Some(error_message) = self.error_message {
            step.error_message = Some(error_message);
        }
        if self.clear_error {
            step.error_message = None;
        }
        if let Some(started_at) = self.started_at {
            step.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            step.completed_at = Some(completed_at);
        }
        if let Some(execution_time_ms) = self.execution_time_ms {
            step.execution_time_ms = Some(execution_time_ms);
        }
    }
}
