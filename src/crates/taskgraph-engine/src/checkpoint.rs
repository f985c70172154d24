//! Checkpoint coordinator - human-gated step dispatch
//!
//! Before a step with `checkpoint_required` is dispatched, the coordinator
//! is consulted. It either releases the step immediately (a learned
//! preference auto-approves it) or suspends the task behind a pending gate
//! until a human approves, rejects, or resolves it - or the gate expires.
//!
//! Gate lifecycle:
//!
//! ```text
//! pending ──► approved        (user approves / typed resolution)
//!         ──► auto_approved   (preference match, confidence ≥ 0.9)
//!         ──► rejected        (step fails, task fails)
//!         ──► expired         (sweep past expires_at; step and task fail)
//! ```
//!
//! Terminal decisions are final: a second approve/reject on the same gate
//! returns a conflict without altering state.
//!
//! Typed checkpoints attach the user's response to the step before it is
//! released: INPUT responses land in `checkpoint_inputs`, MODIFY rewrites
//! in `inputs_override`, SELECT indices in `selected_alternative`, QA
//! answers in `qa_answers`. Validation failures leave the gate untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use taskgraph_core::schema;
use taskgraph_core::task::{
    ApprovalType, CheckpointConfig, CheckpointType, StepPatch, StepStatus, Task, TaskPatch,
    TaskStatus, TaskStep,
};
use taskgraph_store::{PreferenceDecision, PreferenceStore, StoreError, TaskStore};

use crate::error::{EngineError, Result};
use crate::tree::ExecutionTreePublisher;

/// Minimum preference confidence for auto-approval
pub const AUTO_APPROVAL_THRESHOLD: f64 = 0.9;

/// Preview values longer than this are truncated for display
const PREVIEW_TRUNCATE_CHARS: usize = 500;

/// Decision state of one gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
    Expired,
}

impl CheckpointDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointDecision::Pending)
    }
}

/// Persistent state of one pending or decided gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub plan_id: String,
    pub step_id: String,
    pub user_id: String,
    pub checkpoint_name: String,
    pub description: String,
    pub checkpoint_type: CheckpointType,
    pub preference_key: String,
    pub decision: CheckpointDecision,
    /// Whitelisted step-input fields shown to the user
    pub preview_data: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Value>,
    // Type-specific schemas captured at gate creation for resolve-time
    // validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifiable_fields: Option<Vec<String>>,
    // Response payloads, by checkpoint type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_inputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_modified_inputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_selected_alternative: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_answers: Option<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub auto_approved: bool,
    /// Id of the preference that auto-approved this gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_used: Option<String>,
}

/// User response to a typed checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    /// True approves; false rejects with `feedback` as the reason
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_inputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_alternative: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<HashMap<String, String>>,
}

impl CheckpointResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Default::default()
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_modified_inputs(mut self, modified: HashMap<String, Value>) -> Self {
        self.modified_inputs = Some(modified);
        self
    }

    pub fn with_selected_alternative(mut self, index: usize) -> Self {
        self.selected_alternative = Some(index);
        self
    }

    pub fn with_answers(mut self, answers: HashMap<String, String>) -> Self {
        self.answers = Some(answers);
        self
    }
}

/// What the orchestrator should do with a gated step
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Gate auto-approved; the step may dispatch this cycle
    Released(CheckpointState),
    /// Gate pending; the task is suspended until resolution
    Suspended(CheckpointState),
}

/// Best-effort notification hook fired when a gate suspends
///
/// Failures never block gating; they are logged and dropped.
#[async_trait]
pub trait CheckpointNotifier: Send + Sync {
    async fn notify(&self, state: &CheckpointState) -> std::result::Result<(), String>;
}

type GateKey = (String, String);

/// Coordinates human-approval gates for checkpoint-required steps
pub struct CheckpointCoordinator {
    tasks: Arc<dyn TaskStore>,
    preferences: Arc<dyn PreferenceStore>,
    tree: Arc<ExecutionTreePublisher>,
    gates: Arc<RwLock<HashMap<GateKey, CheckpointState>>>,
    notifier: Option<Arc<dyn CheckpointNotifier>>,
}

impl CheckpointCoordinator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        preferences: Arc<dyn PreferenceStore>,
        tree: Arc<ExecutionTreePublisher>,
    ) -> Self {
        Self {
            tasks,
            preferences,
            tree,
            gates: Arc::new(RwLock::new(HashMap::new())),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CheckpointNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Consult the gate for a checkpoint-required step
    ///
    /// Auto-approval is only considered for `auto`/`timeout` approval
    /// types; `explicit` gates always wait for a human.
    pub async fn intercept(&self, task: &Task, step_id: &str) -> Result<GateOutcome> {
        let step = task
            .get_step(step_id)
            .ok_or_else(|| EngineError::InvalidState(format!("unknown step '{}'", step_id)))?;

        // An already-pending gate is returned as-is, not recreated
        {
            let gates = self.gates.read().await;
            if let Some(existing) = gates.get(&(task.id.clone(), step_id.to_string())) {
                if existing.decision == CheckpointDecision::Pending {
                    return Ok(GateOutcome::Suspended(existing.clone()));
                }
            }
        }

        let config = step.checkpoint_config.clone().unwrap_or_else(|| {
            CheckpointConfig::new(
                format!("step_{}_approval", step.id),
                format!("Approve step: {}", step.name),
            )
        });

        let preview = build_preview(step, &config);
        let context = build_context(step, &preview);

        if config.approval_type != ApprovalType::Explicit {
            if let Some(state) = self
                .try_auto_approve(task, step, &config, &preview, &context)
                .await?
            {
                return Ok(GateOutcome::Released(state));
            }
        }

        let expires_at = Utc::now() + ChronoDuration::minutes(config.timeout_minutes);
        let state = CheckpointState {
            plan_id: task.id.clone(),
            step_id: step.id.clone(),
            user_id: task.user_id.clone(),
            checkpoint_name: config.name.clone(),
            description: config.description.clone(),
            checkpoint_type: config.checkpoint_type,
            preference_key: config.effective_preference_key().to_string(),
            decision: CheckpointDecision::Pending,
            preview_data: preview,
            context_data: config.context_data.clone(),
            input_schema: config.input_schema.clone(),
            questions: config.questions.clone(),
            alternatives: config.alternatives.clone(),
            modifiable_fields: config.modifiable_fields.clone(),
            response_inputs: None,
            response_modified_inputs: None,
            response_selected_alternative: None,
            response_answers: None,
            created_at: Utc::now(),
            decided_at: None,
            expires_at: Some(expires_at),
            decided_by: None,
            feedback: None,
            auto_approved: false,
            preference_used: None,
        };

        self.gates
            .write()
            .await
            .insert((task.id.clone(), step.id.clone()), state.clone());

        let record = self
            .tasks
            .update_step(&task.id, &step.id, None, StepPatch::status(StepStatus::Checkpoint))
            .await?;
        self.tasks
            .update_task(&task.id, None, TaskPatch::status(TaskStatus::Checkpoint))
            .await?;
        if let Some(updated) = record.task.get_step(&step.id) {
            self.tree.publish_step(&task.id, updated).await;
        }

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&state).await {
                tracing::warn!(
                    plan_id = %task.id,
                    step_id = %step.id,
                    error = %e,
                    "checkpoint notification failed"
                );
            }
        }

        tracing::info!(
            plan_id = %task.id,
            step_id = %step.id,
            checkpoint = %state.checkpoint_name,
            expires_at = %expires_at,
            "checkpoint created (pending approval)"
        );
        Ok(GateOutcome::Suspended(state))
    }

    async fn try_auto_approve(
        &self,
        task: &Task,
        step: &TaskStep,
        config: &CheckpointConfig,
        preview: &HashMap<String, Value>,
        context: &HashMap<String, Value>,
    ) -> Result<Option<CheckpointState>> {
        // Preference-store failures are non-fatal; the gate just stays
        // explicit
        let matched = match self
            .preferences
            .find_matching(&task.user_id, config.effective_preference_key(), context)
            .await
        {
            Ok(matched) => matched,
            Err(e) => {
                tracing::warn!(
                    plan_id = %task.id,
                    step_id = %step.id,
                    error = %e,
                    "preference lookup failed; falling back to explicit gate"
                );
                return Ok(None);
            }
        };

        let Some(matched) = matched else {
            return Ok(None);
        };
        if matched.preference.decision != PreferenceDecision::Approved
            || matched.confidence < AUTO_APPROVAL_THRESHOLD
        {
            return Ok(None);
        }

        let now = Utc::now();
        let state = CheckpointState {
            plan_id: task.id.clone(),
            step_id: step.id.clone(),
            user_id: task.user_id.clone(),
            checkpoint_name: config.name.clone(),
            description: config.description.clone(),
            checkpoint_type: config.checkpoint_type,
            preference_key: config.effective_preference_key().to_string(),
            decision: CheckpointDecision::AutoApproved,
            preview_data: preview.clone(),
            context_data: config.context_data.clone(),
            input_schema: None,
            questions: None,
            alternatives: None,
            modifiable_fields: None,
            response_inputs: None,
            response_modified_inputs: None,
            response_selected_alternative: None,
            response_answers: None,
            created_at: now,
            decided_at: Some(now),
            expires_at: None,
            decided_by: None,
            feedback: None,
            auto_approved: true,
            preference_used: Some(matched.preference.id.clone()),
        };

        if let Err(e) = self.preferences.increment_usage(&matched.preference.id).await {
            tracing::warn!(error = %e, "failed to bump preference usage");
        }

        // Release the step so execution continues this cycle
        self.tasks
            .update_step(
                &task.id,
                &step.id,
                None,
                StepPatch {
                    checkpoint_required: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        self.gates
            .write()
            .await
            .insert((task.id.clone(), step.id.clone()), state.clone());

        tracing::info!(
            plan_id = %task.id,
            step_id = %step.id,
            preference_id = %matched.preference.id,
            confidence = matched.confidence,
            "checkpoint auto-approved"
        );
        Ok(Some(state))
    }

    /// Approve a pending gate; the step returns to the ready pool
    pub async fn approve(
        &self,
        plan_id: &str,
        step_id: &str,
        user_id: &str,
        feedback: Option<String>,
        learn_preference: bool,
    ) -> Result<CheckpointState> {
        let mut state = self.take_pending(plan_id, step_id).await?;
        state.decision = CheckpointDecision::Approved;
        state.decided_at = Some(Utc::now());
        state.decided_by = Some(user_id.to_string());
        state.feedback = feedback;
        self.commit_gate(&state).await;

        if learn_preference {
            self.record_preference(&state, user_id, PreferenceDecision::Approved)
                .await;
        }

        self.release_step(plan_id, step_id, StepPatch {
            checkpoint_required: Some(false),
            status: Some(StepStatus::Pending),
            ..Default::default()
        })
        .await?;
        self.tasks
            .update_task(plan_id, None, TaskPatch::status(TaskStatus::Executing))
            .await?;

        tracing::info!(plan_id, step_id, user_id, "checkpoint approved");
        Ok(state)
    }

    /// Reject a pending gate; the step and the task fail
    pub async fn reject(
        &self,
        plan_id: &str,
        step_id: &str,
        user_id: &str,
        reason: &str,
        learn_preference: bool,
    ) -> Result<CheckpointState> {
        let mut state = self.take_pending(plan_id, step_id).await?;
        state.decision = CheckpointDecision::Rejected;
        state.decided_at = Some(Utc::now());
        state.decided_by = Some(user_id.to_string());
        state.feedback = Some(reason.to_string());
        self.commit_gate(&state).await;

        if learn_preference {
            self.record_preference(&state, user_id, PreferenceDecision::Rejected)
                .await;
        }

        let record = self
            .tasks
            .update_step(
                plan_id,
                step_id,
                None,
                StepPatch::failed(format!("Rejected by user: {}", reason)),
            )
            .await?;
        self.mark_task_failed(plan_id).await?;
        if let Some(step) = record.task.get_step(step_id) {
            self.tree.publish_step(plan_id, step).await;
        }

        tracing::info!(plan_id, step_id, user_id, reason, "checkpoint rejected");
        Ok(state)
    }

    /// Resolve a typed gate with the user's response
    ///
    /// Validation failures leave the gate pending and unchanged.
    pub async fn resolve(
        &self,
        plan_id: &str,
        step_id: &str,
        user_id: &str,
        response: CheckpointResponse,
        learn_preference: bool,
    ) -> Result<CheckpointState> {
        if !response.approved {
            let reason = response
                .feedback
                .clone()
                .unwrap_or_else(|| "Rejected by user".to_string());
            return self
                .reject(plan_id, step_id, user_id, &reason, learn_preference)
                .await;
        }

        // Validate against the snapshot without consuming the gate
        {
            let gates = self.gates.read().await;
            let state = gates
                .get(&(plan_id.to_string(), step_id.to_string()))
                .ok_or_else(|| EngineError::CheckpointNotFound {
                    plan_id: plan_id.to_string(),
                    step_id: step_id.to_string(),
                })?;
            if state.decision.is_terminal() {
                return Err(EngineError::CheckpointConflict {
                    plan_id: plan_id.to_string(),
                    step_id: step_id.to_string(),
                    decision: state.decision,
                });
            }
            validate_response(state, &response)?;
        }

        let mut state = self.take_pending(plan_id, step_id).await?;
        state.decision = CheckpointDecision::Approved;
        state.decided_at = Some(Utc::now());
        state.decided_by = Some(user_id.to_string());
        state.feedback = response.feedback.clone();
        state.response_inputs = response.inputs.clone();
        state.response_modified_inputs = response.modified_inputs.clone();
        state.response_selected_alternative = response.selected_alternative;
        state.response_answers = response.answers.clone();
        self.commit_gate(&state).await;

        let mut patch = StepPatch {
            checkpoint_required: Some(false),
            status: Some(StepStatus::Pending),
            ..Default::default()
        };
        match state.checkpoint_type {
            CheckpointType::Modify => patch.inputs_override = response.modified_inputs,
            CheckpointType::Input => patch.checkpoint_inputs = response.inputs,
            CheckpointType::Select => patch.selected_alternative = response.selected_alternative,
            CheckpointType::Qa => patch.qa_answers = response.answers,
            CheckpointType::Approval => {}
        }
        self.release_step(plan_id, step_id, patch).await?;
        self.tasks
            .update_task(plan_id, None, TaskPatch::status(TaskStatus::Executing))
            .await?;

        if learn_preference {
            self.record_preference(&state, user_id, PreferenceDecision::Approved)
                .await;
        }

        tracing::info!(
            plan_id,
            step_id,
            user_id,
            checkpoint_type = ?state.checkpoint_type,
            "checkpoint resolved"
        );
        Ok(state)
    }

    /// All pending, unexpired gates, optionally filtered
    pub async fn list_pending(
        &self,
        user_id: Option<&str>,
        plan_id: Option<&str>,
    ) -> Vec<CheckpointState> {
        let now = Utc::now();
        let gates = self.gates.read().await;
        let mut pending: Vec<CheckpointState> = gates
            .values()
            .filter(|s| s.decision == CheckpointDecision::Pending)
            .filter(|s| s.expires_at.map(|e| now <= e).unwrap_or(true))
            .filter(|s| user_id.map(|u| s.user_id == u).unwrap_or(true))
            .filter(|s| plan_id.map(|p| s.plan_id == p).unwrap_or(true))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Reclassify pending gates past their deadline; gated steps fail
    pub async fn expire_sweep(&self) -> Result<Vec<CheckpointState>> {
        let now = Utc::now();
        let expired_keys: Vec<GateKey> = {
            let gates = self.gates.read().await;
            gates
                .values()
                .filter(|s| s.decision == CheckpointDecision::Pending)
                .filter(|s| s.expires_at.map(|e| now > e).unwrap_or(false))
                .map(|s| (s.plan_id.clone(), s.step_id.clone()))
                .collect()
        };

        let mut expired = Vec::with_capacity(expired_keys.len());
        for (plan_id, step_id) in expired_keys {
            let mut state = match self.take_pending(&plan_id, &step_id).await {
                Ok(state) => state,
                // Raced with a resolution; nothing to do
                Err(_) => continue,
            };
            state.decision = CheckpointDecision::Expired;
            state.decided_at = Some(now);
            self.commit_gate(&state).await;

            let record = self
                .tasks
                .update_step(
                    &plan_id,
                    &step_id,
                    None,
                    StepPatch::failed("Checkpoint expired without approval"),
                )
                .await?;
            self.mark_task_failed(&plan_id).await?;
            if let Some(step) = record.task.get_step(&step_id) {
                self.tree.publish_step(&plan_id, step).await;
            }

            tracing::warn!(plan_id = %plan_id, step_id = %step_id, "checkpoint expired");
            expired.push(state);
        }
        Ok(expired)
    }

    /// Look up a gate regardless of decision (audit)
    pub async fn get(&self, plan_id: &str, step_id: &str) -> Option<CheckpointState> {
        self.gates
            .read()
            .await
            .get(&(plan_id.to_string(), step_id.to_string()))
            .cloned()
    }

    /// Drop all gates owned by a task (task deletion)
    pub async fn remove_for_task(&self, plan_id: &str) {
        self.gates
            .write()
            .await
            .retain(|(gate_plan, _), _| gate_plan != plan_id);
    }

    /// Fail the owning task, tolerating an already-terminal status
    async fn mark_task_failed(&self, plan_id: &str) -> Result<()> {
        match self
            .tasks
            .update_task(plan_id, None, TaskPatch::status(TaskStatus::Failed))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::TerminalTask(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn take_pending(&self, plan_id: &str, step_id: &str) -> Result<CheckpointState> {
        let gates = self.gates.read().await;
        let state = gates
            .get(&(plan_id.to_string(), step_id.to_string()))
            .ok_or_else(|| EngineError::CheckpointNotFound {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        if state.decision.is_terminal() {
            return Err(EngineError::CheckpointConflict {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
                decision: state.decision,
            });
        }
        Ok(state.clone())
    }

    async fn commit_gate(&self, state: &CheckpointState) {
        self.gates
            .write()
            .await
            .insert((state.plan_id.clone(), state.step_id.clone()), state.clone());
    }

    async fn release_step(&self, plan_id: &str, step_id: &str, patch: StepPatch) -> Result<()> {
        let record = self.tasks.update_step(plan_id, step_id, None, patch).await?;
        if let Some(step) = record.task.get_step(step_id) {
            self.tree.publish_step(plan_id, step).await;
        }
        Ok(())
    }

    async fn record_preference(
        &self,
        state: &CheckpointState,
        user_id: &str,
        decision: PreferenceDecision,
    ) {
        let mut context: HashMap<String, Value> = state.preview_data.clone();
        context.insert(
            "checkpoint_name".to_string(),
            Value::String(state.checkpoint_name.clone()),
        );
        if let Some(feedback) = &state.feedback {
            context.insert("user_feedback".to_string(), Value::String(feedback.clone()));
        }
        // Preference-store failures never block gate resolution
        if let Err(e) = self
            .preferences
            .record_decision(user_id, &state.preference_key, context, decision)
            .await
        {
            tracing::warn!(
                plan_id = %state.plan_id,
                step_id = %state.step_id,
                error = %e,
                "failed to record preference"
            );
        }
    }
}

/// Build the whitelisted preview shown to the user
fn build_preview(step: &TaskStep, config: &CheckpointConfig) -> HashMap<String, Value> {
    let mut preview = HashMap::new();
    preview.insert(
        "agent_type".to_string(),
        Value::String(step.agent_type.clone()),
    );
    preview.insert("step_name".to_string(), Value::String(step.name.clone()));
    preview.insert(
        "description".to_string(),
        Value::String(step.description.clone()),
    );
    for field in &config.preview_fields {
        if let Some(value) = step.inputs.get(field) {
            preview.insert(field.clone(), truncate_preview(value));
        }
    }
    preview
}

fn truncate_preview(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > PREVIEW_TRUNCATE_CHARS => {
            let truncated: String = s.chars().take(PREVIEW_TRUNCATE_CHARS).collect();
            Value::String(format!("{}...", truncated))
        }
        other => other.clone(),
    }
}

/// Context used for preference matching
fn build_context(step: &TaskStep, preview: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut context = preview.clone();
    let mut keys: Vec<String> = step.inputs.keys().cloned().collect();
    keys.sort();
    context.insert(
        "inputs_keys".to_string(),
        Value::Array(keys.into_iter().map(Value::String).collect()),
    );
    context
}

/// Check a response's payload against the gate's type and schemas
fn validate_response(state: &CheckpointState, response: &CheckpointResponse) -> Result<()> {
    match state.checkpoint_type {
        CheckpointType::Approval => Ok(()),
        CheckpointType::Input => {
            let inputs = response
                .inputs
                .as_ref()
                .filter(|i| !i.is_empty())
                .ok_or_else(|| {
                    EngineError::ValidationFailed(
                        "input checkpoint requires 'inputs' in response".to_string(),
                    )
                })?;
            if let Some(input_schema) = &state.input_schema {
                let document = Value::Object(
                    inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
                schema::validate_document(&document, input_schema)
                    .map_err(EngineError::ValidationFailed)?;
            }
            Ok(())
        }
        CheckpointType::Modify => {
            let modified = response
                .modified_inputs
                .as_ref()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| {
                    EngineError::ValidationFailed(
                        "modify checkpoint requires 'modified_inputs' in response".to_string(),
                    )
                })?;
            if let Some(allowed) = &state.modifiable_fields {
                let mut extra: Vec<&String> = modified
                    .keys()
                    .filter(|k| !allowed.contains(k))
                    .collect();
                extra.sort();
                if !extra.is_empty() {
                    return Err(EngineError::ValidationFailed(format!(
                        "cannot modify fields outside modifiable_fields: {:?}",
                        extra
                    )));
                }
            }
            Ok(())
        }
        CheckpointType::Select => {
            let index = response.selected_alternative.ok_or_else(|| {
                EngineError::ValidationFailed(
                    "select checkpoint requires 'selected_alternative' in response".to_string(),
                )
            })?;
            match &state.alternatives {
                Some(alternatives) if index < alternatives.len() => Ok(()),
                Some(alternatives) => Err(EngineError::ValidationFailed(format!(
                    "selected_alternative must be 0-{}, got {}",
                    alternatives.len().saturating_sub(1),
                    index
                ))),
                None => Err(EngineError::ValidationFailed(
                    "select checkpoint has no alternatives configured".to_string(),
                )),
            }
        }
        CheckpointType::Qa => {
            let answers = response
                .answers
                .as_ref()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    EngineError::ValidationFailed(
                        "qa checkpoint requires 'answers' in response".to_string(),
                    )
                })?;
            if let Some(questions) = &state.questions {
                let mut unanswered: Vec<&String> = questions
                    .iter()
                    .filter(|q| !answers.contains_key(*q))
                    .collect();
                unanswered.sort();
                if !unanswered.is_empty() {
                    return Err(EngineError::ValidationFailed(format!(
                        "missing answers for questions: {:?}",
                        unanswered
                    )));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskgraph_store::{MemoryPreferenceStore, MemoryTaskStore, Preference};

    fn coordinator() -> (CheckpointCoordinator, Arc<MemoryTaskStore>, Arc<MemoryPreferenceStore>) {
        let tasks = Arc::new(MemoryTaskStore::new());
        let preferences = Arc::new(MemoryPreferenceStore::new());
        let tree = Arc::new(ExecutionTreePublisher::default());
        let coordinator =
            CheckpointCoordinator::new(tasks.clone(), preferences.clone(), tree);
        (coordinator, tasks, preferences)
    }

    fn gated_task(config: CheckpointConfig) -> Task {
        Task::new("user-1", "send the weekly email")
            .with_steps(vec![TaskStep::new("notify", "Send notification", "notify")
                .with_input("to", json!("x"))
                .with_input("subject", json!("draft"))
                .with_checkpoint(config)])
            .with_status(TaskStatus::Executing)
    }

    async fn seeded(config: CheckpointConfig) -> (CheckpointCoordinator, Arc<MemoryTaskStore>, Arc<MemoryPreferenceStore>, Task) {
        let (coordinator, tasks, preferences) = coordinator();
        let task = gated_task(config);
        tasks.create_task(task.clone()).await.unwrap();
        (coordinator, tasks, preferences, task)
    }

    #[tokio::test]
    async fn explicit_gate_suspends_task_and_step() {
        let config = CheckpointConfig::new("send_approval", "Approve sending");
        let (coordinator, tasks, _, task) = seeded(config).await;

        let outcome = coordinator.intercept(&task, "notify").await.unwrap();
        let state = match outcome {
            GateOutcome::Suspended(state) => state,
            other => panic!("expected suspension, got {:?}", other),
        };
        assert_eq!(state.decision, CheckpointDecision::Pending);
        assert!(state.expires_at.is_some());

        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(record.task.status, TaskStatus::Checkpoint);
        assert_eq!(
            record.task.get_step("notify").unwrap().status,
            StepStatus::Checkpoint
        );

        // Re-intercepting returns the same pending gate
        let again = coordinator.intercept(&record.task, "notify").await.unwrap();
        assert!(matches!(again, GateOutcome::Suspended(s) if s.created_at == state.created_at));
    }

    #[tokio::test]
    async fn auto_approval_with_seeded_preference() {
        let config = CheckpointConfig::new("notify_approval", "Approve sending")
            .with_approval_type(ApprovalType::Auto)
            .with_preference_key("notify_default");
        let (coordinator, tasks, preferences, task) = seeded(config).await;

        let mut context = HashMap::new();
        context.insert("agent_type".to_string(), json!("notify"));
        preferences
            .insert(
                Preference::new("user-1", "notify_default", context, PreferenceDecision::Approved)
                    .with_confidence(0.95)
                    .with_usage_count(10),
            )
            .await;

        let outcome = coordinator.intercept(&task, "notify").await.unwrap();
        let state = match outcome {
            GateOutcome::Released(state) => state,
            other => panic!("expected release, got {:?}", other),
        };
        assert_eq!(state.decision, CheckpointDecision::AutoApproved);
        assert!(state.auto_approved);
        assert!(state.preference_used.is_some());

        // Usage incremented to 11; step released, task not suspended
        let prefs = preferences.list_for_user("user-1").await.unwrap();
        assert_eq!(prefs[0].usage_count, 11);
        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        let step = record.task.get_step("notify").unwrap();
        assert!(!step.checkpoint_required);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(record.task.status, TaskStatus::Executing);
    }

    #[tokio::test]
    async fn low_confidence_preference_does_not_auto_approve() {
        let config = CheckpointConfig::new("notify_approval", "Approve sending")
            .with_approval_type(ApprovalType::Auto)
            .with_preference_key("notify_default");
        let (coordinator, _, preferences, task) = seeded(config).await;
        preferences
            .insert(
                Preference::new(
                    "user-1",
                    "notify_default",
                    HashMap::new(),
                    PreferenceDecision::Approved,
                )
                .with_confidence(0.7),
            )
            .await;
        let outcome = coordinator.intercept(&task, "notify").await.unwrap();
        assert!(matches!(outcome, GateOutcome::Suspended(_)));
    }

    #[tokio::test]
    async fn explicit_gates_skip_preference_lookup() {
        let config = CheckpointConfig::new("notify_approval", "Approve sending")
            .with_preference_key("notify_default");
        let (coordinator, _, preferences, task) = seeded(config).await;
        preferences
            .insert(
                Preference::new(
                    "user-1",
                    "notify_default",
                    HashMap::new(),
                    PreferenceDecision::Approved,
                )
                .with_confidence(1.0),
            )
            .await;
        let outcome = coordinator.intercept(&task, "notify").await.unwrap();
        assert!(matches!(outcome, GateOutcome::Suspended(_)));
    }

    #[tokio::test]
    async fn approve_releases_step_and_learns_preference() {
        let config = CheckpointConfig::new("send_approval", "Approve sending");
        let (coordinator, tasks, preferences, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        let state = coordinator
            .approve(&task.id, "notify", "user-1", Some("ship it".to_string()), true)
            .await
            .unwrap();
        assert_eq!(state.decision, CheckpointDecision::Approved);
        assert_eq!(state.decided_by.as_deref(), Some("user-1"));

        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(record.task.status, TaskStatus::Executing);
        let step = record.task.get_step("notify").unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(!step.checkpoint_required);

        assert_eq!(preferences.list_for_user("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_decision_is_a_conflict() {
        let config = CheckpointConfig::new("send_approval", "Approve sending");
        let (coordinator, _, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();
        coordinator
            .approve(&task.id, "notify", "user-1", None, false)
            .await
            .unwrap();

        let err = coordinator
            .approve(&task.id, "notify", "user-1", None, false)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let err = coordinator
            .reject(&task.id, "notify", "user-1", "too late", false)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn reject_fails_step_and_task() {
        let config = CheckpointConfig::new("send_approval", "Approve sending");
        let (coordinator, tasks, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        let state = coordinator
            .reject(&task.id, "notify", "user-1", "wrong recipient", true)
            .await
            .unwrap();
        assert_eq!(state.decision, CheckpointDecision::Rejected);

        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(record.task.status, TaskStatus::Failed);
        let step = record.task.get_step("notify").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(
            step.error_message.as_deref(),
            Some("Rejected by user: wrong recipient")
        );
    }

    #[tokio::test]
    async fn modify_resolution_stores_override_and_validates_fields() {
        let config = CheckpointConfig::new("edit_approval", "Review the draft")
            .with_checkpoint_type(CheckpointType::Modify)
            .with_modifiable_fields(vec!["subject".to_string()]);
        let (coordinator, tasks, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        // Modifying a non-whitelisted field is rejected without state change
        let mut bad = HashMap::new();
        bad.insert("to".to_string(), json!("attacker"));
        let err = coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_modified_inputs(bad),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
        let gate = coordinator.get(&task.id, "notify").await.unwrap();
        assert_eq!(gate.decision, CheckpointDecision::Pending);

        // Whitelisted modification goes through
        let mut good = HashMap::new();
        good.insert("subject".to_string(), json!("final"));
        let state = coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_modified_inputs(good.clone()),
                false,
            )
            .await
            .unwrap();
        assert_eq!(state.decision, CheckpointDecision::Approved);
        assert_eq!(state.response_modified_inputs, Some(good.clone()));

        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        let step = record.task.get_step("notify").unwrap();
        assert_eq!(step.inputs_override, Some(good));
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn input_resolution_validates_schema() {
        let config = CheckpointConfig::new("gather", "Collect recipient")
            .with_checkpoint_type(CheckpointType::Input)
            .with_input_schema(json!({
                "type": "object",
                "required": ["recipient"],
                "properties": {"recipient": {"type": "string"}}
            }));
        let (coordinator, tasks, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        let mut missing = HashMap::new();
        missing.insert("other".to_string(), json!("x"));
        let err = coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_inputs(missing),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));

        let mut inputs = HashMap::new();
        inputs.insert("recipient".to_string(), json!("alice@example.com"));
        coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_inputs(inputs.clone()),
                false,
            )
            .await
            .unwrap();
        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            record.task.get_step("notify").unwrap().checkpoint_inputs,
            Some(inputs)
        );
    }

    #[tokio::test]
    async fn select_resolution_checks_bounds() {
        let config = CheckpointConfig::new("choose", "Pick a variant")
            .with_checkpoint_type(CheckpointType::Select)
            .with_alternatives(vec![json!({"label": "a"}), json!({"label": "b"})]);
        let (coordinator, tasks, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        let err = coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_selected_alternative(5),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));

        coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_selected_alternative(1),
                false,
            )
            .await
            .unwrap();
        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            record.task.get_step("notify").unwrap().selected_alternative,
            Some(1)
        );
    }

    #[tokio::test]
    async fn qa_resolution_requires_every_answer() {
        let config = CheckpointConfig::new("clarify", "Answer questions")
            .with_checkpoint_type(CheckpointType::Qa)
            .with_questions(vec!["Who?".to_string(), "When?".to_string()]);
        let (coordinator, tasks, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        let mut partial = HashMap::new();
        partial.insert("Who?".to_string(), "alice".to_string());
        let err = coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_answers(partial),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));

        let mut full = HashMap::new();
        full.insert("Who?".to_string(), "alice".to_string());
        full.insert("When?".to_string(), "friday".to_string());
        coordinator
            .resolve(
                &task.id,
                "notify",
                "user-1",
                CheckpointResponse::approve().with_answers(full.clone()),
                false,
            )
            .await
            .unwrap();
        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(record.task.get_step("notify").unwrap().qa_answers, Some(full));
    }

    #[tokio::test]
    async fn expired_gates_fail_step_and_task() {
        let config =
            CheckpointConfig::new("send_approval", "Approve sending").with_timeout_minutes(0);
        let (coordinator, tasks, _, task) = seeded(config).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        // timeout_minutes = 0 expires immediately
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = coordinator.expire_sweep().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].decision, CheckpointDecision::Expired);

        let record = tasks.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(record.task.status, TaskStatus::Failed);
        assert_eq!(
            record.task.get_step("notify").unwrap().error_message.as_deref(),
            Some("Checkpoint expired without approval")
        );

        // Expired is terminal
        let err = coordinator
            .approve(&task.id, "notify", "user-1", None, false)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn list_pending_filters_by_user_and_plan() {
        let config = CheckpointConfig::new("send_approval", "Approve sending");
        let (coordinator, tasks, _, task) = seeded(config.clone()).await;
        coordinator.intercept(&task, "notify").await.unwrap();

        let mut other = gated_task(config);
        other.id = "other-task".to_string();
        other.user_id = "user-2".to_string();
        tasks.create_task(other.clone()).await.unwrap();
        coordinator.intercept(&other, "notify").await.unwrap();

        assert_eq!(coordinator.list_pending(None, None).await.len(), 2);
        assert_eq!(coordinator.list_pending(Some("user-1"), None).await.len(), 1);
        assert_eq!(
            coordinator.list_pending(None, Some(&task.id)).await.len(),
            1
        );
        assert!(coordinator
            .list_pending(Some("user-3"), None)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn preview_truncates_long_values() {
        let config = CheckpointConfig::new("send_approval", "Approve sending")
            .with_preview_fields(vec!["body".to_string()]);
        let step = TaskStep::new("notify", "Send", "notify")
            .with_input("body", json!("x".repeat(600)));
        let preview = build_preview(&step, &config);
        let body = preview.get("body").unwrap().as_str().unwrap();
        assert_eq!(body.chars().count(), PREVIEW_TRUNCATE_CHARS + 3);
        assert!(body.ends_with("..."));
    }
}
