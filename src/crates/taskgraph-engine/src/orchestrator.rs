//! Orchestrator - the top-level decision loop
//!
//! One cycle per iteration: load the task fresh, compute the ready set,
//! gate checkpoint-required steps, dispatch runners up to the concurrency
//! budget, then drain exactly one completion event and re-evaluate from
//! committed state. The orchestrator is the sole mutator of a task's
//! document; runners report through a bounded queue and never touch the
//! store.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ drive(task)                                                  │
//! │   load ──► terminal? ──► ready groups ──► gate / dispatch    │
//! │    ▲                                          │              │
//! │    │        ┌──────────────┐     spawn        ▼              │
//! │    └────────┤ completion   │◄───────── dispatch futures      │
//! │   persist   │ queue (mpsc) │            (retry/fallback      │
//! │             └──────────────┘             loops inside)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tactical recovery (retry backoff, fallback rebinding, modify rounds)
//! happens inside the dispatch future against its own snapshot; only
//! terminal dispositions (skip, replan, abort) travel back on the queue.
//! Writes go through compare-and-swap with reload-and-retry on conflict,
//! so resolution arriving from the checkpoint API mid-cycle is never lost.
//!
//! The loop is resumable: a crash between cycles leaves a consistent
//! document, and `running` steps found stale past the liveness deadline on
//! restart are reclassified as lost and routed through the failure
//! controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use taskgraph_core::capability::{CancelSource, CancelToken, CapabilityRegistry, ProgressUpdate};
use taskgraph_core::error::{ErrorKind, StepError};
use taskgraph_core::scheduler::{self, DispatchTracker};
use taskgraph_core::task::{
    FailurePolicy, FallbackConfig, FallbackOption, Finding, StepPatch, StepStatus, Task,
    TaskPatch, TaskStatus,
};
use taskgraph_store::{PreferenceStore, StoreError, TaskRecord, TaskStore};

use crate::checkpoint::{CheckpointCoordinator, GateOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::recovery::{FailureContext, FailureController, InputReviser, RecoveryAction};
use crate::replan::{execute_replan, Planner, ReplanContext};
use crate::runner::{RunSuccess, StepRunner};
use crate::tree::ExecutionTreePublisher;
use crate::trigger::{Event, TriggerBinding};

/// Finding type for handler progress callbacks
const PROGRESS_FINDING_TYPE: &str = "progress";
/// Finding type for recovery decisions worth surfacing
const RECOVERY_FINDING_TYPE: &str = "recovery";
/// Finding type for undeclared-output warnings
const WARNING_FINDING_TYPE: &str = "warning";

/// Terminal disposition a dispatch future can report for a failure
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    Skip,
    Replan,
    Abort,
}

#[derive(Debug)]
enum CompletionOutcome {
    Success {
        success: RunSuccess,
        attempts_used: u32,
        fallback_remaining: Option<FallbackConfig>,
        fallback_consumed: Vec<FallbackOption>,
    },
    Failure {
        error: StepError,
        attempts_used: u32,
        fallback_remaining: Option<FallbackConfig>,
        disposition: Disposition,
        reason: String,
    },
    Cancelled,
}

#[derive(Debug)]
struct StepCompletion {
    step_id: String,
    elapsed_ms: i64,
    outcome: CompletionOutcome,
}

enum DriveOutcome {
    /// Task reached a resting state (terminal, paused, or gated)
    Settled(TaskRecord),
    /// Task was replaced by a replan; continue on the successor
    Superseded(String),
}

/// What a user sees when asking why a task failed
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailureReport {
    pub task_id: String,
    pub status: TaskStatus,
    /// The step whose failure settled the task's fate, if any
    pub failed_step_id: Option<String>,
    pub error_message: Option<String>,
    /// The last two findings, for context
    pub recent_findings: Vec<Finding>,
    /// Version lineage, newest first (this task, then its ancestors)
    pub lineage: Vec<String>,
}

/// The autonomous execution engine
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    registry: Arc<CapabilityRegistry>,
    runner: StepRunner,
    checkpoints: Arc<CheckpointCoordinator>,
    controller: Arc<FailureController>,
    planner: Option<Arc<dyn Planner>>,
    tree: Arc<ExecutionTreePublisher>,
    triggers: Arc<TriggerBinding>,
    config: EngineConfig,
    inflight: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        preferences: Arc<dyn PreferenceStore>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self::with_config(store, preferences, registry, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn TaskStore>,
        preferences: Arc<dyn PreferenceStore>,
        registry: Arc<CapabilityRegistry>,
        config: EngineConfig,
    ) -> Self {
        let tree = Arc::new(ExecutionTreePublisher::default());
        let checkpoints = Arc::new(CheckpointCoordinator::new(
            store.clone(),
            preferences,
            tree.clone(),
        ));
        let runner = StepRunner::new(
            registry.clone(),
            config.step_timeout(),
            config.cancellation_grace(),
        );
        let triggers = Arc::new(TriggerBinding::new(store.clone()));
        let inflight = Arc::new(Semaphore::new(config.global_inflight_cap));
        Self {
            store,
            registry,
            runner,
            checkpoints,
            controller: Arc::new(FailureController::default()),
            planner: None,
            tree,
            triggers,
            config,
            inflight,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_reviser(mut self, reviser: Arc<dyn InputReviser>) -> Self {
        self.controller = Arc::new(
            FailureController::new(taskgraph_core::RetryPolicy::default()).with_reviser(reviser),
        );
        self
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointCoordinator> {
        &self.checkpoints
    }

    pub fn tree(&self) -> &Arc<ExecutionTreePublisher> {
        &self.tree
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Accept a planned task: validate, persist, and index its trigger
    ///
    /// Templates stay dormant until an event clones them; everything else
    /// becomes ready for [`run_task`](Self::run_task).
    pub async fn submit(&self, mut task: Task) -> Result<String> {
        task.validate_plan()?;
        if !task.is_template {
            task.status = TaskStatus::Ready;
        }
        let is_template = task.is_template;
        let snapshot = task.clone();
        let id = self.store.create_task(task).await?;
        if is_template {
            self.triggers.register(&snapshot).await?;
        }
        Ok(id)
    }

    /// Route an external event through the trigger bindings
    ///
    /// Returns the ids of cloned task instances ready to run.
    pub async fn handle_event(&self, event: &Event) -> Result<Vec<String>> {
        self.triggers.handle_event(event).await
    }

    /// Drive a task until it settles: terminal, gated on a checkpoint, or
    /// paused
    ///
    /// Replans are followed transparently - when the task is superseded,
    /// the loop resumes on the successor and returns its record.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskRecord> {
        let mut current = task_id.to_string();
        loop {
            match self.drive(&current).await? {
                DriveOutcome::Settled(record) => return Ok(record),
                DriveOutcome::Superseded(next) => {
                    tracing::info!(from = %current, to = %next, "following replan lineage");
                    current = next;
                }
            }
        }
    }

    /// Request cooperative cancellation of a task
    pub async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.load(task_id).await?;
        if record.task.status.is_terminal() {
            return Ok(record);
        }
        Ok(self
            .commit_task_patch(task_id, TaskPatch::status(TaskStatus::Cancelled))
            .await?)
    }

    /// Pause a task; in-flight steps finish, nothing new starts
    pub async fn pause_task(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.load(task_id).await?;
        match record.task.status {
            TaskStatus::Ready | TaskStatus::Executing => Ok(self
                .commit_task_patch(task_id, TaskPatch::status(TaskStatus::Paused))
                .await?),
            other => Err(EngineError::InvalidState(format!(
                "cannot pause task in status {:?}",
                other
            ))),
        }
    }

    /// Resume a paused task; call [`run_task`](Self::run_task) afterwards
    pub async fn resume_task(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.load(task_id).await?;
        match record.task.status {
            TaskStatus::Paused => Ok(self
                .commit_task_patch(task_id, TaskPatch::status(TaskStatus::Executing))
                .await?),
            other => Err(EngineError::InvalidState(format!(
                "cannot resume task in status {:?}",
                other
            ))),
        }
    }

    /// Restart recovery: reclassify steps stuck `running` past the
    /// liveness deadline and route them through the failure controller
    ///
    /// Returns the ids of affected tasks.
    pub async fn recover_stale(&self) -> Result<Vec<String>> {
        let deadline = chrono::Duration::from_std(self.config.liveness_deadline())
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let now = Utc::now();
        let mut affected = Vec::new();
        for record in self.store.list_active().await? {
            let stale: Vec<String> = record
                .task
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Running)
                .filter(|s| {
                    s.started_at
                        .map(|started| now - started > deadline)
                        .unwrap_or(true)
                })
                .map(|s| s.id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }
            for step_id in stale {
                tracing::warn!(
                    task_id = %record.task.id,
                    step_id = %step_id,
                    "reclassifying lost execution"
                );
                self.apply_lost_execution(&record.task.id, &step_id).await?;
            }
            affected.push(record.task.id.clone());
        }
        Ok(affected)
    }

    /// Rebuild the trigger index from stored templates (restart recovery)
    pub async fn reindex_triggers(&self) -> Result<usize> {
        self.triggers.rebuild_from_store().await
    }

    /// Summarize a task's failure for presentation
    pub async fn failure_report(&self, task_id: &str) -> Result<FailureReport> {
        let record = self.load(task_id).await?;
        let task = &record.task;
        let failed_step = task
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed && s.error_message.is_some())
            .or_else(|| task.steps.iter().find(|s| s.status == StepStatus::Failed));
        let recent_findings = task
            .accumulated_findings
            .iter()
            .rev()
            .take(2)
            .rev()
            .cloned()
            .collect();
        let lineage = self
            .store
            .version_history(task_id, 10)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        Ok(FailureReport {
            task_id: task.id.clone(),
            status: task.status,
            failed_step_id: failed_step.map(|s| s.id.clone()),
            error_message: failed_step.and_then(|s| s.error_message.clone()),
            recent_findings,
            lineage,
        })
    }

    /// Spawn the periodic checkpoint expiration sweep
    pub fn spawn_expiration_sweeper(&self) -> JoinHandle<()> {
        let coordinator = self.checkpoints.clone();
        let interval = self.config.checkpoint_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match coordinator.expire_sweep().await {
                    Ok(expired) if !expired.is_empty() => {
                        tracing::info!(count = expired.len(), "expired checkpoints swept");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "checkpoint sweep failed"),
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // The decision cycle
    // ------------------------------------------------------------------

    async fn drive(&self, task_id: &str) -> Result<DriveOutcome> {
        let (completion_tx, mut completion_rx) =
            mpsc::channel::<StepCompletion>(self.config.completion_queue_capacity);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let mut tracker = DispatchTracker::new();
        let mut cancels: HashMap<String, CancelSource> = HashMap::new();

        loop {
            let record = self.load(task_id).await?;
            let task = record.task.clone();

            if task.status == TaskStatus::Superseded {
                let next = task.superseded_by.clone().ok_or_else(|| {
                    EngineError::InvalidState(format!(
                        "task '{}' superseded without successor",
                        task_id
                    ))
                })?;
                return Ok(DriveOutcome::Superseded(next));
            }
            if task.status.is_terminal() {
                self.wind_down(task_id, &mut tracker, &mut cancels, &mut completion_rx)
                    .await?;
                return Ok(DriveOutcome::Settled(self.load(task_id).await?));
            }

            match task.status {
                TaskStatus::Planning => {
                    if task.steps.is_empty() {
                        return Err(EngineError::InvalidState(format!(
                            "task '{}' has no plan to execute",
                            task_id
                        )));
                    }
                    self.commit_task_patch(task_id, TaskPatch::status(TaskStatus::Ready))
                        .await?;
                    continue;
                }
                TaskStatus::Ready => {
                    self.commit_task_patch(task_id, TaskPatch::status(TaskStatus::Executing))
                        .await?;
                    continue;
                }
                TaskStatus::Paused | TaskStatus::Checkpoint => {
                    if tracker.in_flight() == 0 {
                        return Ok(DriveOutcome::Settled(record));
                    }
                    // Drain in-flight work below; no new dispatches
                }
                TaskStatus::Executing => {
                    if self.reclassify_orphans(&task, &tracker).await? {
                        continue;
                    }
                }
                _ => {}
            }

            let mut dispatched_any = false;
            if task.status == TaskStatus::Executing {
                for step_id in scheduler::plan_dispatches(&task, &tracker) {
                    let Some(step) = task.get_step(&step_id) else {
                        continue;
                    };

                    if step.checkpoint_required {
                        match self.checkpoints.intercept(&task, &step_id).await? {
                            GateOutcome::Suspended(_) => continue,
                            GateOutcome::Released(_) => {}
                        }
                    }

                    // Global backpressure: out of permits means no more
                    // starts this cycle
                    let Ok(permit) = self.inflight.clone().try_acquire_owned() else {
                        tracing::debug!(task_id, "global in-flight cap reached; deferring");
                        break;
                    };

                    let fresh = self
                        .commit_step_patch(
                            task_id,
                            &step_id,
                            StepPatch {
                                status: Some(StepStatus::Running),
                                started_at: Some(Utc::now()),
                                clear_error: true,
                                ..Default::default()
                            },
                        )
                        .await?;
                    if let Some(updated) = fresh.task.get_step(&step_id) {
                        self.tree.publish_step(task_id, updated).await;
                    }

                    tracker.mark_scheduled(&step_id);
                    let (source, token) = CancelSource::new();
                    cancels.insert(step_id.clone(), source);

                    let suppress_tactical = fresh
                        .task
                        .get_step(&step_id)
                        .map(|s| {
                            s.parallel_group.is_some()
                                && s.failure_policy == FailurePolicy::AllOrNothing
                        })
                        .unwrap_or(false);

                    tokio::spawn(dispatch_step(
                        self.runner.clone(),
                        self.controller.clone(),
                        fresh.task,
                        step_id.clone(),
                        token,
                        permit,
                        completion_tx.clone(),
                        progress_tx.clone(),
                        suppress_tactical,
                    ));
                    dispatched_any = true;
                }
            }

            if tracker.in_flight() == 0 {
                let record = self.load(task_id).await?;
                let task = &record.task;
                match task.status {
                    TaskStatus::Paused | TaskStatus::Checkpoint => {
                        return Ok(DriveOutcome::Settled(record));
                    }
                    TaskStatus::Superseded => {
                        let next = task.superseded_by.clone().ok_or_else(|| {
                            EngineError::InvalidState("superseded without successor".to_string())
                        })?;
                        return Ok(DriveOutcome::Superseded(next));
                    }
                    s if s.is_terminal() => return Ok(DriveOutcome::Settled(record)),
                    _ => {}
                }
                let has_ready = !scheduler::ready_groups(task).is_empty();
                if !has_ready && task.running_count() == 0 {
                    let finalized = self.finalize(task_id).await?;
                    return Ok(DriveOutcome::Settled(finalized));
                }
                if !dispatched_any {
                    // Blocked on backpressure or a liveness wait
                    tokio::time::sleep(self.config.scheduler_tick()).await;
                }
                continue;
            }

            tokio::select! {
                Some(completion) = completion_rx.recv() => {
                    self.handle_completion(task_id, completion, &mut tracker, &mut cancels)
                        .await?;
                }
                Some(progress) = progress_rx.recv() => {
                    self.record_progress(task_id, progress).await;
                }
                _ = tokio::time::sleep(self.config.scheduler_tick()) => {
                    // Re-load to notice cancellation and pauses promptly
                }
            }
        }
    }

    async fn record_progress(&self, task_id: &str, progress: ProgressUpdate) {
        let finding = Finding::new(progress.step_id, PROGRESS_FINDING_TYPE, progress.content);
        if let Err(e) = self.store.append_finding(task_id, finding).await {
            tracing::warn!(task_id, error = %e, "failed to record progress finding");
        }
    }

    /// Steps `running` in the document but unknown to this driver are
    /// orphans from a previous process. Past the liveness deadline they are
    /// reclassified as lost; younger ones are waited out.
    ///
    /// Returns whether the document changed (caller should reload).
    async fn reclassify_orphans(&self, task: &Task, tracker: &DispatchTracker) -> Result<bool> {
        let deadline = chrono::Duration::from_std(self.config.liveness_deadline())
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let now = Utc::now();
        let mut changed = false;
        for step in &task.steps {
            if step.status != StepStatus::Running || tracker.is_scheduled(&step.id) {
                continue;
            }
            let expired = step
                .started_at
                .map(|started| now - started > deadline)
                .unwrap_or(true);
            if expired {
                self.apply_lost_execution(&task.id, &step.id).await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Reclassify one lost execution and apply the controller's proposal
    async fn apply_lost_execution(&self, task_id: &str, step_id: &str) -> Result<()> {
        let record = self.load(task_id).await?;
        let Some(step) = record.task.get_step(step_id).cloned() else {
            return Ok(());
        };
        let error = StepError::execution_lost();
        let fallback = step.fallback_config.clone().unwrap_or_default();
        let proposal = self
            .controller
            .decide(FailureContext {
                step: &step,
                error: &error,
                attempts: step.retry_count,
                side_effect: self.runner.side_effect_class(&step),
                fallback: &fallback,
                current_inputs: &step.inputs,
            })
            .await;

        match proposal.action {
            RecoveryAction::Retry { .. } => {
                self.commit_step_patch(
                    task_id,
                    step_id,
                    StepPatch {
                        status: Some(StepStatus::Pending),
                        retry_count: Some(step.retry_count + 1),
                        error_message: Some(error.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            }
            RecoveryAction::Fallback => {
                let mut remaining = fallback;
                let rebind = remaining.take_next().map(fallback_rebind);
                let mut inputs = step.inputs.clone();
                if let Some(rebind) = rebind {
                    inputs.extend(rebind);
                }
                self.commit_step_patch(
                    task_id,
                    step_id,
                    StepPatch {
                        status: Some(StepStatus::Pending),
                        inputs: Some(inputs),
                        fallback_config: Some(remaining),
                        retry_count: Some(0),
                        error_message: Some(error.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            }
            RecoveryAction::Modify { inputs } => {
                self.commit_step_patch(
                    task_id,
                    step_id,
                    StepPatch {
                        status: Some(StepStatus::Pending),
                        inputs_override: Some(inputs),
                        error_message: Some(error.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            }
            RecoveryAction::Skip => {
                self.skip_step(task_id, step_id, &error, &proposal.reason)
                    .await?;
            }
            RecoveryAction::Replan => {
                self.fail_step(task_id, step_id, &error).await?;
                self.escalate_replan(task_id, step_id, &error).await?;
            }
            RecoveryAction::Abort => {
                self.fail_step(task_id, step_id, &error).await?;
                self.mark_task_failed(task_id).await?;
            }
        }
        Ok(())
    }

    /// Fail a task, tolerating the race where it already turned terminal
    async fn mark_task_failed(&self, task_id: &str) -> Result<()> {
        match self
            .commit_task_patch(task_id, TaskPatch::status(TaskStatus::Failed))
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::Store(StoreError::TerminalTask(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_completion(
        &self,
        task_id: &str,
        completion: StepCompletion,
        tracker: &mut DispatchTracker,
        cancels: &mut HashMap<String, CancelSource>,
    ) -> Result<()> {
        let step_id = completion.step_id.clone();
        tracker.clear(&step_id);
        cancels.remove(&step_id);

        match completion.outcome {
            CompletionOutcome::Success {
                success,
                attempts_used,
                fallback_remaining,
                fallback_consumed,
            } => {
                self.commit_success(
                    task_id,
                    &step_id,
                    completion.elapsed_ms,
                    success,
                    attempts_used,
                    fallback_remaining,
                    fallback_consumed,
                )
                .await
            }
            CompletionOutcome::Cancelled => {
                let record = self.load(task_id).await?;
                let already_terminal = record
                    .task
                    .get_step(&step_id)
                    .map(|s| s.status.is_terminal())
                    .unwrap_or(true);
                if !already_terminal {
                    self.fail_step(task_id, &step_id, &StepError::cancelled())
                        .await?;
                }
                Ok(())
            }
            CompletionOutcome::Failure {
                error,
                attempts_used,
                fallback_remaining,
                disposition,
                reason,
            } => {
                self.apply_group_policy(task_id, &step_id, &error, cancels)
                    .await?;
                self.commit_step_patch(
                    task_id,
                    &step_id,
                    StepPatch {
                        fallback_config: fallback_remaining,
                        retry_count: Some(attempts_used),
                        ..Default::default()
                    },
                )
                .await?;
                match disposition {
                    Disposition::Skip => self.skip_step(task_id, &step_id, &error, &reason).await,
                    Disposition::Replan => {
                        self.fail_step(task_id, &step_id, &error).await?;
                        self.escalate_replan(task_id, &step_id, &error).await
                    }
                    Disposition::Abort => {
                        self.fail_step(task_id, &step_id, &error).await?;
                        // Signal everything still in flight; the task is done
                        for source in cancels.values() {
                            source.cancel();
                        }
                        self.mark_task_failed(task_id).await
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_success(
        &self,
        task_id: &str,
        step_id: &str,
        elapsed_ms: i64,
        success: RunSuccess,
        attempts_used: u32,
        fallback_remaining: Option<FallbackConfig>,
        fallback_consumed: Vec<FallbackOption>,
    ) -> Result<()> {
        let record = self.load(task_id).await?;
        let Some(step) = record.task.get_step(step_id) else {
            return Ok(());
        };
        if step.status.is_terminal() {
            // Group policy sealed this step while it was finishing; its
            // recorded fate stands
            tracing::debug!(task_id, step_id, "discarding result for sealed step");
            return Ok(());
        }
        let agent_type = step.agent_type.clone();
        let step_name = step.name.clone();

        let mut output_keys: Vec<String> = success.outputs.keys().cloned().collect();
        output_keys.sort();

        let fresh = self
            .commit_step_patch(
                task_id,
                step_id,
                StepPatch {
                    status: Some(StepStatus::Done),
                    outputs: Some(success.outputs),
                    retry_count: Some(attempts_used),
                    fallback_config: fallback_remaining,
                    completed_at: Some(Utc::now()),
                    execution_time_ms: Some(elapsed_ms),
                    clear_error: true,
                    ..Default::default()
                },
            )
            .await?;

        let mut content = json!({
            "step_name": step_name,
            "outputs": output_keys,
            "execution_time_ms": elapsed_ms,
        });
        if !fallback_consumed.is_empty() {
            content["fallbacks_used"] = json!(fallback_consumed.len());
        }
        self.append_finding(task_id, Finding::new(step_id, agent_type, content))
            .await;

        if !success.undeclared_keys.is_empty() {
            self.append_finding(
                task_id,
                Finding::new(
                    step_id,
                    WARNING_FINDING_TYPE,
                    json!({
                        "message": "handler returned undeclared output keys",
                        "keys": success.undeclared_keys,
                    }),
                ),
            )
            .await;
        }

        if let Some(updated) = fresh.task.get_step(step_id) {
            self.tree.publish_step(task_id, updated).await;
        }
        tracing::info!(task_id, step_id, elapsed_ms, "step done");
        Ok(())
    }

    /// Enforce the group failure policy when a member fails
    async fn apply_group_policy(
        &self,
        task_id: &str,
        step_id: &str,
        error: &StepError,
        cancels: &mut HashMap<String, CancelSource>,
    ) -> Result<()> {
        let record = self.load(task_id).await?;
        let task = &record.task;
        let Some(step) = task.get_step(step_id) else {
            return Ok(());
        };
        let Some(group) = step.parallel_group.clone() else {
            return Ok(());
        };

        match step.failure_policy {
            FailurePolicy::BestEffort => {}
            FailurePolicy::FailFast => {
                for sibling in scheduler::running_group_siblings(task, step_id) {
                    tracing::info!(task_id, step_id = %sibling, group = %group, "fail-fast cancel");
                    if let Some(source) = cancels.get(&sibling) {
                        source.cancel();
                    }
                }
            }
            FailurePolicy::AllOrNothing => {
                // Pending members are sealed; running ones are cancelled
                // and resolve individually. Completed members keep their
                // outputs.
                let seal_message =
                    format!("Parallel group '{}' failed: step '{}' failed: {}", group, step_id, error);
                let pending: Vec<String> = task
                    .steps
                    .iter()
                    .filter(|s| {
                        s.id != step_id
                            && s.parallel_group.as_deref() == Some(group.as_str())
                            && s.status == StepStatus::Pending
                    })
                    .map(|s| s.id.clone())
                    .collect();
                for sibling in pending {
                    self.commit_step_patch(
                        task_id,
                        &sibling,
                        StepPatch::failed(seal_message.clone()),
                    )
                    .await?;
                    if let Some(fresh) = self.load(task_id).await?.task.get_step(&sibling) {
                        self.tree.publish_step(task_id, fresh).await;
                    }
                }
                for sibling in scheduler::running_group_siblings(task, step_id) {
                    if let Some(source) = cancels.get(&sibling) {
                        source.cancel();
                    }
                }
            }
        }
        Ok(())
    }

    async fn skip_step(
        &self,
        task_id: &str,
        step_id: &str,
        error: &StepError,
        reason: &str,
    ) -> Result<()> {
        let fresh = self
            .commit_step_patch(
                task_id,
                step_id,
                StepPatch {
                    status: Some(StepStatus::Skipped),
                    error_message: Some(error.to_string()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.append_finding(
            task_id,
            Finding::new(
                step_id,
                RECOVERY_FINDING_TYPE,
                json!({"action": "skip", "reason": reason, "error": error.to_string()}),
            ),
        )
        .await;
        if let Some(step) = fresh.task.get_step(step_id) {
            self.tree.publish_step(task_id, step).await;
        }
        tracing::info!(task_id, step_id, reason, "step skipped");
        Ok(())
    }

    async fn fail_step(&self, task_id: &str, step_id: &str, error: &StepError) -> Result<()> {
        let message = if error.kind == ErrorKind::Cancelled {
            "cancelled".to_string()
        } else {
            error.to_string()
        };
        let fresh = self
            .commit_step_patch(task_id, step_id, StepPatch::failed(message))
            .await?;
        if let Some(step) = fresh.task.get_step(step_id) {
            self.tree.publish_step(task_id, step).await;
        }
        Ok(())
    }

    async fn escalate_replan(
        &self,
        task_id: &str,
        step_id: &str,
        error: &StepError,
    ) -> Result<()> {
        let Some(planner) = &self.planner else {
            tracing::warn!(task_id, step_id, "replan proposed but no planner; aborting task");
            self.mark_task_failed(task_id).await?;
            return Ok(());
        };
        let record = self.load(task_id).await?;
        let context = ReplanContext::from_failure(&record.task, step_id, error);
        execute_replan(&self.store, planner, &record.task, step_id, context).await?;
        Ok(())
    }

    /// No ready steps, nothing running: settle the task's fate
    async fn finalize(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.load(task_id).await?;
        let task = &record.task;
        let all_satisfied = task
            .steps
            .iter()
            .all(|s| s.status.satisfies_dependency());
        if all_satisfied {
            tracing::info!(task_id, "task completed");
            return Ok(self
                .commit_task_patch(
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Completed),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?);
        }
        tracing::warn!(task_id, "no runnable steps remain; task failed");
        Ok(self
            .commit_task_patch(task_id, TaskPatch::status(TaskStatus::Failed))
            .await?)
    }

    /// Fire every in-flight cancel and drain completions for a task that
    /// turned terminal under us
    async fn wind_down(
        &self,
        task_id: &str,
        tracker: &mut DispatchTracker,
        cancels: &mut HashMap<String, CancelSource>,
        completion_rx: &mut mpsc::Receiver<StepCompletion>,
    ) -> Result<()> {
        if tracker.in_flight() == 0 {
            return Ok(());
        }
        for source in cancels.values() {
            source.cancel();
        }
        let drain_deadline = self.config.cancellation_grace() + self.config.scheduler_tick();
        while tracker.in_flight() > 0 {
            match tokio::time::timeout(drain_deadline, completion_rx.recv()).await {
                Ok(Some(completion)) => {
                    let step_id = completion.step_id.clone();
                    tracker.clear(&step_id);
                    cancels.remove(&step_id);
                    let record = self.load(task_id).await?;
                    let terminal = record
                        .task
                        .get_step(&step_id)
                        .map(|s| s.status.is_terminal())
                        .unwrap_or(true);
                    if !terminal {
                        self.fail_step(task_id, &step_id, &StepError::cancelled())
                            .await?;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    // Unacknowledged past the grace period: abandoned
                    tracing::warn!(task_id, "abandoning unresponsive steps after grace period");
                    for (step_id, _) in cancels.drain() {
                        tracker.clear(&step_id);
                        let record = self.load(task_id).await?;
                        let terminal = record
                            .task
                            .get_step(&step_id)
                            .map(|s| s.status.is_terminal())
                            .unwrap_or(true);
                        if !terminal {
                            self.fail_step(task_id, &step_id, &StepError::cancelled())
                                .await?;
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Store access with conflict retry
    // ------------------------------------------------------------------

    async fn load(&self, task_id: &str) -> Result<TaskRecord> {
        let mut attempt = 0;
        loop {
            match self.store.get_task(task_id).await {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => return Err(StoreError::NotFound(task_id.to_string()).into()),
                Err(e) if e.is_retryable() && attempt < self.config.store_retry_attempts => {
                    tokio::time::sleep(self.config.store_retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn commit_task_patch(&self, task_id: &str, patch: TaskPatch) -> Result<TaskRecord> {
        let mut attempt = 0;
        loop {
            let record = self.load(task_id).await?;
            match self
                .store
                .update_task(task_id, Some(record.revision), patch.clone())
                .await
            {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() && attempt < self.config.store_retry_attempts => {
                    tracing::debug!(task_id, attempt, "task write conflict; reloading");
                    tokio::time::sleep(self.config.store_retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn commit_step_patch(
        &self,
        task_id: &str,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<TaskRecord> {
        let mut attempt = 0;
        loop {
            let record = self.load(task_id).await?;
            match self
                .store
                .update_step(task_id, step_id, Some(record.revision), patch.clone())
                .await
            {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() && attempt < self.config.store_retry_attempts => {
                    tracing::debug!(task_id, step_id, attempt, "step write conflict; reloading");
                    tokio::time::sleep(self.config.store_retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn append_finding(&self, task_id: &str, finding: Finding) {
        if let Err(e) = self.store.append_finding(task_id, finding).await {
            tracing::warn!(task_id, error = %e, "failed to append finding");
        }
    }
}

/// Map a fallback option onto the input key it rebinds
fn fallback_rebind(option: FallbackOption) -> HashMap<String, Value> {
    let mut rebind = HashMap::new();
    match option {
        FallbackOption::Model(model) => rebind.insert("model".to_string(), json!(model)),
        FallbackOption::Api(api) => rebind.insert("api".to_string(), json!(api)),
        FallbackOption::Strategy(strategy) => {
            rebind.insert("strategy".to_string(), json!(strategy))
        }
    };
    rebind
}

/// One dispatched step: runs tactical recovery locally and reports a
/// single completion event
#[allow(clippy::too_many_arguments)]
async fn dispatch_step(
    runner: StepRunner,
    controller: Arc<FailureController>,
    task: Task,
    step_id: String,
    token: CancelToken,
    permit: tokio::sync::OwnedSemaphorePermit,
    completion_tx: mpsc::Sender<StepCompletion>,
    progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    suppress_tactical: bool,
) {
    let started = Instant::now();
    let step = match task.get_step(&step_id) {
        Some(step) => step.clone(),
        None => return,
    };
    let side_effect = runner.side_effect_class(&step);
    let had_fallback_config = step.fallback_config.is_some();
    let mut fallback = step.fallback_config.clone().unwrap_or_default();
    let mut consumed: Vec<FallbackOption> = Vec::new();
    let mut attempts_used = step.retry_count;
    let mut rebind: Option<HashMap<String, Value>> = None;
    let mut modify_rounds = 0u32;

    let outcome = loop {
        let result = runner
            .run(
                &task,
                &step_id,
                rebind.as_ref(),
                token.clone(),
                Some(progress_tx.clone()),
            )
            .await;

        match result {
            Ok(success) => {
                break CompletionOutcome::Success {
                    success,
                    attempts_used,
                    fallback_remaining: (had_fallback_config || !consumed.is_empty())
                        .then(|| fallback.clone()),
                    fallback_consumed: consumed,
                }
            }
            Err(error) if error.kind == ErrorKind::Cancelled => {
                break CompletionOutcome::Cancelled;
            }
            Err(error) => {
                if suppress_tactical {
                    // All-or-nothing group: the first failure seals the
                    // group, so retry and fallback cannot rescue it
                    let disposition = if !step.is_critical {
                        Disposition::Skip
                    } else if error.kind.is_structural() {
                        Disposition::Replan
                    } else {
                        Disposition::Abort
                    };
                    break CompletionOutcome::Failure {
                        reason: format!("all_or_nothing group sealed by {}", error.kind),
                        error,
                        attempts_used,
                        fallback_remaining: None,
                        disposition,
                    };
                }

                let mut step_view = step.clone();
                step_view.retry_count = attempts_used;
                let current_inputs = rebind.clone().unwrap_or_else(|| step.inputs.clone());
                let proposal = controller
                    .decide(FailureContext {
                        step: &step_view,
                        error: &error,
                        attempts: attempts_used,
                        side_effect,
                        fallback: &fallback,
                        current_inputs: &current_inputs,
                    })
                    .await;

                tracing::debug!(
                    task_id = %task.id,
                    step_id = %step_id,
                    action = ?proposal.action,
                    reason = %proposal.reason,
                    "recovery proposal"
                );

                match proposal.action {
                    RecoveryAction::Retry { delay } => {
                        attempts_used += 1;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => break CompletionOutcome::Cancelled,
                        }
                    }
                    RecoveryAction::Fallback => {
                        let Some(option) = fallback.take_next() else {
                            break CompletionOutcome::Failure {
                                reason: "fallback proposed with no options left".to_string(),
                                error,
                                attempts_used,
                                fallback_remaining: Some(fallback.clone()),
                                disposition: Disposition::Abort,
                            };
                        };
                        tracing::info!(
                            task_id = %task.id,
                            step_id = %step_id,
                            option = ?option,
                            "consuming fallback option"
                        );
                        consumed.push(option.clone());
                        let mut map = rebind.take().unwrap_or_default();
                        map.extend(fallback_rebind(option));
                        rebind = Some(map);
                        attempts_used = 0;
                    }
                    RecoveryAction::Modify { inputs } => {
                        if modify_rounds >= 1 {
                            let disposition = if !step.is_critical {
                                Disposition::Skip
                            } else {
                                Disposition::Abort
                            };
                            break CompletionOutcome::Failure {
                                reason: "modify round already attempted".to_string(),
                                error,
                                attempts_used,
                                fallback_remaining: had_fallback_config
                                    .then(|| fallback.clone()),
                                disposition,
                            };
                        }
                        modify_rounds += 1;
                        rebind = Some(inputs);
                    }
                    RecoveryAction::Skip => {
                        break CompletionOutcome::Failure {
                            reason: proposal.reason,
                            error,
                            attempts_used,
                            fallback_remaining: (had_fallback_config || !consumed.is_empty())
                                .then(|| fallback.clone()),
                            disposition: Disposition::Skip,
                        }
                    }
                    RecoveryAction::Replan => {
                        break CompletionOutcome::Failure {
                            reason: proposal.reason,
                            error,
                            attempts_used,
                            fallback_remaining: (had_fallback_config || !consumed.is_empty())
                                .then(|| fallback.clone()),
                            disposition: Disposition::Replan,
                        }
                    }
                    RecoveryAction::Abort => {
                        break CompletionOutcome::Failure {
                            reason: proposal.reason,
                            error,
                            attempts_used,
                            fallback_remaining: (had_fallback_config || !consumed.is_empty())
                                .then(|| fallback.clone()),
                            disposition: Disposition::Abort,
                        }
                    }
                }
            }
        }
    };

    let completion = StepCompletion {
        step_id,
        elapsed_ms: started.elapsed().as_millis() as i64,
        outcome,
    };
    if completion_tx.send(completion).await.is_err() {
        tracing::debug!("orchestrator gone before completion; result dropped");
    }
    drop(permit);
}
