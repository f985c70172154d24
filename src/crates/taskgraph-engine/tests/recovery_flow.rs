//! Failure recovery: retries, skips, fallbacks, group policies, replan

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskgraph_core::error::StepError;
use taskgraph_core::task::{
    FailurePolicy, FallbackConfig, StepStatus, Task, TaskStatus, TaskStep,
};
use taskgraph_engine::{Planner, ReplanContext};
use taskgraph_store::TaskStore;

use common::{harness, registry_of, Reply, ScriptedCapability};

#[tokio::test(start_paused = true)]
async fn best_effort_group_skips_exhausted_non_critical_member() {
    let seed = ScriptedCapability::new("seed").otherwise(Reply::Echo);
    let fetch = ScriptedCapability::new("fetch").otherwise(Reply::Echo);
    let flaky = ScriptedCapability::new("flaky").script(vec![
        Reply::Fail(StepError::timeout("upstream slow")),
        Reply::Fail(StepError::timeout("upstream slow")),
        Reply::Fail(StepError::timeout("upstream slow")),
    ]);
    let join = ScriptedCapability::new("join").otherwise(Reply::Echo);
    let flaky_probe = flaky.probe();
    let join_probe = join.probe();

    let h = harness(registry_of(vec![seed, fetch, flaky, join]));
    let task = Task::new("user-1", "gather with one flaky source").with_steps(vec![
        TaskStep::new("a", "Seed", "seed"),
        TaskStep::new("b1", "Fetch 1", "fetch")
            .with_dependencies(vec!["a".to_string()])
            .with_parallel_group("g")
            .with_failure_policy(FailurePolicy::BestEffort),
        TaskStep::new("b2", "Fetch 2", "flaky")
            .with_dependencies(vec!["a".to_string()])
            .with_parallel_group("g")
            .with_failure_policy(FailurePolicy::BestEffort)
            .with_is_critical(false)
            .with_max_retries(2),
        TaskStep::new("b3", "Fetch 3", "fetch")
            .with_dependencies(vec!["a".to_string()])
            .with_parallel_group("g")
            .with_failure_policy(FailurePolicy::BestEffort),
        TaskStep::new("c", "Join", "join").with_dependencies(vec![
            "b1".to_string(),
            "b2".to_string(),
            "b3".to_string(),
        ]),
    ]);

    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();

    assert_eq!(finished.task.status, TaskStatus::Completed);
    assert_eq!(finished.task.get_step("b1").unwrap().status, StepStatus::Done);
    assert_eq!(finished.task.get_step("b3").unwrap().status, StepStatus::Done);
    let b2 = finished.task.get_step("b2").unwrap();
    assert_eq!(b2.status, StepStatus::Skipped);
    assert!(b2.error_message.as_deref().unwrap().contains("timeout"));

    // Initial attempt plus two retries, then the join ran exactly once
    assert_eq!(flaky_probe.calls(), 3);
    assert_eq!(join_probe.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_within_retry_budget() {
    let flaky = ScriptedCapability::new("flaky").script(vec![
        Reply::Fail(StepError::rate_limit("429")),
        Reply::Fail(StepError::transient_network("reset")),
        Reply::Outputs(
            [("ok".to_string(), json!(true))]
                .into_iter()
                .collect::<HashMap<String, Value>>(),
        ),
    ]);
    let probe = flaky.probe();

    let h = harness(registry_of(vec![flaky]));
    let task = Task::new("user-1", "retry me")
        .with_steps(vec![TaskStep::new("s1", "Flaky", "flaky")]);
    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();

    assert_eq!(finished.task.status, TaskStatus::Completed);
    let step = finished.task.get_step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Done);
    assert_eq!(step.outputs.get("ok"), Some(&json!(true)));
    assert_eq!(step.retry_count, 2);
    assert_eq!(probe.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn fallback_rebinds_model_and_resets_retry_budget() {
    let compose = ScriptedCapability::new("compose").script(vec![
        // Primary model times out through the whole retry budget
        Reply::Fail(StepError::timeout("model overloaded")),
        Reply::Fail(StepError::timeout("model overloaded")),
        Reply::Fail(StepError::timeout("model overloaded")),
        // First fallback attempt succeeds
        Reply::Echo,
    ]);
    let probe = compose.probe();

    let h = harness(registry_of(vec![compose]));
    let task = Task::new("user-1", "compose with fallback").with_steps(vec![TaskStep::new(
        "s1", "Compose", "compose",
    )
    .with_input("model", json!("primary-large"))
    .with_max_retries(2)
    .with_fallback(FallbackConfig {
        models: vec!["backup-small".to_string()],
        ..Default::default()
    })]);

    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();

    assert_eq!(finished.task.status, TaskStatus::Completed);
    let step = finished.task.get_step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Done);
    // The fourth invocation ran with the rebound model
    assert_eq!(probe.calls(), 4);
    let last = probe.last_inputs().await.unwrap();
    assert_eq!(last.get("model"), Some(&json!("backup-small")));
    // The consumed option is gone from the persisted config
    assert_eq!(step.fallback_config.as_ref().unwrap().models.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn critical_failure_without_recovery_aborts_task() {
    let broken = ScriptedCapability::new("broken")
        .otherwise(Reply::Fail(StepError::internal("defect")));
    let h = harness(registry_of(vec![broken]));
    let task = Task::new("user-1", "doomed")
        .with_steps(vec![TaskStep::new("s1", "Broken", "broken")]);

    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();
    assert_eq!(finished.task.status, TaskStatus::Failed);
    let step = finished.task.get_step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error_message.as_deref().unwrap().contains("internal"));
}

#[tokio::test(start_paused = true)]
async fn failure_report_surfaces_error_findings_and_lineage() {
    let broken = ScriptedCapability::new("broken")
        .otherwise(Reply::Fail(StepError::new(
            taskgraph_core::ErrorKind::NonIdempotentSideEffectFailed,
            "charge may have gone through",
        )));
    let seed = ScriptedCapability::new("seed").otherwise(Reply::Echo);

    let h = harness(registry_of(vec![broken, seed]));
    let task = Task::new("user-1", "charge the card").with_steps(vec![
        TaskStep::new("prep", "Prepare", "seed"),
        TaskStep::new("charge", "Charge", "broken").with_dependencies(vec!["prep".to_string()]),
    ]);
    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();
    assert_eq!(finished.task.status, TaskStatus::Failed);

    let report = h.engine.failure_report(&id).await.unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failed_step_id.as_deref(), Some("charge"));
    assert!(report
        .error_message
        .as_deref()
        .unwrap()
        .contains("charge may have gone through"));
    assert!(report.recent_findings.len() <= 2);
    assert_eq!(report.lineage, vec![id]);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_cancels_running_siblings_but_keeps_completed_outputs() {
    let quick = ScriptedCapability::new("quick").otherwise(Reply::Echo);
    let slow = ScriptedCapability::new("slow")
        .otherwise(Reply::SleepThenEcho(Duration::from_secs(60)));
    // Fails after the quick sibling has already finished, while the slow
    // one is still mid-flight
    let failing = ScriptedCapability::new("failing").otherwise(Reply::SleepThenFail(
        Duration::from_millis(100),
        StepError::internal("boom"),
    ));

    let h = harness(registry_of(vec![quick, slow, failing]));
    let task = Task::new("user-1", "fail fast group").with_steps(vec![
        TaskStep::new("ok", "Quick", "quick")
            .with_parallel_group("g")
            .with_failure_policy(FailurePolicy::FailFast),
        TaskStep::new("hang", "Slow", "slow")
            .with_parallel_group("g")
            .with_failure_policy(FailurePolicy::FailFast),
        TaskStep::new("boom", "Failing", "failing")
            .with_parallel_group("g")
            .with_failure_policy(FailurePolicy::FailFast),
    ]);

    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();

    assert_eq!(finished.task.status, TaskStatus::Failed);
    // The fast sibling completed before the failure and keeps its outputs
    assert_eq!(finished.task.get_step("ok").unwrap().status, StepStatus::Done);
    // The slow sibling was cancelled
    let hang = finished.task.get_step("hang").unwrap();
    assert_eq!(hang.status, StepStatus::Failed);
    assert_eq!(hang.error_message.as_deref(), Some("cancelled"));
    // The failing member recorded its own error
    assert_eq!(finished.task.get_step("boom").unwrap().status, StepStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn all_or_nothing_seals_pending_members() {
    let failing =
        ScriptedCapability::new("failing").otherwise(Reply::Fail(StepError::internal("boom")));
    let slow = ScriptedCapability::new("slow")
        .otherwise(Reply::SleepThenEcho(Duration::from_secs(60)));

    let h = harness(registry_of(vec![failing, slow]));
    // Cap of 2: the third member is still pending when the first fails
    let task = Task::new("user-1", "all or nothing")
        .with_steps(vec![
            TaskStep::new("boom", "Failing", "failing")
                .with_parallel_group("g")
                .with_failure_policy(FailurePolicy::AllOrNothing),
            TaskStep::new("running", "Slow", "slow")
                .with_parallel_group("g")
                .with_failure_policy(FailurePolicy::AllOrNothing),
            TaskStep::new("waiting", "Slow 2", "slow")
                .with_parallel_group("g")
                .with_failure_policy(FailurePolicy::AllOrNothing),
        ])
        .with_max_parallel_steps(2);

    let id = h.engine.submit(task).await.unwrap();
    let finished = h.engine.run_task(&id).await.unwrap();

    assert_eq!(finished.task.status, TaskStatus::Failed);
    assert_eq!(finished.task.get_step("boom").unwrap().status, StepStatus::Failed);
    let waiting = finished.task.get_step("waiting").unwrap();
    assert_eq!(waiting.status, StepStatus::Failed);
    assert!(waiting
        .error_message
        .as_deref()
        .unwrap()
        .contains("Parallel group 'g' failed"));
    assert_eq!(
        finished.task.get_step("running").unwrap().status,
        StepStatus::Failed
    );
}

struct ReplaceFailedStep;

#[async_trait]
impl Planner for ReplaceFailedStep {
    async fn plan(
        &self,
        _goal: &str,
        _constraints: &HashMap<String, Value>,
    ) -> Result<Vec<TaskStep>, String> {
        Err("unused".to_string())
    }

    async fn replan(
        &self,
        original: &Task,
        failed_step: &TaskStep,
        _context: &ReplanContext,
    ) -> Result<Vec<TaskStep>, String> {
        let mut steps: Vec<TaskStep> = original
            .steps
            .iter()
            .filter(|s| s.id != failed_step.id)
            .cloned()
            .collect();
        steps.push(
            TaskStep::new("c_prime", "Compose (revised)", "summarize")
                .with_dependencies(failed_step.dependencies.clone()),
        );
        Ok(steps)
    }
}

#[tokio::test(start_paused = true)]
async fn strategic_replan_preserves_work_and_finishes_on_successor() {
    let fetch = ScriptedCapability::new("fetch")
        .otherwise(Reply::Outputs(
            [("body".to_string(), json!("data"))].into_iter().collect(),
        ));
    let analyze = ScriptedCapability::new("analyze")
        .otherwise(Reply::Outputs(
            [("facts".to_string(), json!(["x"]))].into_iter().collect(),
        ));
    let summarize = ScriptedCapability::new("summarize").otherwise(Reply::Echo);
    let fetch_probe = fetch.probe();
    let analyze_probe = analyze.probe();

    // "compose" is deliberately not registered: capability_not_found is
    // structural and escalates to replan
    let registry = registry_of(vec![fetch, analyze, summarize]);
    let store = std::sync::Arc::new(taskgraph_store::MemoryTaskStore::new());
    let preferences = std::sync::Arc::new(taskgraph_store::MemoryPreferenceStore::new());
    let engine = taskgraph_engine::Orchestrator::with_config(
        store.clone(),
        preferences,
        Arc::new(registry),
        common::test_config(),
    )
    .with_planner(Arc::new(ReplaceFailedStep));

    let task = Task::new("user-1", "fetch, analyze, compose").with_steps(vec![
        TaskStep::new("a", "Fetch", "fetch"),
        TaskStep::new("b", "Analyze", "analyze").with_dependencies(vec!["a".to_string()]),
        TaskStep::new("c", "Compose", "compose").with_dependencies(vec!["b".to_string()]),
    ]);
    let id = engine.submit(task).await.unwrap();
    let finished = engine.run_task(&id).await.unwrap();

    // The loop followed the lineage and completed the successor
    assert_ne!(finished.task.id, id);
    assert_eq!(finished.task.status, TaskStatus::Completed);
    assert_eq!(finished.task.version, 2);
    assert_eq!(finished.task.parent_task_id.as_deref(), Some(id.as_str()));

    // Completed steps preserved with identical outputs, never re-executed
    assert_eq!(fetch_probe.calls(), 1);
    assert_eq!(analyze_probe.calls(), 1);
    let a = finished.task.get_step("a").unwrap();
    assert_eq!(a.status, StepStatus::Done);
    assert_eq!(a.outputs.get("body"), Some(&json!("data")));
    assert_eq!(
        finished.task.get_step("c_prime").unwrap().status,
        StepStatus::Done
    );
    assert!(finished.task.get_step("c").is_none());

    // Replan finding with the diagnosis travelled to the successor
    let replan_findings: Vec<_> = finished
        .task
        .accumulated_findings
        .iter()
        .filter(|f| f.finding_type == "replan")
        .collect();
    assert_eq!(replan_findings.len(), 1);
    assert!(replan_findings[0].content["diagnosis"]
        .as_str()
        .unwrap()
        .contains("capability_not_found"));

    // The original is superseded and back-linked
    let original = store.get_task(&id).await.unwrap().unwrap();
    assert_eq!(original.task.status, TaskStatus::Superseded);
    assert_eq!(
        original.task.superseded_by.as_deref(),
        Some(finished.task.id.as_str())
    );
}
