//! Ready-set computation and parallel-group dispatch planning
//!
//! The scheduler is a pure function of a task snapshot: given the document,
//! it decides which steps should start next and in what grouping. It never
//! mutates the task; the orchestrator owns all writes.
//!
//! Ready steps are grouped by `parallel_group` (steps without a group are
//! singleton groups) and groups are dispatched in document order of their
//! first member. Between independent steps there is no ordering guarantee
//! beyond the DAG partial order.

use std::collections::{HashMap, HashSet};

use crate::task::{StepStatus, Task, TaskStatus};

/// A set of ready steps that may be dispatched concurrently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyGroup {
    /// Shared `parallel_group` key, if any
    pub parallel_group: Option<String>,
    /// Member step ids, in document order
    pub step_ids: Vec<String>,
}

impl ReadyGroup {
    pub fn len(&self) -> usize {
        self.step_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_ids.is_empty()
    }
}

/// Tracks step ids already handed to runners so a step is dispatched at
/// most once per task
///
/// Ids are inserted on dispatch and removed on any terminal transition
/// (done/failed/skipped) or when a step enters a checkpoint gate.
#[derive(Debug, Default, Clone)]
pub struct DispatchTracker {
    scheduled: HashSet<String>,
}

impl DispatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the step was already scheduled
    pub fn mark_scheduled(&mut self, step_id: &str) -> bool {
        self.scheduled.insert(step_id.to_string())
    }

    pub fn is_scheduled(&self, step_id: &str) -> bool {
        self.scheduled.contains(step_id)
    }

    /// Called on done/failed/skipped/checkpoint transitions
    pub fn clear(&mut self, step_id: &str) {
        self.scheduled.remove(step_id);
    }

    pub fn in_flight(&self) -> usize {
        self.scheduled.len()
    }
}

/// Compute all ready steps of a snapshot, grouped for dispatch
///
/// A step is ready iff its status is pending and every dependency's status
/// satisfies dependents (done, skipped, or expanded). Groups are ordered by
/// the document position of their first member.
pub fn ready_groups(task: &Task) -> Vec<ReadyGroup> {
    let completed = task.completed_step_ids();

    let ready: Vec<&crate::task::TaskStep> = task
        .steps
        .iter()
        .filter(|s| s.is_ready(&completed))
        .collect();

    if ready.is_empty() {
        return Vec::new();
    }

    let mut groups: Vec<ReadyGroup> = Vec::new();
    let mut by_key: HashMap<&str, usize> = HashMap::new();

    for step in ready {
        match step.parallel_group.as_deref() {
            None => groups.push(ReadyGroup {
                parallel_group: None,
                step_ids: vec![step.id.clone()],
            }),
            Some(key) => match by_key.get(key) {
                Some(&idx) => groups[idx].step_ids.push(step.id.clone()),
                None => {
                    by_key.insert(key, groups.len());
                    groups.push(ReadyGroup {
                        parallel_group: Some(key.to_string()),
                        step_ids: vec![step.id.clone()],
                    });
                }
            },
        }
    }

    // Document order of first member; ready steps were collected in
    // document order, so group creation order already satisfies this.
    groups
}

/// How many new starts the concurrency policy allows right now
///
/// Global cap is `task.max_parallel_steps`; running steps count against it.
pub fn available_slots(task: &Task) -> usize {
    task.max_parallel_steps.saturating_sub(task.running_count())
}

/// Whether the scheduler may emit new starts for this task at all
pub fn accepts_dispatch(task: &Task) -> bool {
    matches!(task.status, TaskStatus::Ready | TaskStatus::Executing)
}

/// Plan the next dispatches for one cycle
///
/// Flattens [`ready_groups`] in group order, skips ids already scheduled,
/// and stops at the concurrency budget. Returns step ids in dispatch order.
pub fn plan_dispatches(task: &Task, tracker: &DispatchTracker) -> Vec<String> {
    if !accepts_dispatch(task) {
        return Vec::new();
    }

    let mut budget = available_slots(task);
    if budget == 0 {
        return Vec::new();
    }

    let mut dispatches = Vec::new();
    'groups: for group in ready_groups(task) {
        for step_id in group.step_ids {
            if tracker.is_scheduled(&step_id) {
                continue;
            }
            dispatches.push(step_id);
            budget -= 1;
            if budget == 0 {
                break 'groups;
            }
        }
    }
    dispatches
}

/// Ids of running steps sharing a parallel group with `step_id`
///
/// Used by fail-fast group handling to find in-flight siblings.
pub fn running_group_siblings(task: &Task, step_id: &str) -> Vec<String> {
    let group = match task.get_step(step_id).and_then(|s| s.parallel_group.clone()) {
        Some(g) => g,
        None => return Vec::new(),
    };
    task.steps
        .iter()
        .filter(|s| {
            s.id != step_id
                && s.parallel_group.as_deref() == Some(group.as_str())
                && s.status == StepStatus::Running
        })
        .map(|s| s.id.clone())
        .collect()
}
