//! Execution-tree projection
//!
//! A derived, real-time view of per-step status for observers (UIs,
//! websocket bridges). Each task gets an ordered stream of [`NodeUpdate`]
//! messages over a broadcast channel; updates are published *after* the
//! durable write, so observers never see a state the store would deny.
//!
//! The projection carries no truth of its own - [`snapshot`] rebuilds the
//! full view from the task document at any time.
//!
//! [`snapshot`]: ExecutionTreePublisher::snapshot

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use taskgraph_core::task::{StepStatus, Task, TaskStep};

/// Default per-task channel capacity; slow observers miss intermediate
/// updates rather than blocking the engine
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One step-status transition as seen by observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub node_id: String,
    pub status: StepStatus,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl NodeUpdate {
    /// Project a step's current state into an update message
    pub fn from_step(step: &TaskStep) -> Self {
        let result_summary = if step.status == StepStatus::Done && !step.outputs.is_empty() {
            let mut keys: Vec<&str> = step.outputs.keys().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            Some(format!("outputs: {}", keys.join(", ")))
        } else {
            None
        };
        Self {
            node_id: step.id.clone(),
            status: step.status,
            name: step.name.clone(),
            result_summary,
            error: step.error_message.clone(),
            started_at: step.started_at,
            completed_at: step.completed_at,
            duration_seconds: step
                .execution_time_ms
                .map(|ms| ms as f64 / 1000.0),
        }
    }
}

/// Per-task fan-out of [`NodeUpdate`] messages
///
/// Publish failures are non-fatal by construction: with no subscribers the
/// update is simply dropped.
#[derive(Debug, Clone)]
pub struct ExecutionTreePublisher {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<NodeUpdate>>>>,
    capacity: usize,
}

impl Default for ExecutionTreePublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ExecutionTreePublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Subscribe to a task's update stream
    pub async fn subscribe(&self, task_id: &str) -> broadcast::Receiver<NodeUpdate> {
        let mut channels = self.channels.write().await;
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe as a `Stream` for `tokio_stream` consumers
    pub async fn subscribe_stream(&self, task_id: &str) -> BroadcastStream<NodeUpdate> {
        BroadcastStream::new(self.subscribe(task_id).await)
    }

    /// Publish one update; dropped silently when nobody listens
    pub async fn publish(&self, task_id: &str, update: NodeUpdate) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(task_id) {
            if let Err(e) = sender.send(update) {
                tracing::trace!(task_id, error = %e, "no execution-tree subscribers");
            }
        }
    }

    /// Publish the current state of one step
    pub async fn publish_step(&self, task_id: &str, step: &TaskStep) {
        self.publish(task_id, NodeUpdate::from_step(step)).await;
    }

    /// Rebuild the full projection from a task document
    pub fn snapshot(task: &Task) -> Vec<NodeUpdate> {
        task.steps.iter().map(NodeUpdate::from_step).collect()
    }

    /// Drop a task's channel (task deleted)
    pub async fn remove(&self, task_id: &str) {
        self.channels.write().await.remove(task_id);
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Aggregate view of a task's tree for dashboards
    pub fn metrics(task: &Task) -> TreeMetrics {
        let mut metrics = TreeMetrics {
            total_nodes: task.steps.len(),
            ..Default::default()
        };
        for step in &task.steps {
            match step.status {
                StepStatus::Pending => metrics.pending += 1,
                StepStatus::Running => metrics.running += 1,
                StepStatus::Done => metrics.completed += 1,
                StepStatus::Failed => metrics.failed += 1,
                StepStatus::Checkpoint => metrics.waiting_approval += 1,
                StepStatus::Skipped => metrics.skipped += 1,
                StepStatus::Expanded => metrics.expanded += 1,
            }
            if let Some(ms) = step.execution_time_ms {
                metrics.total_execution_ms += ms.max(0) as u64;
            }
        }
        metrics.progress_percentage = task.progress_percentage();
        metrics
    }
}

/// Status counts and timing rollup for one task's execution tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeMetrics {
    pub total_nodes: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting_approval: usize,
    pub skipped: usize,
    pub expanded: usize,
    pub total_execution_ms: u64,
    pub progress_percentage: f64,
}
