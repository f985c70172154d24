//! A notification that waits for human approval before sending.
//!
//! Demonstrates the checkpoint coordinator: the task suspends at the gate,
//! the "user" rewrites the subject through a MODIFY resolution, and the
//! engine resumes with the rewritten inputs.
//!
//! Run with: `cargo run --example approval_gate`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use taskgraph_core::capability::{
    Capability, CapabilityContext, CapabilityDescriptor, CapabilityOutputs, CapabilityRegistry,
    SideEffectClass,
};
use taskgraph_core::error::StepError;
use taskgraph_core::task::{CheckpointConfig, CheckpointType, Task, TaskStatus, TaskStep};
use taskgraph_engine::{CheckpointResponse, Orchestrator};
use taskgraph_store::{MemoryPreferenceStore, MemoryTaskStore};

struct Notify {
    descriptor: CapabilityDescriptor,
}

impl Notify {
    fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("notify")
                .with_description("Send a notification to a recipient")
                .with_side_effect_class(SideEffectClass::NonIdempotent),
        }
    }
}

#[async_trait]
impl Capability for Notify {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        _ctx: CapabilityContext,
    ) -> Result<CapabilityOutputs, StepError> {
        println!(
            "  -> sending to {}: {}",
            inputs["to"].as_str().unwrap_or("?"),
            inputs["subject"].as_str().unwrap_or("?")
        );
        let mut outputs = HashMap::new();
        outputs.insert("sent".to_string(), json!(true));
        Ok(outputs)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    taskgraph_engine::telemetry::init();

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Notify::new()));

    let engine = Orchestrator::new(
        Arc::new(MemoryTaskStore::new()),
        Arc::new(MemoryPreferenceStore::new()),
        Arc::new(registry),
    );

    let checkpoint = CheckpointConfig::new("review_notification", "Review before sending")
        .with_checkpoint_type(CheckpointType::Modify)
        .with_preview_fields(vec!["to".to_string(), "subject".to_string()])
        .with_modifiable_fields(vec!["subject".to_string()]);

    let task = Task::new("demo-user", "notify the team about the deploy").with_steps(vec![
        TaskStep::new("send", "Send notification", "notify")
            .with_input("to", json!("team@example.com"))
            .with_input("subject", json!("deploy finished (draft)"))
            .with_checkpoint(checkpoint),
    ]);

    let task_id = engine.submit(task).await?;

    // First run suspends at the gate
    let gated = engine.run_task(&task_id).await?;
    assert_eq!(gated.task.status, TaskStatus::Checkpoint);
    for pending in engine.checkpoints().list_pending(None, None).await {
        println!(
            "pending checkpoint '{}' for step '{}': {:?}",
            pending.checkpoint_name, pending.step_id, pending.preview_data
        );
    }

    // The user rewrites the subject and approves
    let mut modified = HashMap::new();
    modified.insert("subject".to_string(), json!("deploy finished ✅"));
    engine
        .checkpoints()
        .resolve(
            &task_id,
            "send",
            "demo-user",
            CheckpointResponse::approve().with_modified_inputs(modified),
            true,
        )
        .await?;

    // Second run executes the released step with the rewritten inputs
    let finished = engine.run_task(&task_id).await?;
    println!("task finished: {:?}", finished.task.status);
    Ok(())
}
