//! A fetch → analyze fan-out → compose pipeline with a flaky source.
//!
//! Demonstrates parallel-group dispatch, best-effort failure handling,
//! and outputs flowing between steps through `${...}` references.
//!
//! Run with: `cargo run --example research_pipeline`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use taskgraph_core::capability::{
    Capability, CapabilityContext, CapabilityDescriptor, CapabilityOutputs, CapabilityRegistry,
    FieldSpec, FieldType, IoSchema,
};
use taskgraph_core::error::StepError;
use taskgraph_core::task::{FailurePolicy, Task, TaskStep};
use taskgraph_engine::Orchestrator;
use taskgraph_store::{MemoryPreferenceStore, MemoryTaskStore};

/// Pretends to fetch a URL; the "flaky" source fails once per process
struct HttpFetch {
    descriptor: CapabilityDescriptor,
    failed_once: std::sync::atomic::AtomicBool,
}

impl HttpFetch {
    fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("http_fetch")
                .with_description("Fetch a document over HTTP")
                .with_input_schema(
                    IoSchema::new().field("url", FieldSpec::required(FieldType::String)),
                )
                .with_output_schema(
                    IoSchema::new().field("body", FieldSpec::required(FieldType::String)),
                ),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Capability for HttpFetch {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        ctx: CapabilityContext,
    ) -> Result<CapabilityOutputs, StepError> {
        let url = inputs["url"].as_str().unwrap_or_default().to_string();
        if url.contains("flaky") && !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StepError::transient_network("connection reset by peer"));
        }
        ctx.report_progress(json!({"fetching": url}));
        let mut outputs = HashMap::new();
        outputs.insert("body".to_string(), json!(format!("<contents of {}>", url)));
        Ok(outputs)
    }
}

/// Joins upstream bodies into a single report
struct Compose {
    descriptor: CapabilityDescriptor,
}

impl Compose {
    fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("compose")
                .with_description("Compose a report from gathered sources"),
        }
    }
}

#[async_trait]
impl Capability for Compose {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        _ctx: CapabilityContext,
    ) -> Result<CapabilityOutputs, StepError> {
        let sections: Vec<String> = inputs
            .values()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
        let mut outputs = HashMap::new();
        outputs.insert("report".to_string(), json!(sections.join("\n---\n")));
        Ok(outputs)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    taskgraph_engine::telemetry::init();

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(HttpFetch::new()));
    registry.register(Arc::new(Compose::new()));

    let engine = Orchestrator::new(
        Arc::new(MemoryTaskStore::new()),
        Arc::new(MemoryPreferenceStore::new()),
        Arc::new(registry),
    );

    let task = Task::new("demo-user", "gather three sources and compose a report").with_steps(vec![
        TaskStep::new("src_a", "Fetch source A", "http_fetch")
            .with_input("url", json!("https://example.com/a"))
            .with_parallel_group("gather")
            .with_failure_policy(FailurePolicy::BestEffort),
        TaskStep::new("src_b", "Fetch source B", "http_fetch")
            .with_input("url", json!("https://flaky.example.com/b"))
            .with_parallel_group("gather")
            .with_failure_policy(FailurePolicy::BestEffort),
        TaskStep::new("src_c", "Fetch source C", "http_fetch")
            .with_input("url", json!("https://example.com/c"))
            .with_parallel_group("gather")
            .with_failure_policy(FailurePolicy::BestEffort),
        TaskStep::new("report", "Compose report", "compose")
            .with_dependencies(vec![
                "src_a".to_string(),
                "src_b".to_string(),
                "src_c".to_string(),
            ])
            .with_input("a", json!("${src_a.outputs.body}"))
            .with_input("b", json!("${src_b.outputs.body}"))
            .with_input("c", json!("${src_c.outputs.body}")),
    ]);

    let task_id = engine.submit(task).await?;
    let finished = engine.run_task(&task_id).await?;

    println!("task finished: {:?}", finished.task.status);
    println!(
        "report:\n{}",
        finished.task.get_step("report").unwrap().outputs["report"]
            .as_str()
            .unwrap_or_default()
    );
    for finding in &finished.task.accumulated_findings {
        println!("finding [{}] {}", finding.finding_type, finding.content);
    }
    Ok(())
}
