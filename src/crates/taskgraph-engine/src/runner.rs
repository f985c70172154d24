//! Step runner - execute one step end to end
//!
//! The runner materializes inputs, resolves the capability, validates both
//! sides of the handler contract, and supervises the invocation with a
//! deadline and a cooperative cancellation token. It never writes to the
//! task store: status transitions, outputs, and findings are committed by
//! the orchestrator when the completion event is drained, preserving the
//! single-writer discipline on the task document.
//!
//! Failure surface, in contract order:
//! - unresolved `${...}` reference or schema violation → `input_invalid`
//! - unknown `(agent_type, domain)` → `capability_not_found`
//! - deadline exceeded → `timeout`
//! - cancellation acknowledged (or grace elapsed) → `cancelled`
//! - missing required output keys → `output_invalid`
//!
//! Output keys the capability never declared are retained for forward
//! compatibility and reported back so the orchestrator can append a
//! warning finding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use taskgraph_core::capability::{
    CancelToken, CapabilityContext, CapabilityRegistry, ProgressUpdate, SideEffectClass,
};
use taskgraph_core::error::{CoreError, StepError};
use taskgraph_core::task::{Task, TaskStep};
use taskgraph_core::template;

/// Successful handler invocation plus contract metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RunSuccess {
    pub outputs: HashMap<String, Value>,
    /// Output keys not declared by the capability (kept, but flagged)
    pub undeclared_keys: Vec<String>,
    /// The handler's declared side-effect class
    pub side_effect: SideEffectClass,
}

/// Executes single steps against the capability registry
#[derive(Clone)]
pub struct StepRunner {
    registry: Arc<CapabilityRegistry>,
    step_timeout: Duration,
    cancellation_grace: Duration,
}

impl StepRunner {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        step_timeout: Duration,
        cancellation_grace: Duration,
    ) -> Self {
        Self {
            registry,
            step_timeout,
            cancellation_grace,
        }
    }

    /// Side-effect class for a step's capability, if registered
    pub fn side_effect_class(&self, step: &TaskStep) -> SideEffectClass {
        self.registry
            .resolve(&step.agent_type, step.domain.as_deref())
            .map(|c| c.descriptor().side_effect_class)
            .unwrap_or_default()
    }

    /// Run one step against a task snapshot
    ///
    /// `rebind` overlays recovery-supplied inputs (fallback rebinding or a
    /// MODIFY revision) over the materialized inputs.
    pub async fn run(
        &self,
        task: &Task,
        step_id: &str,
        rebind: Option<&HashMap<String, Value>>,
        cancel: CancelToken,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Result<RunSuccess, StepError> {
        let step = task
            .get_step(step_id)
            .ok_or_else(|| StepError::internal(format!("step '{}' not in snapshot", step_id)))?;

        let mut inputs = template::materialize_step_inputs(task, step).map_err(|e| match e {
            CoreError::UnresolvedReference { .. } => StepError::input_invalid(e.to_string()),
            other => StepError::internal(other.to_string()),
        })?;
        if let Some(rebind) = rebind {
            inputs.extend(rebind.clone());
        }

        let capability = self
            .registry
            .resolve(&step.agent_type, step.domain.as_deref())
            .ok_or_else(|| {
                StepError::capability_not_found(&step.agent_type, step.domain.as_deref())
            })?;
        let descriptor = capability.descriptor().clone();

        if let Err(violations) = descriptor.input_schema.validate(&inputs) {
            return Err(StepError::input_invalid(format!(
                "inputs rejected for '{}': {}",
                step.agent_type,
                violations.join("; ")
            )));
        }

        let mut ctx = CapabilityContext::new(&task.id, &step.id, cancel.clone());
        if let Some(progress) = progress {
            ctx = ctx.with_progress(progress);
        }

        tracing::debug!(
            task_id = %task.id,
            step_id = %step.id,
            agent_type = %step.agent_type,
            domain = step.domain.as_deref(),
            "invoking capability"
        );

        let handler = capability.execute(inputs, ctx);
        tokio::pin!(handler);

        let outputs = tokio::select! {
            result = &mut handler => result?,
            _ = tokio::time::sleep(self.step_timeout) => {
                tracing::warn!(
                    task_id = %task.id,
                    step_id = %step.id,
                    timeout_secs = self.step_timeout.as_secs(),
                    "step exceeded deadline"
                );
                return Err(StepError::timeout(format!(
                    "step exceeded {}s deadline",
                    self.step_timeout.as_secs()
                )));
            }
            _ = cancel.cancelled() => {
                // Grace window: a handler that finishes in time keeps its
                // result; otherwise it is abandoned.
                match tokio::time::timeout(self.cancellation_grace, &mut handler).await {
                    Ok(Ok(outputs)) => outputs,
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!(
                            task_id = %task.id,
                            step_id = %step.id,
                            "step cancelled"
                        );
                        return Err(StepError::cancelled());
                    }
                }
            }
        };

        if let Err(violations) = descriptor.output_schema.validate(&outputs) {
            return Err(StepError::output_invalid(format!(
                "outputs rejected for '{}': {}",
                step.agent_type,
                violations.join("; ")
            )));
        }
        let undeclared_keys = if descriptor.output_schema.fields.is_empty() {
            Vec::new()
        } else {
            descriptor.output_schema.undeclared_keys(&outputs)
        };

        Ok(RunSuccess {
            outputs,
            undeclared_keys,
            side_effect: descriptor.side_effect_class,
        })
    }
}
