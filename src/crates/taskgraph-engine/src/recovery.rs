//! Failure controller - classify a step failure, propose a recovery
//!
//! Recovery is a value-level decision procedure, never stack unwinding.
//! Given a failed step, its error kind, and the attempt history, the
//! controller proposes exactly one action:
//!
//! 1. **Retry** - transient error, budget left, handler retry-safe;
//!    exponential backoff (base 1 s, x2, capped at 60 s)
//! 2. **Fallback** - unused fallback options remain; the next one rebinds
//!    the step's model/api/strategy input and the retry budget resets
//! 3. **Modify** - content-filter or recoverable validation error and an
//!    input reviser is wired in; retry with rewritten inputs
//! 4. **Skip** - non-critical step; dependents continue
//! 5. **Replan** - structural failure on a critical step; escalate to the
//!    planner with work preserved
//! 6. **Abort** - nothing else applies; the task fails
//!
//! Non-idempotent handlers are only retried (or failed over) when the
//! step's fallback config opts in with `retry_safe`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use taskgraph_core::capability::SideEffectClass;
use taskgraph_core::error::{ErrorKind, StepError};
use taskgraph_core::retry::RetryPolicy;
use taskgraph_core::task::{FallbackConfig, TaskStep};

/// Recovery action selected for one failure
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Re-dispatch the same step after the given backoff
    Retry { delay: Duration },
    /// Consume the next fallback option and re-dispatch
    Fallback,
    /// Re-dispatch with rewritten inputs
    Modify { inputs: HashMap<String, Value> },
    /// Mark the step skipped; dependents continue
    Skip,
    /// Escalate to strategic replanning
    Replan,
    /// Fail the task
    Abort,
}

/// A proposal with provenance, mirroring the shape observers record
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryProposal {
    pub step_id: String,
    pub action: RecoveryAction,
    pub reason: String,
    pub confidence: f64,
}

/// Synthesizes repaired inputs for MODIFY recovery
///
/// Treated as an opaque subordinate planner call; when absent, MODIFY is
/// skipped in the decision procedure.
#[async_trait]
pub trait InputReviser: Send + Sync {
    async fn revise(
        &self,
        step: &TaskStep,
        error: &StepError,
        current_inputs: &HashMap<String, Value>,
    ) -> Option<HashMap<String, Value>>;
}

/// Everything the controller needs to know about one failure
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub step: &'a TaskStep,
    pub error: &'a StepError,
    /// Retries already consumed (cumulative across dispatches)
    pub attempts: u32,
    pub side_effect: SideEffectClass,
    /// Remaining fallback options for this step
    pub fallback: &'a FallbackConfig,
    /// Inputs the failing attempt ran with
    pub current_inputs: &'a HashMap<String, Value>,
}

/// Decides how to react to failed steps
pub struct FailureController {
    retry_policy: RetryPolicy,
    reviser: Option<Arc<dyn InputReviser>>,
}

impl Default for FailureController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl FailureController {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            reviser: None,
        }
    }

    pub fn with_reviser(mut self, reviser: Arc<dyn InputReviser>) -> Self {
        self.reviser = Some(reviser);
        self
    }

    /// Run the decision procedure for one failure
    pub async fn decide(&self, ctx: FailureContext<'_>) -> RecoveryProposal {
        let step_id = ctx.step.id.clone();
        let kind = ctx.error.kind;

        // Cancellation is not a failure; callers keep it away from here
        if kind == ErrorKind::Cancelled {
            return RecoveryProposal {
                step_id,
                action: RecoveryAction::Abort,
                reason: "cancelled step routed to failure controller".to_string(),
                confidence: 0.0,
            };
        }

        let retry_safe = ctx.side_effect.retry_safe() || ctx.fallback.retry_safe;

        if kind.is_transient() && ctx.attempts < ctx.step.max_retries && retry_safe {
            let delay = self.retry_policy.calculate_delay(ctx.attempts);
            return RecoveryProposal {
                step_id,
                action: RecoveryAction::Retry { delay },
                reason: format!(
                    "transient {} (attempt {} of {})",
                    kind,
                    ctx.attempts + 1,
                    ctx.step.max_retries
                ),
                confidence: 0.85,
            };
        }

        if ctx.fallback.has_options() && retry_safe {
            return RecoveryProposal {
                step_id,
                action: RecoveryAction::Fallback,
                reason: format!("{} after {} attempts; fallback available", kind, ctx.attempts),
                confidence: 0.75,
            };
        }

        if kind.is_modify_recoverable() {
            if let Some(reviser) = &self.reviser {
                if let Some(inputs) = reviser
                    .revise(ctx.step, ctx.error, ctx.current_inputs)
                    .await
                {
                    return RecoveryProposal {
                        step_id,
                        action: RecoveryAction::Modify { inputs },
                        reason: format!("{}; retrying with revised inputs", kind),
                        confidence: 0.7,
                    };
                }
            }
        }

        if !ctx.step.is_critical {
            return RecoveryProposal {
                step_id,
                action: RecoveryAction::Skip,
                reason: format!("non-critical step failed with {}", kind),
                confidence: 0.8,
            };
        }

        if kind.is_structural() {
            return RecoveryProposal {
                step_id,
                action: RecoveryAction::Replan,
                reason: format!("structural failure: {}", ctx.error),
                confidence: 0.65,
            };
        }

        RecoveryProposal {
            step_id,
            action: RecoveryAction::Abort,
            reason: format!("no recovery applies to {}", ctx.error),
            confidence: 0.9,
        }
    }
}
