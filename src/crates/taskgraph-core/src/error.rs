//! Error types for task model and execution operations
//!
//! Two layers of errors live here:
//!
//! ```text
//! CoreError            - Model-level failures (plan validation, lookups,
//! ├── Validation         serialization). Returned by the task document,
//! ├── StepNotFound       scheduler, and capability registry.
//! ├── TaskNotFound
//! ├── Registry
//! └── Serialization
//!
//! StepError            - A categorized runtime failure raised by a step
//!                        handler or the runner. Carries an ErrorKind that
//!                        the failure controller classifies on, never a
//!                        concrete handler type.
//! ```
//!
//! Step failures are *values*: the runner catches them and hands them to the
//! failure controller. They are never used for orchestrator control flow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;

/// Model-level errors for task documents and registries
#[derive(Error, Debug)]
pub enum CoreError {
    /// Plan structure validation failed
    ///
    /// Raised at plan acceptance when step ids are not unique, a dependency
    /// refers to an unknown or later-declared step, or the graph has a cycle.
    #[error("Plan validation failed: {0}")]
    Validation(String),

    /// Referenced step does not exist in the task
    #[error("Step '{step_id}' not found in task '{task_id}'")]
    StepNotFound { task_id: String, step_id: String },

    /// Referenced task does not exist
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Capability registry lookup or registration failed
    #[error("Capability registry error: {0}")]
    Registry(String),

    /// Substitution reference could not be resolved
    #[error("Unresolved reference '{reference}' in step '{step_id}'")]
    UnresolvedReference { step_id: String, reference: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classification of a step failure (§ error taxonomy)
///
/// Kinds, not types: recovery decisions key off this classification alone.
/// Handlers attach a kind when they fail; the runner attaches one for
/// failures it detects itself (timeouts, schema violations, lost executions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Step exceeded its execution deadline
    Timeout,
    /// Upstream service rejected the call due to rate limiting
    RateLimit,
    /// Connection reset, DNS failure, or similar transport-level fault
    TransientNetwork,
    /// Content rejected by a provider safety filter
    ContentFilter,
    /// Inputs were rejected but could be repaired by a MODIFY round
    InputValidationRecoverable,
    /// No capability registered for (agent_type, domain)
    CapabilityNotFound,
    /// Inputs failed schema validation
    InputInvalid,
    /// Handler outputs were missing declared required keys
    OutputInvalid,
    /// A non-idempotent handler failed mid-flight
    NonIdempotentSideEffectFailed,
    /// Cooperative cancellation; not routed to the failure controller
    Cancelled,
    /// Step was found running past the liveness deadline after a restart
    ExecutionLost,
    /// Unexpected defect inside the engine or a handler
    Internal,
}

impl ErrorKind {
    /// Transient failures are retry candidates by default
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::TransientNetwork
        )
    }

    /// Failures a MODIFY round (rewritten inputs) can recover from
    pub fn is_modify_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ContentFilter | ErrorKind::InputValidationRecoverable
        )
    }

    /// Structural failures are never retried; they escalate to replan/abort
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ErrorKind::CapabilityNotFound
                | ErrorKind::InputInvalid
                | ErrorKind::OutputInvalid
                | ErrorKind::Internal
        )
    }

    /// Stable wire name, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ContentFilter => "content_filter",
            ErrorKind::InputValidationRecoverable => "input_validation_recoverable",
            ErrorKind::CapabilityNotFound => "capability_not_found",
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::OutputInvalid => "output_invalid",
            ErrorKind::NonIdempotentSideEffectFailed => "non_idempotent_side_effect_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ExecutionLost => "execution_lost",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized step failure
///
/// Raised by capability handlers and by the runner itself. Serializable so
/// it can be recorded on the step document and in findings.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    /// Failure classification driving recovery
    pub kind: ErrorKind,
    /// Human-readable description, stored as the step's error_message
    pub message: String,
    /// Optional structured detail from the handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn transient_network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    pub fn content_filter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentFilter, message)
    }

    pub fn capability_not_found(agent_type: &str, domain: Option<&str>) -> Self {
        let message = match domain {
            Some(d) => format!("No capability registered for '{}' in domain '{}'", agent_type, d),
            None => format!("No capability registered for '{}'", agent_type),
        };
        Self::new(ErrorKind::CapabilityNotFound, message)
    }

    pub fn input_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputInvalid, message)
    }

    pub fn output_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutputInvalid, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn execution_lost() -> Self {
        Self::new(ErrorKind::ExecutionLost, "execution lost")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether the default retry path applies to this failure
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
