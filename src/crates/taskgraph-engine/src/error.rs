//! Engine-level error types
//!
//! Step failures never appear here - they are values
//! ([`StepError`](taskgraph_core::StepError)) routed into the failure
//! controller. `EngineError` covers the orchestration surface itself:
//! store access, checkpoint resolution, planner calls, configuration.

use thiserror::Error;

use crate::checkpoint::CheckpointDecision;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Persistence failure; conflicts are retried at the orchestrator layer
    #[error("Store error: {0}")]
    Store(#[from] taskgraph_store::StoreError),

    /// Model-level failure (validation, lookups)
    #[error("Core error: {0}")]
    Core(#[from] taskgraph_core::CoreError),

    /// No checkpoint recorded for the given gate
    #[error("No checkpoint found for plan '{plan_id}', step '{step_id}'")]
    CheckpointNotFound { plan_id: String, step_id: String },

    /// The gate was already decided; terminal decisions are final
    #[error(
        "Checkpoint for plan '{plan_id}', step '{step_id}' already resolved: {decision:?}"
    )]
    CheckpointConflict {
        plan_id: String,
        step_id: String,
        decision: CheckpointDecision,
    },

    /// A typed checkpoint response failed validation; no state was changed
    #[error("Checkpoint response validation failed: {0}")]
    ValidationFailed(String),

    /// Replan requested but no planner is wired in
    #[error("No planner configured")]
    PlannerUnavailable,

    /// The external planner refused or returned an unusable plan
    #[error("Planner error: {0}")]
    Planner(String),

    /// Configuration file or environment problem
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation was issued against a task in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Whether this is the distinguishable conflict kind callers must
    /// handle by reloading
    pub fn is_conflict(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_conflict(),
            EngineError::CheckpointConflict { .. } => true,
            _ => false,
        }
    }
}
