//! Error types for store operations

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur against a task or preference store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Task not found
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Step not found within a task
    #[error("Step '{step_id}' not found in task '{task_id}'")]
    StepNotFound { task_id: String, step_id: String },

    /// Preference not found
    #[error("Preference not found: {0}")]
    PreferenceNotFound(String),

    /// Optimistic write lost the race; reload and re-decide
    #[error("Write conflict on task '{task_id}': expected revision {expected}, found {actual}")]
    Conflict {
        task_id: String,
        expected: u64,
        actual: u64,
    },

    /// Terminal tasks are immutable except for `superseded_by`
    #[error("Task '{0}' is terminal and cannot be modified")]
    TerminalTask(String),

    /// Terminal steps never transition again within one lineage
    #[error("Step '{step_id}' in task '{task_id}' is terminal and cannot be modified")]
    TerminalStep { task_id: String, step_id: String },

    /// Document rejected at acceptance time
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Backend unreachable or refusing work
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Conflicts and outages are worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

impl From<taskgraph_core::CoreError> for StoreError {
    fn from(err: taskgraph_core::CoreError) -> Self {
        StoreError::Validation(err.to_string())
    }
}
