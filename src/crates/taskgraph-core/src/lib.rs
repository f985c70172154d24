//! # taskgraph-core
//!
//! Core model for the taskgraph autonomous execution engine: the persistent
//! task document, its step DAG, the ready-set scheduler, and the capability
//! registry the engine dispatches against.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Task document (task)                                      │
//! │  • goal, constraints, steps[], findings[], version chain   │
//! │  • validated as a DAG at plan acceptance                   │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ snapshot
//!                ↓
//! ┌────────────────────────────────────────────────────────────┐
//! │  Scheduler (scheduler)                                     │
//! │  • ready set = pending steps with satisfied dependencies   │
//! │  • grouped by parallel_group, budgeted by max_parallel     │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ step ids
//!                ↓
//! ┌────────────────────────────────────────────────────────────┐
//! │  Capability registry (capability)                          │
//! │  • (agent_type, domain?) → handler + declared schemas      │
//! │  • handlers are opaque async functions with cancel tokens  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Orchestration itself (decision cycles, checkpoints, recovery, triggers)
//! lives in `taskgraph-engine`; persistence traits and backends live in
//! `taskgraph-store`. This crate stays dependency-light so stores and
//! engines can share the model without pulling in each other.
//!
//! ## Quick start
//!
//! ```rust
//! use taskgraph_core::task::{Task, TaskStep};
//!
//! let task = Task::new("user-1", "fetch the report and summarize it")
//!     .with_steps(vec![
//!         TaskStep::new("fetch", "Fetch report", "http_fetch"),
//!         TaskStep::new("summarize", "Summarize", "summarize")
//!             .with_dependencies(vec!["fetch".to_string()]),
//!     ]);
//! task.validate_plan().expect("valid DAG");
//!
//! let groups = taskgraph_core::scheduler::ready_groups(&task);
//! assert_eq!(groups[0].step_ids, vec!["fetch"]);
//! ```

pub mod capability;
pub mod condition;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod task;
pub mod template;

pub use capability::{
    CancelSource, CancelToken, Capability, CapabilityContext, CapabilityDescriptor,
    CapabilityOutputs, CapabilityRegistry, FieldSpec, FieldType, IoSchema, ProgressUpdate,
    SideEffectClass,
};
pub use error::{CoreError, ErrorKind, Result, StepError};
pub use retry::RetryPolicy;
pub use scheduler::{DispatchTracker, ReadyGroup};
pub use task::{
    ApprovalType, CheckpointConfig, CheckpointType, FailurePolicy, FallbackConfig,
    FallbackOption, Finding, StepPatch, StepStatus, Task, TaskPatch, TaskStatus, TaskStep,
    TriggerConfig,
};
