//! # taskgraph-engine
//!
//! The orchestration engine for taskgraph: decision cycles over persistent
//! task documents, parallel step execution with cooperative cancellation,
//! human-approval checkpoints with learned auto-approval, failure recovery
//! (retry, fallback, modify, skip, strategic replan), and event-triggered
//! task instantiation.
//!
//! ## Architecture
//!
//! ```text
//!  Planner ─► Task Store ─► Orchestrator cycle
//!                              │
//!                 ┌────────────┼────────────────┐
//!                 ▼            ▼                ▼
//!            Scheduler    Checkpoint       Failure
//!            (ready set)  Coordinator      Controller
//!                 │            │                │
//!                 ▼            ▼                ▼
//!            Step Runner   suspend /       retry / fallback /
//!            (parallel)    auto-approve    skip / replan
//!                 │
//!                 ▼
//!          Execution Tree (observers)
//! ```
//!
//! The orchestrator is the sole writer of a task's document. Step runners
//! execute concurrently and report through a bounded completion queue;
//! every write goes through the store's compare-and-swap revision check,
//! so resolutions arriving from the checkpoint API are never lost.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskgraph_core::CapabilityRegistry;
//! use taskgraph_engine::Orchestrator;
//! use taskgraph_store::{MemoryPreferenceStore, MemoryTaskStore};
//!
//! let mut registry = CapabilityRegistry::new();
//! // registry.register(Arc::new(MyFetchCapability::new()));
//!
//! let engine = Orchestrator::new(
//!     Arc::new(MemoryTaskStore::new()),
//!     Arc::new(MemoryPreferenceStore::new()),
//!     Arc::new(registry),
//! );
//!
//! let task_id = engine.submit(my_task).await?;
//! let finished = engine.run_task(&task_id).await?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod replan;
pub mod runner;
pub mod telemetry;
pub mod tree;
pub mod trigger;

pub use checkpoint::{
    CheckpointCoordinator, CheckpointDecision, CheckpointNotifier, CheckpointResponse,
    CheckpointState, GateOutcome, AUTO_APPROVAL_THRESHOLD,
};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use orchestrator::{FailureReport, Orchestrator};
pub use recovery::{
    FailureContext, FailureController, InputReviser, RecoveryAction, RecoveryProposal,
};
pub use replan::{execute_replan, Planner, ReplanContext};
pub use runner::{RunSuccess, StepRunner};
pub use tree::{ExecutionTreePublisher, NodeUpdate, TreeMetrics};
pub use trigger::{Event, TriggerBinding};
