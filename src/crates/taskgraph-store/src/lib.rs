//! # taskgraph-store
//!
//! Persistence layer for taskgraph: the [`TaskStore`] and
//! [`PreferenceStore`] traits the engine writes through, plus in-memory
//! reference backends with optimistic-concurrency semantics.
//!
//! The engine is the sole mutator of a given task and funnels every write
//! through these traits, so the store's contract is what makes task
//! documents linearizable:
//!
//! - mutations are atomic per task
//! - reads observe fully committed snapshots only
//! - writers compare-and-swap on a per-task revision counter; losers get a
//!   [`StoreError::Conflict`] and must reload
//!
//! Custom backends (PostgreSQL, Redis, ...) implement the same traits and
//! plug into the engine unchanged.

pub mod error;
pub mod memory;
pub mod preference;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{MemoryPreferenceStore, MemoryTaskStore};
pub use preference::{Preference, PreferenceDecision, PreferenceMatch};
pub use traits::{PreferenceStore, TaskRecord, TaskStore};
