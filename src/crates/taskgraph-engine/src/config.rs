//! Engine configuration
//!
//! Defaults are production-sane and every knob can be overridden from a
//! YAML file or `TASKGRAPH_*` environment variables. Timeouts are stored
//! in seconds; helpers expose them as [`Duration`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tunable parameters for the orchestrator and its collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-step execution deadline in seconds
    pub step_timeout_secs: u64,
    /// Grace period after cancellation before a step is abandoned
    pub cancellation_grace_secs: u64,
    /// Multiplier over the step timeout after which a `running` step found
    /// on restart is reclassified as lost
    pub liveness_timeout_factor: u32,
    /// How often the checkpoint expiration sweep runs
    pub checkpoint_sweep_interval_secs: u64,
    /// Cap on in-flight steps across all tasks
    pub global_inflight_cap: usize,
    /// Bounded completion-queue capacity per task run
    pub completion_queue_capacity: usize,
    /// Idle tick when waiting on in-flight work, so task-level cancellation
    /// and pauses are noticed promptly
    pub scheduler_tick_millis: u64,
    /// Attempts for store writes that hit conflicts or outages
    pub store_retry_attempts: u32,
    /// Base backoff between store retries in milliseconds
    pub store_retry_base_millis: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 300,
            cancellation_grace_secs: 30,
            liveness_timeout_factor: 2,
            checkpoint_sweep_interval_secs: 60,
            global_inflight_cap: 64,
            completion_queue_capacity: 64,
            scheduler_tick_millis: 500,
            store_retry_attempts: 3,
            store_retry_base_millis: 50,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML file, then apply environment overrides
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Configuration(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| EngineError::Configuration(format!("invalid config: {}", e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read `TASKGRAPH_*` variables over the current values
    pub fn apply_env_overrides(&mut self) {
        fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        if let Some(v) = parse("TASKGRAPH_STEP_TIMEOUT_SECS") {
            self.step_timeout_secs = v;
        }
        if let Some(v) = parse("TASKGRAPH_CANCELLATION_GRACE_SECS") {
            self.cancellation_grace_secs = v;
        }
        if let Some(v) = parse("TASKGRAPH_GLOBAL_INFLIGHT_CAP") {
            self.global_inflight_cap = v;
        }
        if let Some(v) = parse("TASKGRAPH_CHECKPOINT_SWEEP_INTERVAL_SECS") {
            self.checkpoint_sweep_interval_secs = v;
        }
    }

    pub fn with_step_timeout_secs(mut self, secs: u64) -> Self {
        self.step_timeout_secs = secs;
        self
    }

    pub fn with_cancellation_grace_secs(mut self, secs: u64) -> Self {
        self.cancellation_grace_secs = secs;
        self
    }

    pub fn with_global_inflight_cap(mut self, cap: usize) -> Self {
        self.global_inflight_cap = cap;
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_secs(self.cancellation_grace_secs)
    }

    /// Deadline past which a `running` step found on restart is lost
    pub fn liveness_deadline(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs * self.liveness_timeout_factor as u64)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_millis)
    }

    pub fn checkpoint_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_sweep_interval_secs)
    }

    pub fn store_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.store_retry_base_millis * (1 << attempt.min(6)) as u64)
    }
}
