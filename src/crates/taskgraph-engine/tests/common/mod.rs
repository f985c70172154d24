//! Shared test toolkit: scripted mock capabilities and an engine harness

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use taskgraph_core::capability::{
    Capability, CapabilityContext, CapabilityDescriptor, CapabilityOutputs, CapabilityRegistry,
};
use taskgraph_core::error::StepError;
use taskgraph_engine::{EngineConfig, Orchestrator};
use taskgraph_store::{MemoryPreferenceStore, MemoryTaskStore};

/// One scripted reply from a mock capability
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return these outputs
    Outputs(HashMap<String, Value>),
    /// Echo the received inputs as outputs
    Echo,
    /// Raise this error
    Fail(StepError),
    /// Sleep (cancellation-aware), then echo inputs
    SleepThenEcho(Duration),
    /// Sleep (cancellation-aware), then raise this error
    SleepThenFail(Duration, StepError),
}

struct Inner {
    script: VecDeque<Reply>,
    fallback_reply: Reply,
    inputs_seen: Vec<HashMap<String, Value>>,
}

/// A capability whose replies are scripted per invocation
///
/// Once the script runs dry, `fallback_reply` answers every further call.
/// Records every inputs map it receives and counts concurrent executions.
pub struct ScriptedCapability {
    descriptor: CapabilityDescriptor,
    inner: Arc<Mutex<Inner>>,
    calls: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl ScriptedCapability {
    pub fn new(agent_type: &str) -> Self {
        Self::with_descriptor(CapabilityDescriptor::new(agent_type))
    }

    pub fn with_descriptor(descriptor: CapabilityDescriptor) -> Self {
        Self {
            descriptor,
            inner: Arc::new(Mutex::new(Inner {
                script: VecDeque::new(),
                fallback_reply: Reply::Echo,
                inputs_seen: Vec::new(),
            })),
            calls: Arc::new(AtomicUsize::new(0)),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_concurrent: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn script(self, replies: Vec<Reply>) -> Self {
        {
            let inner = self.inner.clone();
            let mut guard = inner.try_lock().expect("unused at build time");
            guard.script = replies.into();
        }
        self
    }

    pub fn otherwise(self, reply: Reply) -> Self {
        {
            let inner = self.inner.clone();
            let mut guard = inner.try_lock().expect("unused at build time");
            guard.fallback_reply = reply;
        }
        self
    }

    /// Handle used to observe this capability after registration
    pub fn probe(&self) -> CapabilityProbe {
        CapabilityProbe {
            inner: self.inner.clone(),
            calls: self.calls.clone(),
            max_concurrent: self.max_concurrent.clone(),
        }
    }
}

/// Observation handle for a [`ScriptedCapability`]
#[derive(Clone)]
pub struct CapabilityProbe {
    inner: Arc<Mutex<Inner>>,
    calls: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl CapabilityProbe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub async fn inputs_seen(&self) -> Vec<HashMap<String, Value>> {
        self.inner.lock().await.inputs_seen.clone()
    }

    pub async fn last_inputs(&self) -> Option<HashMap<String, Value>> {
        self.inner.lock().await.inputs_seen.last().cloned()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        ctx: CapabilityContext,
    ) -> Result<CapabilityOutputs, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let reply = {
            let mut inner = self.inner.lock().await;
            inner.inputs_seen.push(inputs.clone());
            inner
                .script
                .pop_front()
                .unwrap_or_else(|| inner.fallback_reply.clone())
        };

        let result = match reply {
            Reply::Outputs(outputs) => Ok(outputs),
            Reply::Echo => Ok(inputs),
            Reply::Fail(error) => Err(error),
            Reply::SleepThenEcho(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(inputs),
                    _ = ctx.cancel.cancelled() => Err(StepError::cancelled()),
                }
            }
            Reply::SleepThenFail(duration, error) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Err(error),
                    _ = ctx.cancel.cancelled() => Err(StepError::cancelled()),
                }
            }
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Fully wired engine over in-memory stores, tuned for fast tests
pub struct Harness {
    pub engine: Orchestrator,
    pub store: Arc<MemoryTaskStore>,
    pub preferences: Arc<MemoryPreferenceStore>,
}

pub fn harness(registry: CapabilityRegistry) -> Harness {
    harness_with(registry, test_config())
}

pub fn harness_with(registry: CapabilityRegistry, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryTaskStore::new());
    let preferences = Arc::new(MemoryPreferenceStore::new());
    let engine = Orchestrator::with_config(
        store.clone(),
        preferences.clone(),
        Arc::new(registry),
        config,
    );
    Harness {
        engine,
        store,
        preferences,
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_step_timeout_secs(5)
        .with_cancellation_grace_secs(1)
}

pub fn registry_of(capabilities: Vec<ScriptedCapability>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(Arc::new(capability));
    }
    registry
}
