//! Capability registry - table-driven dispatch for step handlers
//!
//! A capability is a typed, opaque async function identified by
//! `agent_type` plus an optional `domain` disambiguator. The engine never
//! depends on a handler's concrete type; handlers are values behind the
//! narrow [`Capability`] interface (describe schemas, execute with a
//! cancellation token).
//!
//! Handlers declare a [`SideEffectClass`]; non-idempotent handlers are never
//! retried by the failure controller without an explicit retry-safe opt-in
//! on the step's fallback config.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{CoreError, Result, StepError};

/// Declared side-effect class of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    /// Observes the world without changing it
    ReadOnly,
    /// Repeating the call with identical inputs is safe
    #[default]
    Idempotent,
    /// Repeating the call may duplicate an external effect
    NonIdempotent,
}

impl SideEffectClass {
    /// Whether the default retry path may re-invoke this handler
    pub fn retry_safe(&self) -> bool {
        !matches!(self, SideEffectClass::NonIdempotent)
    }
}

/// Primitive type expected for a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// One declared input or output field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldSpec {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Declared shape of a capability's inputs or outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IoSchema {
    #[serde(default)]
    pub fields: HashMap<String, FieldSpec>,
}

impl IoSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Check required fields are present and typed correctly
    ///
    /// Returns every violation, not just the first.
    pub fn validate(&self, values: &HashMap<String, Value>) -> std::result::Result<(), Vec<String>> {
        let mut violations = Vec::new();
        for (name, spec) in &self.fields {
            match values.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(format!("missing required field '{}'", name));
                    }
                }
                Some(value) => {
                    if !spec.field_type.matches(value) {
                        violations.push(format!(
                            "field '{}' expected {:?}, got {}",
                            name,
                            spec.field_type,
                            json_type_name(value)
                        ));
                    }
                }
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            violations.sort();
            Err(violations)
        }
    }

    /// Keys present in `values` but not declared in the schema
    pub fn undeclared_keys(&self, values: &HashMap<String, Value>) -> Vec<String> {
        let mut keys: Vec<String> = values
            .keys()
            .filter(|k| !self.fields.contains_key(*k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Everything the engine needs to know about a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: IoSchema,
    #[serde(default)]
    pub output_schema: IoSchema,
    #[serde(default)]
    pub side_effect_class: SideEffectClass,
}

impl CapabilityDescriptor {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            domain: None,
            description: String::new(),
            input_schema: IoSchema::default(),
            output_schema: IoSchema::default(),
            side_effect_class: SideEffectClass::default(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: IoSchema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: IoSchema) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_side_effect_class(mut self, class: SideEffectClass) -> Self {
        self.side_effect_class = class;
        self
    }
}

/// Cooperative cancellation token
///
/// Cloned into every running handler; handlers poll at I/O boundaries or
/// await [`CancelToken::cancelled`]. Dropping the source does not cancel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// The cancelling side of a [`CancelToken`]
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new().0
    }
}

impl CancelToken {
    /// A token that can never fire; for tests and fire-and-forget runs
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Source dropped without cancelling; park forever
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Progress update emitted by a handler mid-run
///
/// Recorded by the runner as a finding on the owning task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub step_id: String,
    pub content: Value,
}

/// Per-invocation context handed to a handler
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    pub task_id: String,
    pub step_id: String,
    pub cancel: CancelToken,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl CapabilityContext {
    pub fn new(task_id: impl Into<String>, step_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            task_id: task_id.into(),
            step_id: step_id.into(),
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Report partial progress; silently dropped if no sink is attached
    pub fn report_progress(&self, content: Value) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressUpdate {
                step_id: self.step_id.clone(),
                content,
            });
        }
    }
}

/// Outputs of a successful handler invocation
pub type CapabilityOutputs = HashMap<String, Value>;

/// A step handler
///
/// Implementations are opaque to the engine: they receive materialized
/// inputs plus a context, and either return outputs conforming to the
/// declared output schema or raise a categorized [`StepError`].
#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        ctx: CapabilityContext,
    ) -> std::result::Result<CapabilityOutputs, StepError>;
}

#[derive(Hash, PartialEq, Eq, Debug, Clone)]
struct RegistryKey {
    agent_type: String,
    domain: Option<String>,
}

/// Lookup table from `(agent_type, domain?)` to handlers
///
/// Resolution first tries the exact `(agent_type, domain)` pair, then falls
/// back to the domainless registration of the same agent_type.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<RegistryKey, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its descriptor's `(agent_type, domain?)`
    ///
    /// Re-registering the same key replaces the previous handler.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let descriptor = capability.descriptor();
        let key = RegistryKey {
            agent_type: descriptor.agent_type.clone(),
            domain: descriptor.domain.clone(),
        };
        tracing::debug!(
            agent_type = %key.agent_type,
            domain = key.domain.as_deref(),
            side_effect = ?descriptor.side_effect_class,
            "capability registered"
        );
        self.capabilities.insert(key, capability);
    }

    pub fn resolve(&self, agent_type: &str, domain: Option<&str>) -> Option<Arc<dyn Capability>> {
        if let Some(domain) = domain {
            let key = RegistryKey {
                agent_type: agent_type.to_string(),
                domain: Some(domain.to_string()),
            };
            if let Some(capability) = self.capabilities.get(&key) {
                return Some(capability.clone());
            }
        }
        let key = RegistryKey {
            agent_type: agent_type.to_string(),
            domain: None,
        };
        self.capabilities.get(&key).cloned()
    }

    pub fn contains(&self, agent_type: &str, domain: Option<&str>) -> bool {
        self.resolve(agent_type, domain).is_some()
    }

    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .capabilities
            .keys()
            .map(|k| k.agent_type.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Descriptor lookup without cloning the handler
    pub fn describe(&self, agent_type: &str, domain: Option<&str>) -> Result<CapabilityDescriptor> {
        self.resolve(agent_type, domain)
            .map(|c| c.descriptor().clone())
            .ok_or_else(|| {
                CoreError::Registry(format!(
                    "no capability registered for '{}' (domain: {:?})",
                    agent_type, domain
                ))
            })
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}
