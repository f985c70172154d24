//! Input materialization and `${...}` reference substitution
//!
//! Step inputs may reference prior work and trigger payloads:
//!
//! - `${<step_id>.outputs.<field>}` - a field recorded on a completed
//!   step's outputs (nested paths allowed after the field)
//! - `${trigger_event.<path>}` - a path into the event payload injected
//!   when the task was cloned by a trigger
//!
//! Substitution happens at materialization time, immediately before a
//! handler is invoked - never at clone or plan time - so references always
//! see the freshest committed state.
//!
//! Materialization layering, lowest to highest precedence: declared
//! `inputs`, checkpoint-collected `checkpoint_inputs`, then MODIFY
//! `inputs_override`.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::task::{Task, TaskStep};

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_\-][A-Za-z0-9_\-.]*)\}").expect("valid regex"))
}

/// Materialize a step's effective inputs against its task snapshot
///
/// Applies the override layers, then resolves every `${...}` reference.
/// An unresolvable reference is an error; the runner surfaces it as an
/// invalid-input failure.
pub fn materialize_step_inputs(task: &Task, step: &TaskStep) -> Result<HashMap<String, Value>> {
    let mut effective = step.inputs.clone();
    if let Some(checkpoint_inputs) = &step.checkpoint_inputs {
        effective.extend(checkpoint_inputs.clone());
    }
    if let Some(overrides) = &step.inputs_override {
        effective.extend(overrides.clone());
    }

    let mut materialized = HashMap::with_capacity(effective.len());
    for (key, value) in effective {
        materialized.insert(key, substitute_value(task, &step.id, value)?);
    }
    Ok(materialized)
}

fn substitute_value(task: &Task, step_id: &str, value: Value) -> Result<Value> {
    match value {
        Value::String(s) => substitute_string(task, step_id, s),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(task, step_id, item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, substitute_value(task, step_id, v)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

fn substitute_string(task: &Task, step_id: &str, s: String) -> Result<Value> {
    let pattern = reference_pattern();

    // A string that is exactly one reference keeps the referent's JSON type
    if let Some(captures) = pattern.captures(&s) {
        let whole = captures.get(0).expect("match exists");
        if whole.start() == 0 && whole.end() == s.len() {
            let reference = &captures[1];
            return resolve_reference(task, reference).ok_or_else(|| {
                CoreError::UnresolvedReference {
                    step_id: step_id.to_string(),
                    reference: reference.to_string(),
                }
            });
        }
    } else {
        return Ok(Value::String(s));
    }

    // Embedded references are stringified in place
    let mut result = String::with_capacity(s.len());
    let mut last = 0;
    for captures in pattern.captures_iter(&s) {
        let whole = captures.get(0).expect("match exists");
        let reference = &captures[1];
        let resolved = resolve_reference(task, reference).ok_or_else(|| {
            CoreError::UnresolvedReference {
                step_id: step_id.to_string(),
                reference: reference.to_string(),
            }
        })?;
        result.push_str(&s[last..whole.start()]);
        result.push_str(&render_inline(&resolved));
        last = whole.end();
    }
    result.push_str(&s[last..]);
    Ok(Value::String(result))
}

fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve one reference body (the text between `${` and `}`)
pub fn resolve_reference(task: &Task, reference: &str) -> Option<Value> {
    let mut parts = reference.split('.');
    let head = parts.next()?;

    if head == "trigger_event" {
        let event = task.trigger_event()?;
        return navigate(event, parts).cloned();
    }

    // ${step_id.outputs.field...}
    let step = task.get_step(head)?;
    match parts.next() {
        Some("outputs") => {
            let field = parts.next()?;
            let value = step.outputs.get(field)?;
            navigate(value, parts).cloned()
        }
        _ => None,
    }
}

fn navigate<'a, 'b>(
    mut value: &'a Value,
    parts: impl Iterator<Item = &'b str>,
) -> Option<&'a Value> {
    for part in parts {
        value = match value {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{StepStatus, TaskStep};
    use serde_json::json;

    fn task_with_outputs() -> Task {
        let mut fetch = TaskStep::new("fetch", "Fetch", "http_fetch");
        fetch.status = StepStatus::Done;
        fetch.outputs.insert("body".to_string(), json!("<html>ok</html>"));
        fetch
            .outputs
            .insert("meta".to_string(), json!({"status": 200, "tags": ["a", "b"]}));

        let summarize = TaskStep::new("summarize", "Summarize", "summarize")
            .with_dependencies(vec!["fetch".to_string()])
            .with_input("text", json!("${fetch.outputs.body}"))
            .with_input("status_line", json!("HTTP ${fetch.outputs.meta.status}"))
            .with_input("first_tag", json!("${fetch.outputs.meta.tags.0}"));

        let mut task = Task::new("user-1", "goal").with_steps(vec![fetch, summarize]);
        task.metadata.insert(
            crate::task::TRIGGER_EVENT_METADATA_KEY.to_string(),
            json!({"data": {"who": "alice", "count": 3}}),
        );
        task
    }

    #[test]
    fn whole_string_reference_preserves_type() {
        let task = task_with_outputs();
        let step = task.get_step("summarize").unwrap();
        let inputs = materialize_step_inputs(&task, step).unwrap();
        assert_eq!(inputs.get("text"), Some(&json!("<html>ok</html>")));
        assert_eq!(inputs.get("first_tag"), Some(&json!("a")));
    }

    #[test]
    fn embedded_reference_is_stringified() {
        let task = task_with_outputs();
        let step = task.get_step("summarize").unwrap();
        let inputs = materialize_step_inputs(&task, step).unwrap();
        assert_eq!(inputs.get("status_line"), Some(&json!("HTTP 200")));
    }

    #[test]
    fn trigger_event_paths_resolve() {
        let task = task_with_outputs();
        let step = TaskStep::new("s1", "S1", "noop")
            .with_input("user", json!("${trigger_event.data.who}"))
            .with_input("count", json!("${trigger_event.data.count}"));
        let inputs = materialize_step_inputs(&task, &step).unwrap();
        assert_eq!(inputs.get("user"), Some(&json!("alice")));
        assert_eq!(inputs.get("count"), Some(&json!(3)));
    }

    #[test]
    fn unresolved_reference_errors() {
        let task = task_with_outputs();
        let step = TaskStep::new("s1", "S1", "noop")
            .with_input("missing", json!("${fetch.outputs.nope}"));
        let err = materialize_step_inputs(&task, &step).unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedReference { .. }));
    }

    #[test]
    fn overrides_win_over_inputs_and_checkpoint_inputs() {
        let task = task_with_outputs();
        let mut step = TaskStep::new("s1", "S1", "notify")
            .with_input("to", json!("x"))
            .with_input("subject", json!("draft"));
        let mut checkpoint_inputs = HashMap::new();
        checkpoint_inputs.insert("subject".to_string(), json!("collected"));
        checkpoint_inputs.insert("cc".to_string(), json!("team"));
        step.checkpoint_inputs = Some(checkpoint_inputs);
        let mut overrides = HashMap::new();
        overrides.insert("subject".to_string(), json!("final"));
        step.inputs_override = Some(overrides);

        let inputs = materialize_step_inputs(&task, &step).unwrap();
        assert_eq!(inputs.get("to"), Some(&json!("x")));
        assert_eq!(inputs.get("subject"), Some(&json!("final")));
        assert_eq!(inputs.get("cc"), Some(&json!("team")));
    }

    #[test]
    fn substitution_descends_into_collections() {
        let task = task_with_outputs();
        let step = TaskStep::new("s1", "S1", "noop").with_input(
            "payload",
            json!({"parts": ["${fetch.outputs.body}", {"status": "${fetch.outputs.meta.status}"}]}),
        );
        let inputs = materialize_step_inputs(&task, &step).unwrap();
        assert_eq!(
            inputs.get("payload"),
            Some(&json!({"parts": ["<html>ok</html>", {"status": 200}]}))
        );
    }

    #[test]
    fn plain_strings_pass_through() {
        let task = task_with_outputs();
        let step = TaskStep::new("s1", "S1", "noop")
            .with_input("literal", json!("no references here"))
            .with_input("number", json!(42));
        let inputs = materialize_step_inputs(&task, &step).unwrap();
        assert_eq!(inputs.get("literal"), Some(&json!("no references here")));
        assert_eq!(inputs.get("number"), Some(&json!(42)));
    }
}
