//! Minimal JSONLogic-subset condition evaluator
//!
//! Trigger bindings carry a declarative condition evaluated against
//! `{"event": ...}`. Supported operators: `var`, `==`, `!=`, `<`, `>`,
//! `<=`, `>=`, `and`, `or`, `!`, `length`.
//!
//! Evaluation is deliberately forgiving: a missing condition, an empty
//! object, or an unknown operator evaluates truthy, so a malformed
//! condition never silently disables a trigger. `var` paths navigate dots
//! (`event.data.severity`) and a trailing `length` segment yields the
//! collection or string length.

use serde_json::Value;

/// Evaluate an optional condition against a context document
pub fn evaluate(condition: Option<&Value>, context: &Value) -> bool {
    match condition {
        None => true,
        Some(expr) => truthy_expr(expr, context),
    }
}

fn truthy_expr(expr: &Value, context: &Value) -> bool {
    match expr {
        Value::Null => true,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => {
            if map.is_empty() {
                return true;
            }
            let (op, operand) = map.iter().next().expect("non-empty object");
            apply_op(op, operand, context)
        }
    }
}

fn apply_op(op: &str, operand: &Value, context: &Value) -> bool {
    match op {
        "var" => is_truthy(&resolve_operand(operand, context)),
        "==" | "!=" | "<" | ">" | "<=" | ">=" => {
            let (a, b) = match binary_operands(operand, context) {
                Some(pair) => pair,
                None => return false,
            };
            match op {
                "==" => a == b,
                "!=" => a != b,
                _ => compare(&a, &b)
                    .map(|ordering| match op {
                        "<" => ordering.is_lt(),
                        ">" => ordering.is_gt(),
                        "<=" => ordering.is_le(),
                        ">=" => ordering.is_ge(),
                        _ => unreachable!(),
                    })
                    .unwrap_or(false),
            }
        }
        "and" => match operand {
            Value::Array(items) => items.iter().all(|item| truthy_expr(item, context)),
            other => truthy_expr(other, context),
        },
        "or" => match operand {
            Value::Array(items) => items.iter().any(|item| truthy_expr(item, context)),
            other => truthy_expr(other, context),
        },
        "!" => !truthy_expr(operand, context),
        "length" => {
            let target = resolve_operand(operand, context);
            length_of(&target).map(|len| len > 0).unwrap_or(false)
        }
        // Unknown operator: treat as truthy rather than dropping the event
        _ => true,
    }
}

fn binary_operands(operand: &Value, context: &Value) -> Option<(Value, Value)> {
    let items = operand.as_array()?;
    if items.len() != 2 {
        return None;
    }
    Some((
        resolve_operand(&items[0], context),
        resolve_operand(&items[1], context),
    ))
}

/// Resolve `{"var": path}` / `{"length": operand}` wrappers; anything else
/// is a literal
fn resolve_operand(operand: &Value, context: &Value) -> Value {
    if let Value::Object(map) = operand {
        if map.len() == 1 {
            if let Some(path) = map.get("var") {
                if let Some(path) = path.as_str() {
                    return resolve_var(path, context).unwrap_or(Value::Null);
                }
            }
            if let Some(inner) = map.get("length") {
                let target = resolve_operand(inner, context);
                return match length_of(&target) {
                    Some(len) => Value::from(len as u64),
                    None => Value::from(0u64),
                };
            }
        }
    }
    operand.clone()
}

/// Navigate a dotted path; a `length` segment yields the current length
pub fn resolve_var(path: &str, context: &Value) -> Option<Value> {
    let mut current = context.clone();
    for part in path.split('.') {
        if part == "length" {
            current = Value::from(length_of(&current)? as u64);
            continue;
        }
        current = match current {
            Value::Object(ref map) => map.get(part)?.clone(),
            Value::Array(ref items) => items.get(part.parse::<usize>().ok()?)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
