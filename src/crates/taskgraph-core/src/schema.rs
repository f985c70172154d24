//! JSON-Schema validation for checkpoint-collected input
//!
//! INPUT checkpoints declare an `input_schema` describing the fields the
//! user must supply. With the `json-validation` feature enabled the full
//! JSON-Schema draft is enforced via the `jsonschema` crate; without it a
//! basic structural check (required keys, primitive `type` keywords) still
//! runs so required data can never be silently omitted.

use serde_json::Value;

/// Validate a document against a JSON-Schema-compatible schema
///
/// Returns the first human-readable violation, if any.
pub fn validate_document(data: &Value, schema: &Value) -> Result<(), String> {
    #[cfg(feature = "json-validation")]
    {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| format!("invalid schema: {}", e))?;
        let result = compiled.validate(data);
        if let Err(mut errors) = result {
            if let Some(first) = errors.next() {
                return Err(format!("schema validation failed: {}", first));
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "json-validation"))]
    {
        validate_basic(data, schema)
    }
}

/// Structural check used when full schema validation is not compiled in
///
/// Honors `required` and per-property `type` keywords on the top level.
#[cfg_attr(feature = "json-validation", allow(dead_code))]
pub fn validate_basic(data: &Value, schema: &Value) -> Result<(), String> {
    let schema_obj = match schema.as_object() {
        Some(obj) => obj,
        None => return Ok(()),
    };

    let data_obj = data.as_object();

    if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
        for key in required {
            let key = match key.as_str() {
                Some(k) => k,
                None => continue,
            };
            let present = data_obj
                .map(|obj| obj.get(key).map(|v| !v.is_null()).unwrap_or(false))
                .unwrap_or(false);
            if !present {
                return Err(format!("missing required field '{}'", key));
            }
        }
    }

    if let (Some(properties), Some(data_obj)) = (
        schema_obj.get("properties").and_then(|p| p.as_object()),
        data_obj,
    ) {
        for (name, prop_schema) in properties {
            let declared = prop_schema.get("type").and_then(|t| t.as_str());
            let (Some(declared), Some(value)) = (declared, data_obj.get(name)) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let matches = match declared {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                "null" => value.is_null(),
                _ => true,
            };
            if !matches {
                return Err(format!("field '{}' is not of type '{}'", name, declared));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["recipient", "count"],
            "properties": {
                "recipient": {"type": "string"},
                "count": {"type": "integer"},
                "urgent": {"type": "boolean"}
            }
        })
    }

    #[test]
    fn accepts_conforming_document() {
        let data = json!({"recipient": "alice", "count": 2, "urgent": false});
        assert!(validate_document(&data, &schema()).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let data = json!({"recipient": "alice"});
        let err = validate_document(&data, &schema()).unwrap_err();
        assert!(err.contains("count"), "unexpected error: {}", err);
    }

    #[test]
    fn rejects_wrong_type() {
        let data = json!({"recipient": 42, "count": 2});
        assert!(validate_document(&data, &schema()).is_err());
    }

    #[test]
    fn basic_check_ignores_undeclared_fields() {
        let data = json!({"recipient": "alice", "count": 2, "extra": [1, 2]});
        assert!(validate_basic(&data, &schema()).is_ok());
    }

    #[test]
    fn non_object_schema_is_permissive_in_basic_mode() {
        assert!(validate_basic(&json!({"a": 1}), &json!(true)).is_ok());
    }
}
