//! Validate tool call arguments against the tool's JSON Schema before execution.
//!
//! Covers the subset of JSON Schema tools actually declare: `type` (single or
//! list), `enum`, `required`, `properties`, `additionalProperties: false` and
//! array `items`. Nested objects and arrays are checked recursively.

use std::fmt;

use serde_json::Value;

/// First violation found, with a JSON-path-like location (`$.files[2].path`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate `args` against `schema`.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), ValidationError> {
    validate_value(args, schema, "$")
}

fn fail(path: &str, message: String) -> Result<(), ValidationError> {
    Err(ValidationError {
        path: path.to_string(),
        message,
    })
}

fn validate_value(value: &Value, schema: &Value, path: &str) -> Result<(), ValidationError> {
    if !schema.is_object() {
        return Ok(());
    }

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| value_matches_type(value, t)) {
            return fail(
                path,
                format!("expected type '{}', got {}", allowed.join("|"), json_type_name(value)),
            );
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return fail(path, format!("value {value} is not one of {}", Value::from(options.clone())));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return fail(path, format!("missing required field '{name}'"));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
        for (key, field) in object {
            match properties.and_then(|props| props.get(key)) {
                Some(field_schema) => {
                    validate_value(field, field_schema, &format!("{path}.{key}"))?;
                }
                None if closed => {
                    return fail(path, format!("unexpected field '{key}'"));
                }
                None => {}
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            validate_value(item, item_schema, &format!("{path}[{index}]"))?;
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" },
                "mode": { "type": "string", "enum": ["fast", "deep"] },
            },
            "required": ["query"],
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        let args = json!({ "query": "rust", "limit": 5, "mode": "deep" });
        assert!(validate_arguments(&args, &search_schema()).is_ok());
    }

    #[test]
    fn rejects_non_object_arguments() {
        let err = validate_arguments(&json!("rust"), &search_schema()).unwrap_err();
        assert_eq!(err.path, "$");
        assert!(err.message.contains("expected type 'object'"));
    }

    #[test]
    fn reports_missing_required_field() {
        let err = validate_arguments(&json!({ "limit": 1 }), &search_schema()).unwrap_err();
        assert_eq!(err.to_string(), "$: missing required field 'query'");
    }

    #[test]
    fn reports_field_type_mismatch_with_path() {
        let err =
            validate_arguments(&json!({ "query": "x", "limit": "ten" }), &search_schema())
                .unwrap_err();
        assert_eq!(err.path, "$.limit");
        assert!(err.message.contains("expected type 'integer'"));
    }

    #[test]
    fn enforces_enum_values() {
        let err = validate_arguments(&json!({ "query": "x", "mode": "slow" }), &search_schema())
            .unwrap_err();
        assert_eq!(err.path, "$.mode");
    }

    #[test]
    fn validates_nested_array_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "path": { "type": "string" } },
                        "required": ["path"],
                    },
                },
            },
        });
        let args = json!({ "edits": [{ "path": "a.rs" }, { "line": 3 }] });
        let err = validate_arguments(&args, &schema).unwrap_err();
        assert_eq!(err.path, "$.edits[1]");
        assert!(err.message.contains("'path'"));
    }

    #[test]
    fn closed_objects_reject_unknown_fields() {
        let schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "additionalProperties": false,
        });
        assert!(validate_arguments(&json!({ "path": "a" }), &schema).is_ok());
        assert!(validate_arguments(&json!({ "path": "a", "x": 1 }), &schema).is_err());
    }

    #[test]
    fn accepts_type_lists_and_empty_schema() {
        let schema = json!({ "type": ["string", "null"] });
        assert!(validate_arguments(&Value::Null, &schema).is_ok());
        assert!(validate_arguments(&json!(3), &schema).is_err());
        assert!(validate_arguments(&json!({ "anything": 1 }), &json!({})).is_ok());
    }
}
