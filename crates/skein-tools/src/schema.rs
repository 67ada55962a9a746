// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Validate tool arguments against the tool's declared input schema.
///
/// Implements the subset of JSON Schema the runtime relies on: `type`,
/// `required`, `properties` (recursive), `enum`, and `items`.  Unknown
/// keywords pass through untouched so richer schemas remain usable.
pub fn validate_input(schema: &Value, args: &Value) -> Result<(), String> {
    validate_at(schema, args, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        // Non-object schemas (true / {}) accept everything.
        return Ok(());
    };

    if let Some(ty) = schema.get("type").and_then(Value::as_str) {
        check_type(ty, value, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!(
                "{path}: value {value} is not one of the allowed values"
            ));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let obj = value.as_object();
        for key in required.iter().filter_map(Value::as_str) {
            if obj.map(|o| !o.contains_key(key)).unwrap_or(true) {
                return Err(format!("{path}: missing required property \"{key}\""));
            }
        }
    }

    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (key, subschema) in props {
            if let Some(sub) = obj.get(key) {
                validate_at(subschema, sub, &format!("{path}.{key}"))?;
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema.get("items"), value.as_array()) {
        for (i, item) in arr.iter().enumerate() {
            validate_at(items, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn check_type(ty: &str, value: &Value, path: &str) -> Result<(), String> {
    let ok = match ty {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        // Unknown type keyword: pass through.
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{path}: expected {ty}, got {}", type_name(value)))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn glob_schema() -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": { "type": "string" },
                "limit": { "type": "integer" }
            }
        })
    }

    #[test]
    fn valid_args_pass() {
        assert!(validate_input(&glob_schema(), &json!({"pattern": "*"})).is_ok());
    }

    #[test]
    fn missing_required_property_fails() {
        let err = validate_input(&glob_schema(), &json!({})).unwrap_err();
        assert!(err.contains("pattern"), "{err}");
    }

    #[test]
    fn wrong_type_fails_with_path() {
        let err = validate_input(&glob_schema(), &json!({"pattern": 3})).unwrap_err();
        assert!(err.contains("$.pattern"), "{err}");
        assert!(err.contains("expected string"), "{err}");
    }

    #[test]
    fn non_object_args_fail_object_schema() {
        let err = validate_input(&glob_schema(), &json!("just a string")).unwrap_err();
        assert!(err.contains("expected object"), "{err}");
    }

    #[test]
    fn integer_rejects_float() {
        let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
        assert!(validate_input(&schema, &json!({"n": 3})).is_ok());
        assert!(validate_input(&schema, &json!({"n": 3.5})).is_err());
    }

    #[test]
    fn enum_constrains_values() {
        let schema = json!({
            "type": "object",
            "properties": { "mode": { "type": "string", "enum": ["read", "write"] } }
        });
        assert!(validate_input(&schema, &json!({"mode": "read"})).is_ok());
        assert!(validate_input(&schema, &json!({"mode": "append"})).is_err());
    }

    #[test]
    fn items_schema_applies_to_each_element() {
        let schema = json!({
            "type": "object",
            "properties": { "paths": { "type": "array", "items": { "type": "string" } } }
        });
        assert!(validate_input(&schema, &json!({"paths": ["a", "b"]})).is_ok());
        let err = validate_input(&schema, &json!({"paths": ["a", 2]})).unwrap_err();
        assert!(err.contains("$.paths[1]"), "{err}");
    }

    #[test]
    fn unknown_keywords_pass_through() {
        let schema = json!({
            "type": "object",
            "properties": { "p": { "type": "string", "minLength": 99, "format": "uri" } }
        });
        // minLength / format are not enforced by this validator
        assert!(validate_input(&schema, &json!({"p": "x"})).is_ok());
    }

    #[test]
    fn extra_properties_are_allowed() {
        assert!(validate_input(&glob_schema(), &json!({"pattern": "*", "verbose": true})).is_ok());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_input(&json!({}), &json!({"anything": [1, 2]})).is_ok());
        assert!(validate_input(&json!(true), &json!(null)).is_ok());
    }
}
