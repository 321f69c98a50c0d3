//! Structural JSON-Schema-like compatibility checks for agent I/O.
//!
//! Agent `input_schema`/`output_schema` columns hold a JSON-Schema-like
//! object (`{"type": "object", "properties": {...}, "required": [...]}`).
//! Rather than pull in a full JSON Schema validator for the subset the
//! agent contract actually uses, this module checks the same structural
//! properties a port-compatibility check would: declared type, and for
//! objects, presence of required properties.

use serde_json::Value;

/// Validate a JSON value against a structural schema.
///
/// An empty schema (`{}`) accepts anything. Otherwise the value's runtime
/// type must match `schema.type` (when present), and if the schema is an
/// object schema with a `required` array, every named property must be
/// present in the value.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    if schema.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Ok(());
    }

    if let Some(expected_type) = schema.get("type").and_then(Value::as_str) {
        if !matches_type(value, expected_type) {
            return Err(format!(
                "expected type {expected_type}, got {}",
                value_type_name(value)
            ));
        }
    }

    if let (Some(obj), Some(required)) = (value.as_object(), schema.get("required").and_then(Value::as_array)) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !obj.contains_key(name) {
                return Err(format!("missing required property {name:?}"));
            }
        }
    }

    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate(&json!(42), &json!({})).is_ok());
        assert!(validate(&json!("x"), &json!({})).is_ok());
    }

    #[test]
    fn type_mismatch_rejected() {
        let schema = json!({"type": "object"});
        assert!(validate(&json!("not an object"), &schema).is_err());
    }

    #[test]
    fn required_properties_enforced() {
        let schema = json!({"type": "object", "required": ["a", "b"]});
        assert!(validate(&json!({"a": 1, "b": 2}), &schema).is_ok());
        assert!(validate(&json!({"a": 1}), &schema).is_err());
    }

    #[test]
    fn integer_matches_numeric_json() {
        let schema = json!({"type": "integer"});
        assert!(validate(&json!(5), &schema).is_ok());
    }
}
