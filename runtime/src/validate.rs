//! JSON Schema checks for values entering a live instance.

use crate::error::{Result, RuntimeError};
use jsonschema::JSONSchema;
use serde_json::Value;

/// Check `value` against `schema`. Empty schemas accept anything and are
/// not compiled.
pub fn check(target: &str, schema: &Value, value: &Value) -> Result<()> {
    if accepts_anything(schema) {
        return Ok(());
    }

    let compiled = JSONSchema::compile(schema).map_err(|e| RuntimeError::SchemaMismatch {
        target: target.to_string(),
        reason: format!("invalid schema: {e}"),
    })?;

    if let Err(errors) = compiled.validate(value) {
        let reason = errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(RuntimeError::SchemaMismatch {
            target: target.to_string(),
            reason,
        });
    }
    Ok(())
}

fn accepts_anything(schema: &Value) -> bool {
    match schema {
        Value::Bool(true) | Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_accepts_and_rejects() {
        let schema = json!({"type": "integer"});
        assert!(check("count", &schema, &json!(3)).is_ok());

        let err = check("count", &schema, &json!("three")).unwrap_err();
        assert!(matches!(err, RuntimeError::SchemaMismatch { target, .. } if target == "count"));
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        assert!(check("any", &json!({}), &json!({"nested": [1, 2]})).is_ok());
    }

    #[test]
    fn test_refs_into_defs_resolve() {
        let schema = json!({
            "$defs": {"Point": {"type": "object", "properties": {"x": {"type": "number"}}, "required": ["x"]}},
            "type": "array",
            "items": {"$ref": "#/$defs/Point"}
        });
        assert!(check("points", &schema, &json!([{"x": 1.5}])).is_ok());
        assert!(check("points", &schema, &json!([{"y": 1}])).is_err());
    }
}
