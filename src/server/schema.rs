//! Minimal JSON-schema validation for tool arguments.
//!
//! Supports the subset tool definitions actually use: `type`, `properties`,
//! `required`, `enum`, `items`, and `additionalProperties: false`. Unknown
//! keywords are ignored. Validation stops at the first failure and reports
//! its JSON path (`$.filters[2].column`).

use serde_json::{Map, Value};

/// First validation failure found in an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON path of the offending value.
    pub path: String,
    /// What was wrong with it.
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate tool `arguments` against `schema`.
///
/// # Errors
///
/// Returns the first [`SchemaViolation`] encountered.
pub fn validate_arguments(
    schema: &Value,
    arguments: &Map<String, Value>,
) -> Result<(), SchemaViolation> {
    validate_object(schema, arguments, "$")
}

/// Validate an arbitrary `instance` against `schema`.
///
/// # Errors
///
/// Returns the first [`SchemaViolation`] encountered.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), SchemaViolation> {
    validate_at(schema, instance, "$")
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn validate_at(schema_value: &Value, instance: &Value, path: &str) -> Result<(), SchemaViolation> {
    let Some(schema) = schema_value.as_object() else {
        // `true`, `{}` or anything non-object accepts everything.
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, instance, path)?;
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(instance) {
            return Err(violation(
                path,
                format!("value {instance} is not one of {}", Value::Array(allowed.clone())),
            ));
        }
    }

    match instance {
        Value::Object(map) => validate_object(schema_value, map, path),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (idx, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{path}[{idx}]"))?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_object(
    schema: &Value,
    map: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaViolation> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, "object") {
            return Err(violation(path, format!("expected {}, got object", describe(expected))));
        }
    }

    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                return Err(violation(
                    &format!("{path}.{name}"),
                    "required property is missing".to_owned(),
                ));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

    for (key, value) in map {
        let child = format!("{path}.{key}");
        match properties.and_then(|p| p.get(key)) {
            Some(prop_schema) => validate_at(prop_schema, value, &child)?,
            None if closed => {
                return Err(violation(&child, "additional property not allowed".to_owned()));
            }
            None => {}
        }
    }

    Ok(())
}

fn check_type(expected: &Value, instance: &Value, path: &str) -> Result<(), SchemaViolation> {
    let actual = instance_type(instance);
    let ok = type_matches(expected, actual)
        || (actual == "integer" && type_matches(expected, "number"));
    if ok {
        Ok(())
    } else {
        Err(violation(
            path,
            format!("expected {}, got {actual}", describe(expected)),
        ))
    }
}

/// `expected` is either a type name or an array of type names.
fn type_matches(expected: &Value, actual: &str) -> bool {
    match expected {
        Value::String(name) => name == actual,
        Value::Array(names) => names.iter().any(|n| n.as_str() == Some(actual)),
        _ => true,
    }
}

fn instance_type(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

fn violation(path: &str, message: String) -> SchemaViolation {
    SchemaViolation {
        path: path.to_owned(),
        message,
    }
}
