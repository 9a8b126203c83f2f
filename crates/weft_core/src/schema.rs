//! Value schemas for stored entries.
//!
//! A schema describes the shape a JSON value must have before it is accepted
//! for a given `(collection, key)` slot. Schemas are supplied when an adapter
//! is constructed; writes that fail validation are rejected without touching
//! the backing store, and reads re-validate so corruption surfaces as an
//! error instead of bad data.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// Expected JSON type for a single field or value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON number (integer or float).
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// Any JSON value, including null.
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

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
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

/// A shape constraint for one stored value.
#[derive(Debug, Clone)]
pub enum Schema {
    /// The value must be an object carrying every listed field with the
    /// listed type. Extra fields are allowed.
    Object(Vec<(String, FieldType)>),
    /// The value itself must have the given type.
    Value(FieldType),
}

impl Schema {
    /// Convenience constructor for an object schema.
    pub fn object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        Schema::Object(fields.into_iter().map(|(n, t)| (n.into(), t)).collect())
    }

    /// Validate a value against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        match self {
            Schema::Value(expected) => {
                if expected.matches(value) {
                    Ok(())
                } else {
                    Err(SchemaViolation {
                        field: None,
                        expected: expected.name(),
                        found: type_name(value),
                    })
                }
            }
            Schema::Object(fields) => {
                let Some(map) = value.as_object() else {
                    return Err(SchemaViolation {
                        field: None,
                        expected: "object",
                        found: type_name(value),
                    });
                };
                for (name, expected) in fields {
                    match map.get(name) {
                        Some(v) if expected.matches(v) => {}
                        Some(v) => {
                            return Err(SchemaViolation {
                                field: Some(name.clone()),
                                expected: expected.name(),
                                found: type_name(v),
                            });
                        }
                        None => {
                            return Err(SchemaViolation {
                                field: Some(name.clone()),
                                expected: expected.name(),
                                found: "missing",
                            });
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// A single-line description of why a value failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Offending field for object schemas, `None` for value schemas.
    pub field: Option<String>,
    /// Expected type name.
    pub expected: &'static str,
    /// Actual type name, or `"missing"`.
    pub found: &'static str,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "field '{}' expected {}, found {}",
                field, self.expected, self.found
            ),
            None => write!(f, "expected {}, found {}", self.expected, self.found),
        }
    }
}

impl std::error::Error for SchemaViolation {}

/// Registry of schemas keyed by `(collection, key)`.
///
/// Slots without a registered schema accept any value.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(String, String), Schema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema for a `(collection, key)` slot, replacing any
    /// previous one.
    pub fn register(
        &mut self,
        collection: impl Into<String>,
        key: impl Into<String>,
        schema: Schema,
    ) {
        self.schemas.insert((collection.into(), key.into()), schema);
    }

    /// Look up the schema for a slot.
    pub fn get(&self, collection: &str, key: &str) -> Option<&Schema> {
        self.schemas
            .get(&(collection.to_string(), key.to_string()))
    }

    /// Validate a value against the slot's schema, if one is registered.
    pub fn validate(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), SchemaViolation> {
        match self.get(collection, key) {
            Some(schema) => schema.validate(value),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_schema_accepts_matching_value() {
        let schema = Schema::object([("message", FieldType::String), ("timestamp", FieldType::Number)]);
        assert!(schema
            .validate(&json!({"message": "hi", "timestamp": 12345}))
            .is_ok());
    }

    #[test]
    fn object_schema_allows_extra_fields() {
        let schema = Schema::object([("message", FieldType::String)]);
        assert!(schema
            .validate(&json!({"message": "hi", "extra": true}))
            .is_ok());
    }

    #[test]
    fn object_schema_rejects_wrong_type() {
        let schema = Schema::object([("message", FieldType::String)]);
        let err = schema.validate(&json!({"message": 42})).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("message"));
        assert_eq!(err.expected, "string");
        assert_eq!(err.found, "number");
    }

    #[test]
    fn object_schema_rejects_missing_field() {
        let schema = Schema::object([("timestamp", FieldType::Number)]);
        let err = schema.validate(&json!({})).unwrap_err();
        assert_eq!(err.found, "missing");
    }

    #[test]
    fn value_schema_checks_top_level_type() {
        let schema = Schema::Value(FieldType::Array);
        assert!(schema.validate(&json!([1, 2])).is_ok());
        assert!(schema.validate(&json!("nope")).is_err());
    }

    #[test]
    fn registry_passes_unregistered_slots() {
        let registry = SchemaRegistry::new();
        assert!(registry.validate("c", "k", &json!(null)).is_ok());
    }

    #[test]
    fn registry_applies_registered_schema() {
        let mut registry = SchemaRegistry::new();
        registry.register(
            "test",
            "data",
            Schema::object([("message", FieldType::String), ("timestamp", FieldType::Number)]),
        );
        assert!(registry
            .validate("test", "data", &json!({"message": "ok", "timestamp": 1}))
            .is_ok());
        assert!(registry
            .validate("test", "data", &json!({"message": 42}))
            .is_err());
        // Other slots are unaffected.
        assert!(registry.validate("test", "other", &json!(42)).is_ok());
    }
}
