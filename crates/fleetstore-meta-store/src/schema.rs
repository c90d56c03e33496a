//! Structural collection schemas
//!
//! Schemas are strict: every field must be declared, required fields must be
//! present and every present field must have its declared type. The `_id`
//! field is always allowed.

use crate::document::{Document, ID_FIELD};
use serde_json::Value;
use std::fmt;

/// Type of a schema field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    /// Identifier string (UUID text form)
    ObjectId,
    Integer,
    Number,
    Boolean,
    String,
    /// Object whose values are all integers (counter maps)
    IntegerMap,
    Array,
    Object,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::ObjectId => value.as_str().is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::String => value.is_string(),
            Self::IntegerMap => value
                .as_object()
                .is_some_and(|m| m.values().all(|v| v.is_i64() || v.is_u64())),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ObjectId => "objectid",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::IntegerMap => "integer map",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// A declared field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

impl FieldSpec {
    #[must_use]
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    #[must_use]
    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// One reason a document does not match its schema
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaViolation {
    Missing(&'static str),
    WrongType { field: String, expected: FieldType },
    Unknown(String),
    NotAnObject,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(field) => write!(f, "missing required field {field}"),
            Self::WrongType { field, expected } => write!(f, "field {field} must be {expected}"),
            Self::Unknown(field) => write!(f, "unknown field {field}"),
            Self::NotAnObject => f.write_str("document is not an object"),
        }
    }
}

/// How violations are handled for a collection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Reject the write
    #[default]
    Strict,
    /// Log the violations and keep the record
    Warn,
}

/// Strict structural schema of one collection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionSchema {
    pub fields: Vec<FieldSpec>,
}

impl CollectionSchema {
    #[must_use]
    pub fn new(fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check a document, collecting every violation
    pub fn validate(&self, doc: &Document) -> Result<(), Vec<SchemaViolation>> {
        let mut violations = Vec::new();
        for spec in &self.fields {
            match doc.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    violations.push(SchemaViolation::Missing(spec.name));
                }
                Some(value) if !value.is_null() && !spec.ty.accepts(value) => {
                    violations.push(SchemaViolation::WrongType {
                        field: spec.name.to_string(),
                        expected: spec.ty,
                    });
                }
                _ => {}
            }
        }
        for key in doc.keys() {
            if key != ID_FIELD && self.field(key).is_none() {
                violations.push(SchemaViolation::Unknown(key.clone()));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Check a JSON value that should be a document
    pub fn validate_value(&self, value: &Value) -> Result<(), Vec<SchemaViolation>> {
        value
            .as_object()
            .map_or_else(|| Err(vec![SchemaViolation::NotAnObject]), |doc| self.validate(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_schema() -> CollectionSchema {
        CollectionSchema::new([
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("fragment", FieldType::Integer),
            FieldSpec::optional("upload_mode", FieldType::Boolean),
        ])
    }

    #[test]
    fn test_valid_document() {
        let doc = json!({
            "_id": "b1",
            "system": uuid::Uuid::new_v4().to_string(),
            "fragment": 0,
        });
        assert!(block_schema().validate_value(&doc).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let doc = json!({
            "system": "not-a-uuid",
            "upload_mode": "yes",
            "extra": 1,
        });
        let violations = block_schema().validate_value(&doc).unwrap_err();

        assert!(violations.contains(&SchemaViolation::Missing("fragment")));
        assert!(violations.contains(&SchemaViolation::Unknown("extra".to_string())));
        assert_eq!(violations.len(), 4);
        assert_eq!(violations[0].to_string(), "field system must be objectid");
    }

    #[test]
    fn test_integer_map() {
        let schema = CollectionSchema::new([FieldSpec::optional("usage", FieldType::IntegerMap)]);
        assert!(schema.validate_value(&json!({"usage": {"put": 3}})).is_ok());
        assert!(schema.validate_value(&json!({"usage": {"put": "3"}})).is_err());
    }
}
