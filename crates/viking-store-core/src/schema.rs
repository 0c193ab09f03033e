//! Declarative vector-collection schema.
//!
//! Every backend accepts the same field list and maps it to its own
//! type system. The serialized form uses the field keys backends have
//! historically exchanged (`FieldName`, `FieldType`, `IsPrimaryKey`,
//! `Dim`).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Path,
    Vector,
    SparseVector,
    DateTime,
    Int64,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "FieldName")]
    pub name: String,
    #[serde(rename = "FieldType")]
    pub field_type: FieldType,
    #[serde(rename = "IsPrimaryKey", default)]
    pub is_primary_key: bool,
    #[serde(rename = "Dim", default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<usize>,
}

impl FieldSchema {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_primary_key: false,
            dim: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(rename = "CollectionName")]
    pub name: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Fields")]
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// Check structural rules: exactly one primary key, vector fields
    /// carry `Dim > 0`, field names are unique.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("collection name must not be empty");
        }

        let pk_count = self.fields.iter().filter(|f| f.is_primary_key).count();
        if pk_count != 1 {
            bail!(
                "collection '{}' must declare exactly one primary key (found {})",
                self.name,
                pk_count
            );
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                bail!("collection '{}': duplicate field '{}'", self.name, field.name);
            }
            if field.field_type == FieldType::Vector && field.dim.unwrap_or(0) == 0 {
                bail!(
                    "collection '{}': vector field '{}' needs Dim > 0",
                    self.name,
                    field.name
                );
            }
        }
        Ok(())
    }

    pub fn primary_key(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary_key)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Dimension of the first dense vector field.
    pub fn vector_dim(&self) -> Option<usize> {
        self.fields
            .iter()
            .find(|f| f.field_type == FieldType::Vector)
            .and_then(|f| f.dim)
    }
}

/// Schema of the collection that indexes context nodes.
pub fn context_collection_schema(name: &str, dims: usize) -> CollectionSchema {
    CollectionSchema {
        name: name.to_string(),
        description: "Unified context collection".to_string(),
        fields: vec![
            FieldSchema::new("id", FieldType::String).primary_key(),
            FieldSchema::new("uri", FieldType::Path),
            FieldSchema::new("parent_uri", FieldType::Path),
            FieldSchema::new("type", FieldType::String),
            FieldSchema::new("context_type", FieldType::String),
            FieldSchema::new("vector", FieldType::Vector).with_dim(dims),
            FieldSchema::new("sparse_vector", FieldType::SparseVector),
            FieldSchema::new("created_at", FieldType::DateTime),
            FieldSchema::new("updated_at", FieldType::DateTime),
            FieldSchema::new("active_count", FieldType::Int64),
            FieldSchema::new("is_leaf", FieldType::Bool),
            FieldSchema::new("name", FieldType::String),
            FieldSchema::new("description", FieldType::String),
            FieldSchema::new("abstract", FieldType::String),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_schema_is_valid() {
        let schema = context_collection_schema("context", 256);
        schema.validate().unwrap();
        assert_eq!(schema.primary_key().unwrap().name, "id");
        assert_eq!(schema.vector_dim(), Some(256));
    }

    #[test]
    fn test_rejects_missing_primary_key() {
        let schema = CollectionSchema {
            name: "c".into(),
            description: String::new(),
            fields: vec![FieldSchema::new("id", FieldType::String)],
        };
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_rejects_vector_without_dim() {
        let schema = CollectionSchema {
            name: "c".into(),
            description: String::new(),
            fields: vec![
                FieldSchema::new("id", FieldType::String).primary_key(),
                FieldSchema::new("vector", FieldType::Vector),
            ],
        };
        let err = schema.validate().unwrap_err().to_string();
        assert!(err.contains("Dim"));
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(context_collection_schema("context", 8)).unwrap();
        assert_eq!(json["CollectionName"], "context");
        assert_eq!(json["Fields"][0]["FieldName"], "id");
        assert_eq!(json["Fields"][0]["IsPrimaryKey"], true);
        assert_eq!(json["Fields"][5]["FieldType"], "vector");
        assert_eq!(json["Fields"][5]["Dim"], 8);
    }
}
