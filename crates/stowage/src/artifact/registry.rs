//! Component schema registry.
//!
//! Artifact types ("doc", "ticket", "search_hit", ...) are declared by the
//! surrounding runtime as JSON Schemas with per-property `inPreview` flags.
//! The store only needs [`ComponentSchemas::lookup`]; [`SchemaRegistry`] is
//! the in-process implementation, which can also derive a schema from a
//! Rust type via `schemars`.

use super::schema::PREVIEW_FLAG;
use crate::error::SchemaError;
use schemars::JsonSchema;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Lookup of the declared schema for an artifact type.
pub trait ComponentSchemas: Send + Sync {
    /// The schema registered for `artifact_type`, if any.
    fn lookup(&self, artifact_type: &str) -> Option<Value>;
}

/// In-memory registry of component schemas, keyed by artifact type.
///
/// # Example
///
/// ```
/// use schemars::JsonSchema;
/// use stowage::artifact::registry::{ComponentSchemas, SchemaRegistry};
///
/// #[derive(JsonSchema)]
/// struct Doc {
///     title: String,
///     url: String,
///     body: String,
/// }
///
/// let mut registry = SchemaRegistry::new();
/// registry.register_type::<Doc>("doc", &["title", "url"]).unwrap();
/// let schema = registry.lookup("doc").unwrap();
/// assert_eq!(schema["properties"]["title"]["inPreview"], true);
/// assert!(schema["properties"]["body"].get("inPreview").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Value>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hand-written schema for `artifact_type`.
    ///
    /// The schema must compile as JSON Schema; the `inPreview` keyword is
    /// unknown to validators and ignored by them.
    pub fn register(
        &mut self,
        artifact_type: impl Into<String>,
        schema: Value,
    ) -> Result<(), SchemaError> {
        let artifact_type = artifact_type.into();
        if let Err(e) = jsonschema::validator_for(&schema) {
            return Err(SchemaError {
                component: artifact_type,
                message: e.to_string(),
            });
        }
        debug!(artifact_type = %artifact_type, "registered component schema");
        self.schemas.insert(artifact_type, schema);
        Ok(())
    }

    /// Derive a schema from `T` and flag `preview_fields` for the preview
    /// view.
    ///
    /// Naming a field `T` does not declare is an error.
    pub fn register_type<T: JsonSchema>(
        &mut self,
        artifact_type: impl Into<String>,
        preview_fields: &[&str],
    ) -> Result<(), SchemaError> {
        let artifact_type = artifact_type.into();
        let mut schema = crate::json_schema_for::<T>();
        let Some(props) = schema
            .get_mut("properties")
            .and_then(Value::as_object_mut)
        else {
            return Err(SchemaError {
                component: artifact_type,
                message: "derived schema has no properties".into(),
            });
        };
        for field in preview_fields {
            match props.get_mut(*field).and_then(Value::as_object_mut) {
                Some(prop) => {
                    prop.insert(PREVIEW_FLAG.into(), Value::Bool(true));
                }
                None => {
                    return Err(SchemaError {
                        component: artifact_type,
                        message: format!("preview field `{field}` is not declared"),
                    });
                }
            }
        }
        self.register(artifact_type, schema)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(
        mut self,
        artifact_type: impl Into<String>,
        schema: Value,
    ) -> Result<Self, SchemaError> {
        self.register(artifact_type, schema)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl ComponentSchemas for SchemaRegistry {
    fn lookup(&self, artifact_type: &str) -> Option<Value> {
        self.schemas.get(artifact_type).cloned()
    }
}
