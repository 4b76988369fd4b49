//! Preview/full schema projection.
//!
//! A component schema is an ordinary JSON Schema object whose properties may
//! carry an `"inPreview": true` flag. [`project`] splits it into a preview
//! schema (only flagged properties) and a full schema (every property), both
//! with the flag removed. [`extract`] then pulls the matching sparse object
//! out of a data value, one declared field at a time.

use super::selector::SelectorCache;
use crate::error::ExtractionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Property-level flag marking a field as part of the preview view.
pub const PREVIEW_FLAG: &str = "inPreview";

/// The two schema views derived from one component schema.
///
/// `preview_schema.properties` is always a subset of
/// `full_schema.properties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaProjection {
    pub preview_schema: Value,
    pub full_schema: Value,
}

/// Split `schema` into its preview and full views.
///
/// Deterministic; a schema without `properties` yields two empty object
/// schemas.
pub fn project(schema: &Value) -> SchemaProjection {
    let mut preview_props = Map::new();
    let mut full_props = Map::new();

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let flagged = prop.get(PREVIEW_FLAG).and_then(Value::as_bool) == Some(true);
            let mut stripped = prop.clone();
            if let Some(obj) = stripped.as_object_mut() {
                obj.remove(PREVIEW_FLAG);
            }
            if flagged {
                preview_props.insert(name.clone(), stripped.clone());
            }
            full_props.insert(name.clone(), stripped);
        }
    }

    SchemaProjection {
        preview_schema: object_schema(schema, preview_props),
        full_schema: object_schema(schema, full_props),
    }
}

/// Rebuild an object schema around `props`, keeping the source schema's
/// description and only the `required` entries that survived.
fn object_schema(source: &Value, props: Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert("type".into(), Value::from("object"));
    if let Some(desc) = source.get("description") {
        out.insert("description".into(), desc.clone());
    }
    if let Some(required) = source.get("required").and_then(Value::as_array) {
        let kept: Vec<Value> = required
            .iter()
            .filter(|r| r.as_str().is_some_and(|name| props.contains_key(name)))
            .cloned()
            .collect();
        if !kept.is_empty() {
            out.insert("required".into(), Value::Array(kept));
        }
    }
    out.insert("properties".into(), Value::Object(props));
    Value::Object(out)
}

/// Names of the properties declared by `schema`, in schema order.
pub fn property_names(schema: &Value) -> Vec<&str> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Extract the fields declared by `schema` from `data`.
///
/// Iterates the schema's properties, not the data's keys. Each field is
/// resolved through its path-query override when one is given, else by
/// direct field access. A failing override falls back to direct access for
/// that field only. Fields that resolve to `null` are omitted.
pub fn extract(
    data: &Value,
    schema: &Value,
    overrides: &HashMap<String, String>,
    selectors: &SelectorCache,
) -> Map<String, Value> {
    let mut out = Map::new();
    for field in property_names(schema) {
        let value = match overrides.get(field) {
            Some(selector) => resolve_override(data, selector, selectors).unwrap_or_else(|e| {
                warn!(field, error = %e, "selector failed; falling back to field access");
                direct_field(data, field)
            }),
            None => direct_field(data, field),
        };
        if !value.is_null() {
            out.insert(field.to_string(), value);
        }
    }
    out
}

fn resolve_override(
    data: &Value,
    selector: &str,
    selectors: &SelectorCache,
) -> Result<Value, ExtractionError> {
    selectors.search(selector, data)
}

fn direct_field(data: &Value, field: &str) -> Value {
    data.get(field).cloned().unwrap_or(Value::Null)
}
