//! Mapping walk: field kinds and nested-object boundaries.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Numeric,
}

impl FieldKind {
    fn from_mapping_type(es_type: &str) -> Option<Self> {
        match es_type {
            "keyword" | "text" | "boolean" => Some(FieldKind::Text),
            "long" | "integer" | "short" | "byte" | "double" | "float" | "half_float"
            | "scaled_float" | "unsigned_long" => Some(FieldKind::Numeric),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Enclosing nested object paths, outermost first.
    pub nested_path: Vec<String>,
    pub is_array: bool,
    /// Top-level text field with an analyzed sub-field usable by keyword search.
    pub searchable: bool,
}

/// Immutable field table for one index, rebuilt only when the mapping changes.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub index: String,
    pub content_hash: String,
    fields: HashMap<String, FieldDescriptor>,
}

impl IndexSchema {
    pub fn build(
        index: &str,
        doc_type: Option<&str>,
        mapping: &Value,
        array_fields: &[String],
        analyzed_suffix: &str,
    ) -> Result<Self> {
        let properties = extract_properties(mapping, doc_type)
            .with_context(|| format!("Failed to read mapping properties for {}", index))?;

        let mut fields = HashMap::new();
        let mut nested_stack = Vec::new();
        walk(
            properties,
            "",
            &mut nested_stack,
            array_fields,
            analyzed_suffix,
            &mut fields,
        );

        Ok(Self {
            index: index.to_string(),
            content_hash: content_hash(mapping),
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    /// Nested boundaries enclosing `name`, outermost first; empty for top-level
    /// or unknown fields.
    pub fn nested_path(&self, name: &str) -> &[String] {
        self.fields
            .get(name)
            .map(|f| f.nested_path.as_slice())
            .unwrap_or(&[])
    }

    pub fn searchable_fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .fields
            .values()
            .filter(|f| f.searchable)
            .map(|f| f.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn fields(&self) -> Vec<&FieldDescriptor> {
        let mut all: Vec<&FieldDescriptor> = self.fields.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

pub fn content_hash(mapping: &Value) -> String {
    let bytes = serde_json::to_vec(mapping).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn extract_properties<'a>(
    mapping: &'a Value,
    doc_type: Option<&str>,
) -> Result<&'a Map<String, Value>> {
    // The response is keyed by the concrete index name, which differs from the
    // requested name when an alias is used.
    let index_body = mapping
        .as_object()
        .and_then(|m| m.values().next())
        .context("Mapping response is empty")?;
    let mappings = index_body
        .get("mappings")
        .context("Mapping response has no mappings section")?;

    if let Some(props) = mappings.get("properties").and_then(Value::as_object) {
        return Ok(props);
    }

    let typed = match doc_type {
        Some(t) => mappings.get(t),
        None => mappings.as_object().and_then(|m| m.values().next()),
    };
    typed
        .and_then(|t| t.get("properties"))
        .and_then(Value::as_object)
        .context("Mapping has no properties")
}

fn walk(
    properties: &Map<String, Value>,
    prefix: &str,
    nested_stack: &mut Vec<String>,
    array_fields: &[String],
    analyzed_suffix: &str,
    out: &mut HashMap<String, FieldDescriptor>,
) {
    for (name, node) in properties {
        let full_name = format!("{}{}", prefix, name);
        let es_type = node.get("type").and_then(Value::as_str);
        let children = node.get("properties").and_then(Value::as_object);

        match (es_type, children) {
            (Some("nested"), Some(children)) => {
                nested_stack.push(full_name.clone());
                walk(
                    children,
                    &format!("{}.", full_name),
                    nested_stack,
                    array_fields,
                    analyzed_suffix,
                    out,
                );
                nested_stack.pop();
            }
            (_, Some(children)) => walk(
                children,
                &format!("{}.", full_name),
                nested_stack,
                array_fields,
                analyzed_suffix,
                out,
            ),
            (Some(es_type), None) => {
                let Some(kind) = FieldKind::from_mapping_type(es_type) else {
                    tracing::debug!("Skipping field {} of unsupported type {}", full_name, es_type);
                    continue;
                };
                let searchable = kind == FieldKind::Text
                    && nested_stack.is_empty()
                    && node
                        .get("fields")
                        .and_then(|f| f.get(analyzed_suffix))
                        .is_some();
                out.insert(
                    full_name.clone(),
                    FieldDescriptor {
                        is_array: array_fields.contains(&full_name),
                        name: full_name,
                        kind,
                        nested_path: nested_stack.clone(),
                        searchable,
                    },
                );
            }
            (None, None) => {}
        }
    }
}
