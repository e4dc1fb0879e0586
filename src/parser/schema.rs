use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExtractionFailure;
use crate::record::FieldSet;

/// Declarative extraction schema: one base selector per listing plus
/// per-field selectors evaluated inside each base element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "baseSelector")]
    pub base_selector: String,
    pub fields: Vec<SchemaField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub selector: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Attribute,
}

impl SchemaField {
    fn text(name: &str, selector: &str) -> Self {
        SchemaField {
            name: name.to_string(),
            selector: selector.to_string(),
            kind: FieldKind::Text,
            attribute: None,
        }
    }
}

impl Default for ExtractionSchema {
    /// Hand-written schema for the directory's result cards, used when no
    /// schema file is given or schema generation fails.
    fn default() -> Self {
        ExtractionSchema {
            name: Some("practitioners".to_string()),
            base_selector: "div:has(h2 button)".to_string(),
            fields: vec![
                SchemaField::text("name", "h2 button"),
                SchemaField::text("specialty", "h2 + div p, p"),
                SchemaField::text(
                    "address",
                    "p:contains('Rue'), p:contains('Boulevard'), p:contains('Avenue'), p:contains('Place'), p:contains('Square')",
                ),
                SchemaField::text("distance", "span:contains('km')"),
                SchemaField::text(
                    "sector_info",
                    "p:contains('Conventionné'), p:contains('Établissement')",
                ),
                SchemaField {
                    name: "profile_url".to_string(),
                    selector: "a[href]".to_string(),
                    kind: FieldKind::Attribute,
                    attribute: Some("href".to_string()),
                },
            ],
        }
    }
}

impl ExtractionSchema {
    pub fn from_json(json: &str) -> Result<Self, ExtractionFailure> {
        let schema: ExtractionSchema = serde_json::from_str(json)?;
        if schema.base_selector.trim().is_empty() {
            return Err(ExtractionFailure::UnexpectedShape("empty baseSelector"));
        }
        if !schema.fields.iter().any(|f| f.name == "name") {
            return Err(ExtractionFailure::UnexpectedShape("schema has no `name` field"));
        }
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema {}", path.display()))?;
        ExtractionSchema::from_json(&raw)
            .with_context(|| format!("parsing schema {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json + "\n")
            .with_context(|| format!("writing schema {}", path.display()))
    }
}

/// Parse field-sets returned by a collaborator that applied the schema
/// server-side. Accepts an array of objects or a single object.
pub fn parse_structured_json(json: &str) -> Result<Vec<FieldSet>, ExtractionFailure> {
    let value: Value = serde_json::from_str(json)?;
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return Err(ExtractionFailure::UnexpectedShape("expected array or object")),
    };

    let mut sets = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(map) = item else {
            continue;
        };
        let mut fs = FieldSet::default();
        for (key, v) in map {
            match v {
                Value::String(s) => fs.set(&key, s),
                Value::Number(n) => fs.set(&key, n.to_string()),
                Value::Array(parts) => {
                    let joined: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
                    if !joined.is_empty() {
                        fs.set(&key, joined.join(", "));
                    }
                }
                _ => {}
            }
        }
        sets.push(fs);
    }
    Ok(sets)
}
