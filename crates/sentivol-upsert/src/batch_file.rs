//! Batch and schema files: a JSON array of objects or newline-delimited
//! objects for batches, the warehouse `{name, type, mode}` shape for schemas.

use std::path::Path;

use anyhow::{bail, Context, Result};
use sentivol_core::{row_from_json_object, Batch, FieldSpec, TargetSchema};
use serde::Deserialize;
use serde_json::Value as JsonValue;

fn object_row(value: JsonValue, position: &str) -> Result<sentivol_core::Row> {
    match value {
        JsonValue::Object(object) => Ok(row_from_json_object(object)),
        other => bail!("{position}: expected a JSON object, found {other}"),
    }
}

pub fn parse_batch(text: &str) -> Result<Batch> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let items: Vec<JsonValue> =
            serde_json::from_str(trimmed).context("parsing JSON array batch")?;
        let rows = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| object_row(item, &format!("element {i}")))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Batch::from_rows(rows));
    }

    let mut batch = Batch::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: JsonValue = serde_json::from_str(line)
            .with_context(|| format!("parsing NDJSON line {}", i + 1))?;
        batch.push(object_row(value, &format!("line {}", i + 1))?);
    }
    Ok(batch)
}

pub async fn read_batch_file(path: &Path) -> Result<Batch> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading batch file {}", path.display()))?;
    parse_batch(&text).with_context(|| format!("decoding batch file {}", path.display()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaDocument {
    Fields(Vec<FieldSpec>),
    Wrapped { fields: Vec<FieldSpec> },
}

pub fn parse_schema(text: &str) -> Result<TargetSchema> {
    let fields = match serde_json::from_str::<SchemaDocument>(text).context("parsing schema")? {
        SchemaDocument::Fields(fields) | SchemaDocument::Wrapped { fields } => fields,
    };
    if fields.is_empty() {
        bail!("schema declares no fields");
    }
    Ok(TargetSchema::new(fields))
}

pub async fn read_schema_file(path: &Path) -> Result<TargetSchema> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading schema file {}", path.display()))?;
    parse_schema(&text).with_context(|| format!("decoding schema file {}", path.display()))
}
