//! Row cleanup ahead of coercion.

use sentivol_core::{row_value, Batch, KeySpec, Row, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::coerce::{parse_instant, to_text_list};

/// Which columns get the special treatments. Column names not present in a
/// batch are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Always sequences of strings, never null.
    pub repeated_columns: Vec<String>,
    /// Objects and arrays are serialized to JSON text.
    pub structured_columns: Vec<String>,
    /// Columns ending with this suffix are parsed into instants.
    pub event_time_suffix: String,
    /// Excluded from event-time parsing.
    pub ingestion_column: String,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            repeated_columns: vec!["tickers".to_string()],
            structured_columns: vec!["raw".to_string()],
            event_time_suffix: "_at".to_string(),
            ingestion_column: "ingested_at".to_string(),
        }
    }
}

impl NormalizeOptions {
    pub fn is_event_time_column(&self, column: &str) -> bool {
        !self.event_time_suffix.is_empty()
            && column.ends_with(&self.event_time_suffix)
            && column != self.ingestion_column
            && !self.repeated_columns.iter().any(|c| c == column)
            && !self.structured_columns.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub rows_in: usize,
    pub dropped_empty: usize,
    pub dropped_missing_key: usize,
    pub rows_out: usize,
}

fn blank_to_null(value: &Value) -> Value {
    match value {
        Value::Text(s) if s.trim().is_empty() => Value::Null,
        other => other.clone(),
    }
}

fn structured_to_text(value: &Value) -> Value {
    match value {
        v if v.is_null() => Value::Null,
        Value::Json(JsonValue::String(s)) => Value::Text(s.clone()),
        Value::Json(json) => Value::Text(json.to_string()),
        Value::Text(_) => value.clone(),
        other => Value::Text(other.to_json().to_string()),
    }
}

fn event_time(value: &Value) -> Value {
    parse_instant(value)
        .map(Value::Timestamp)
        .unwrap_or(Value::Null)
}

fn all_null(row: &Row) -> bool {
    row.values().all(Value::is_null)
}

fn missing_key(row: &Row, keys: &KeySpec) -> bool {
    keys.iter().any(|k| row_value(row, k).is_null())
}

/// Cleans `batch` and, when `required_non_null` is given, drops every row
/// with a null in one of those columns. Never fails; a cell that cannot be
/// converted becomes null.
pub fn normalize(
    mut batch: Batch,
    required_non_null: Option<&KeySpec>,
    options: &NormalizeOptions,
) -> (Batch, NormalizeReport) {
    let mut report = NormalizeReport {
        rows_in: batch.len(),
        ..NormalizeReport::default()
    };

    for column in &options.repeated_columns {
        batch.map_column(column, to_text_list);
    }
    for column in &options.structured_columns {
        batch.map_column(column, structured_to_text);
    }
    let event_columns: Vec<String> = batch
        .columns()
        .iter()
        .filter(|c| options.is_event_time_column(c))
        .cloned()
        .collect();
    for column in &event_columns {
        batch.map_column(column, event_time);
    }
    let columns: Vec<String> = batch.columns().to_vec();
    for column in &columns {
        batch.map_column(column, blank_to_null);
    }

    let before = batch.len();
    batch.retain_rows(|row| !all_null(row));
    report.dropped_empty = before - batch.len();

    if let Some(keys) = required_non_null {
        let before = batch.len();
        batch.retain_rows(|row| !missing_key(row, keys));
        report.dropped_missing_key = before - batch.len();
    }
    report.rows_out = batch.len();

    debug!(
        rows_in = report.rows_in,
        dropped_empty = report.dropped_empty,
        dropped_missing_key = report.dropped_missing_key,
        rows_out = report.rows_out,
        "normalized batch"
    );
    (batch, report)
}
