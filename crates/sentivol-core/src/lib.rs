//! Core data model for the senti-vol warehouse upsert engine.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod plan;

pub const CRATE_NAME: &str = "sentivol-core";

/// A single cell of a batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    TextList(Vec<String>),
    /// Structured (object/array) payload kept as JSON until coerced.
    Json(JsonValue),
}

static NULL_VALUE: Value = Value::Null;

impl Value {
    /// NaN floats and JSON nulls count as null, like a missing cell.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null | Value::Json(JsonValue::Null) => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Date(_) => "date",
            Value::TextList(_) => "text_list",
            Value::Json(_) => "json",
        }
    }

    /// Maps decoded JSON onto cells. Strings stay text; parsing them is the
    /// normalizer's and coercer's job.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
            Value::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            Value::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Value::TextList(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
            }
            Value::Json(v) => v.clone(),
        }
    }

    /// Total order used when ranking staged rows. Nulls sort lowest, numbers
    /// compare across int/float, dates compare against instants at midnight UTC.
    pub fn sql_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (a, b) if a.is_null() && b.is_null() => Ordering::Equal,
            (a, _) if a.is_null() => Ordering::Less,
            (_, b) if b.is_null() => Ordering::Greater,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Date(a), Value::Timestamp(b)) => midnight_utc(*a).cmp(b),
            (Value::Timestamp(a), Value::Date(b)) => a.cmp(&midnight_utc(*b)),
            (Value::TextList(a), Value::TextList(b)) => a.cmp(b),
            (a, b) => a
                .rank()
                .cmp(&b.rank())
                .then_with(|| a.to_json().to_string().cmp(&b.to_json().to_string())),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Date(_) | Value::Timestamp(_) => 5,
            Value::TextList(_) => 6,
            Value::Json(_) => 7,
        }
    }
}

pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

/// One record; a column missing from the map reads as null.
pub type Row = BTreeMap<String, Value>;

pub fn row_from_json_object(object: serde_json::Map<String, JsonValue>) -> Row {
    object
        .into_iter()
        .map(|(k, v)| (k, Value::from_json(v)))
        .collect()
}

/// Ordered rows plus the union of their column names in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let mut batch = Self::new();
        for row in rows {
            batch.push(row);
        }
        batch
    }

    pub fn push(&mut self, row: Row) {
        for name in row.keys() {
            if !self.columns.iter().any(|c| c == name) {
                self.columns.push(name.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get<'a>(&'a self, row: usize, column: &str) -> &'a Value {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&NULL_VALUE)
    }

    /// Rewrites every cell of `column`, feeding null for rows that lack it.
    /// Does nothing when no row carries the column.
    pub fn map_column(&mut self, column: &str, mut f: impl FnMut(&Value) -> Value) {
        if !self.has_column(column) {
            return;
        }
        for row in &mut self.rows {
            let next = f(row.get(column).unwrap_or(&NULL_VALUE));
            row.insert(column.to_string(), next);
        }
    }

    /// Adds `column` with `value` to every row that does not already carry it.
    pub fn fill_column(&mut self, column: &str, value: Value) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
        for row in &mut self.rows {
            row.entry(column.to_string()).or_insert_with(|| value.clone());
        }
    }

    pub fn retain_rows(&mut self, f: impl FnMut(&Row) -> bool) {
        self.rows.retain(f);
    }
}

pub fn row_value<'a>(row: &'a Row, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&NULL_VALUE)
}

/// Declared column type of a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalType {
    Int64,
    Float64,
    Numeric,
    BigNumeric,
    String,
    Json,
    Timestamp,
    DateTime,
    Date,
    Bool,
    Bytes,
    Other(String),
}

/// Coercion buckets. Every logical type lands in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Float,
    Instant,
    Date,
    Text,
    Other,
}

impl LogicalType {
    pub fn as_str(&self) -> &str {
        match self {
            LogicalType::Int64 => "INT64",
            LogicalType::Float64 => "FLOAT64",
            LogicalType::Numeric => "NUMERIC",
            LogicalType::BigNumeric => "BIGNUMERIC",
            LogicalType::String => "STRING",
            LogicalType::Json => "JSON",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::DateTime => "DATETIME",
            LogicalType::Date => "DATE",
            LogicalType::Bool => "BOOL",
            LogicalType::Bytes => "BYTES",
            LogicalType::Other(name) => name,
        }
    }

    pub fn family(&self) -> TypeFamily {
        match self {
            LogicalType::Int64 => TypeFamily::Integer,
            LogicalType::Float64 | LogicalType::Numeric | LogicalType::BigNumeric => {
                TypeFamily::Float
            }
            LogicalType::Timestamp | LogicalType::DateTime => TypeFamily::Instant,
            LogicalType::Date => TypeFamily::Date,
            LogicalType::String | LogicalType::Json => TypeFamily::Text,
            LogicalType::Bool | LogicalType::Bytes | LogicalType::Other(_) => TypeFamily::Other,
        }
    }
}

impl From<&str> for LogicalType {
    fn from(value: &str) -> Self {
        let upper = value.trim().to_ascii_uppercase();
        match upper.as_str() {
            "INT64" | "INTEGER" | "INT" | "BIGINT" => LogicalType::Int64,
            "FLOAT64" | "FLOAT" | "DOUBLE" => LogicalType::Float64,
            "NUMERIC" | "DECIMAL" => LogicalType::Numeric,
            "BIGNUMERIC" | "BIGDECIMAL" => LogicalType::BigNumeric,
            "STRING" => LogicalType::String,
            "JSON" => LogicalType::Json,
            "TIMESTAMP" => LogicalType::Timestamp,
            "DATETIME" => LogicalType::DateTime,
            "DATE" => LogicalType::Date,
            "BOOL" | "BOOLEAN" => LogicalType::Bool,
            "BYTES" => LogicalType::Bytes,
            _ => LogicalType::Other(upper),
        }
    }
}

impl From<String> for LogicalType {
    fn from(value: String) -> Self {
        LogicalType::from(value.as_str())
    }
}

impl From<LogicalType> for String {
    fn from(value: LogicalType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
        }
    }
}

/// One column of a target schema, in the warehouse's `{name, type, mode}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub mode: FieldMode,
}

fn deserialize_mode<'de, D>(deserializer: D) -> Result<FieldMode, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(match raw.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("REPEATED") => FieldMode::Repeated,
        Some("REQUIRED") => FieldMode::Required,
        _ => FieldMode::Nullable,
    })
}

impl FieldSpec {
    pub fn nullable(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            mode: FieldMode::Nullable,
        }
    }

    pub fn repeated(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            mode: FieldMode::Repeated,
        }
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Repeated
    }
}

/// Ordered column declarations of a target table. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSchema {
    fields: Vec<FieldSpec>,
}

impl TargetSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// Non-empty, duplicate-free, ordered key column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct KeySpec(Vec<String>);

impl KeySpec {
    /// Returns `None` when no usable (non-blank) column name is given.
    pub fn new<I, S>(columns: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for column in columns {
            let column = column.into();
            let column = column.trim();
            if column.is_empty() || out.iter().any(|c| c == column) {
                continue;
            }
            out.push(column.to_string());
        }
        if out.is_empty() {
            None
        } else {
            Some(Self(out))
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableRefError {
    #[error("table id `{0}` must look like project.dataset.table or dataset.table")]
    Malformed(String),
}

/// Warehouse table identifier (`project.dataset.table`; project optional).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: Option<impl Into<String>>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.map(Into::into),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn with_table_suffix(&self, suffix: &str) -> Self {
        Self {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: format!("{}{}", self.table, suffix),
        }
    }
}

impl FromStr for TableRef {
    type Err = TableRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().trim_matches('`').split('.').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(TableRefError::Malformed(s.to_string()));
        }
        match parts.as_slice() {
            [project, dataset, table] => Ok(Self::new(Some(*project), *dataset, *table)),
            [dataset, table] => Ok(Self::new(None::<String>, *dataset, *table)),
            _ => Err(TableRefError::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}.{}.{}", project, self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStatus {
    Applied,
    SkippedEmpty,
    ValidationError,
    ExecutionError,
}

impl UpsertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertStatus::Applied => "applied",
            UpsertStatus::SkippedEmpty => "skipped_empty",
            UpsertStatus::ValidationError => "validation_error",
            UpsertStatus::ExecutionError => "execution_error",
        }
    }
}

/// Row accounting for one orchestrator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub run_id: Uuid,
    pub target: String,
    pub rows_considered: usize,
    pub rows_staged: usize,
    pub rows_merged: usize,
    pub status: UpsertStatus,
}

impl MergeOutcome {
    pub fn skipped(run_id: Uuid, target: &TableRef, rows_considered: usize) -> Self {
        Self {
            run_id,
            target: target.to_string(),
            rows_considered,
            rows_staged: 0,
            rows_merged: 0,
            status: UpsertStatus::SkippedEmpty,
        }
    }
}

/// 32-hex-char SHA-256 prefix, for deriving key columns from URLs or titles.
pub fn stable_id(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(32);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stable_id_is_a_truncated_sha256() {
        assert_eq!(stable_id("hello world"), "b94d27b9934d3e08a52e52d7da7dabfa");
        assert_eq!(stable_id("hello world").len(), 32);
    }

    #[test]
    fn batch_columns_are_the_union_in_first_seen_order() {
        let mut a = Row::new();
        a.insert("id".into(), Value::text("a"));
        let mut b = Row::new();
        b.insert("amount".into(), Value::Float(1.0));
        b.insert("id".into(), Value::text("b"));

        let batch = Batch::from_rows([a, b]);
        assert_eq!(batch.columns(), &["id".to_string(), "amount".to_string()]);
        assert!(batch.get(0, "amount").is_null());
        assert_eq!(batch.get(1, "amount"), &Value::Float(1.0));
    }

    #[test]
    fn map_column_feeds_null_for_missing_cells() {
        let mut a = Row::new();
        a.insert("tickers".into(), Value::text("CL"));
        let b = Row::new();
        let mut batch = Batch::from_rows([a, b]);
        batch.map_column("tickers", |v| match v {
            Value::Text(s) => Value::TextList(vec![s.clone()]),
            _ => Value::TextList(vec![]),
        });
        assert_eq!(batch.get(1, "tickers"), &Value::TextList(vec![]));
    }

    #[test]
    fn logical_types_accept_legacy_names() {
        assert_eq!(LogicalType::from("integer"), LogicalType::Int64);
        assert_eq!(LogicalType::from("FLOAT"), LogicalType::Float64);
        assert_eq!(LogicalType::from("BOOLEAN"), LogicalType::Bool);
        assert_eq!(LogicalType::from("geography"), LogicalType::Other("GEOGRAPHY".into()));
        assert_eq!(LogicalType::Numeric.family(), TypeFamily::Float);
        assert_eq!(LogicalType::Json.family(), TypeFamily::Text);
    }

    #[test]
    fn schema_parses_warehouse_json() {
        let schema: TargetSchema = serde_json::from_str(
            r#"[
                {"name": "id", "type": "STRING", "mode": "REQUIRED"},
                {"name": "tickers", "type": "STRING", "mode": "REPEATED"},
                {"name": "seen_at", "type": "TIMESTAMP"},
                {"name": "amount", "type": "FLOAT", "mode": null}
            ]"#,
        )
        .expect("schema");
        assert_eq!(schema.len(), 4);
        assert!(schema.field("tickers").expect("tickers").is_repeated());
        assert_eq!(schema.field("amount").expect("amount").mode, FieldMode::Nullable);
        assert_eq!(
            schema.field("seen_at").expect("seen_at").logical_type,
            LogicalType::Timestamp
        );
    }

    #[test]
    fn key_spec_rejects_empty_and_dedups() {
        assert!(KeySpec::new(Vec::<String>::new()).is_none());
        assert!(KeySpec::new(["  "]).is_none());
        let keys = KeySpec::new(["series_id", "observation_date", "series_id"]).expect("keys");
        assert_eq!(keys.columns(), &["series_id".to_string(), "observation_date".to_string()]);
    }

    #[test]
    fn table_ref_round_trips_and_derives_staging_names() {
        let target: TableRef = "proj.markets.news_articles".parse().expect("table");
        assert_eq!(target.project.as_deref(), Some("proj"));
        assert_eq!(target.with_table_suffix("_staging").to_string(), "proj.markets.news_articles_staging");
        assert!("just_a_table".parse::<TableRef>().is_err());
        assert!("a..b".parse::<TableRef>().is_err());
    }

    #[test]
    fn sql_cmp_orders_nulls_first_and_mixes_dates_with_instants() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).expect("date");
        let noon = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).single().expect("ts");
        assert_eq!(Value::Null.sql_cmp(&Value::Int(1)), Ordering::Less);
        assert_eq!(Value::Float(f64::NAN).sql_cmp(&Value::Null), Ordering::Equal);
        assert_eq!(Value::Date(day).sql_cmp(&Value::Timestamp(noon)), Ordering::Less);
        assert_eq!(Value::Int(2).sql_cmp(&Value::Float(1.5)), Ordering::Greater);
    }
}
