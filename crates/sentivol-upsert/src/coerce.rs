//! Cell conversion toward a target schema's declared types.
//!
//! Every converter is total: it returns a value the declared type can hold,
//! or `Value::Null`. Which converter runs is decided once per field from its
//! [`TypeFamily`], never by comparing type names.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sentivol_core::{midnight_utc, Batch, FieldSpec, TargetSchema, TypeFamily, Value};
use serde_json::Value as JsonValue;

pub type Converter = fn(&Value) -> Value;

/// Offset-carrying layouts tried after RFC 3339 and RFC 2822.
const ZONED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// Zone-less layouts, read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

pub fn converter_for(family: TypeFamily) -> Converter {
    match family {
        TypeFamily::Integer => to_int64,
        TypeFamily::Float => to_float64,
        TypeFamily::Instant => to_timestamp,
        TypeFamily::Date => to_date,
        TypeFamily::Text => to_text,
        TypeFamily::Other => to_other,
    }
}

pub fn coerce_value(value: &Value, field: &FieldSpec) -> Value {
    if field.is_repeated() {
        return to_text_list(value);
    }
    converter_for(field.logical_type.family())(value)
}

/// Converts every column present in both `batch` and `schema`. Columns the
/// schema does not declare pass through untouched.
pub fn coerce(mut batch: Batch, schema: &TargetSchema) -> Batch {
    for field in schema.fields() {
        if field.is_repeated() {
            batch.map_column(&field.name, to_text_list);
        } else {
            batch.map_column(&field.name, converter_for(field.logical_type.family()));
        }
    }
    batch
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

fn integral(f: f64) -> Option<i64> {
    // i64::MAX is not representable; the upper bound is exclusive.
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

pub fn to_int64(value: &Value) -> Value {
    let parsed = match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) => integral(*f),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| parse_number(s).and_then(integral)),
        Value::Json(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        _ => None,
    };
    parsed.map(Value::Int).unwrap_or(Value::Null)
}

pub fn to_float64(value: &Value) -> Value {
    let parsed = match value {
        Value::Float(f) if f.is_finite() => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Text(s) => parse_number(s),
        Value::Json(JsonValue::Number(n)) => n.as_f64(),
        _ => None,
    };
    parsed.map(Value::Float).unwrap_or(Value::Null)
}

/// Parses free-form instant text. Zone-less text is taken as UTC and a bare
/// date as midnight UTC.
pub fn parse_instant_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ZONED_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    parse_date_text(text).map(midnight_utc)
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

fn epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = seconds * 1_000_000.0;
    if micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros.round() as i64)
}

/// Numbers are Unix epoch seconds.
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Date(d) => Some(midnight_utc(*d)),
        Value::Int(i) => DateTime::from_timestamp(*i, 0),
        Value::Float(f) => epoch_seconds(*f),
        Value::Text(s) => parse_instant_text(s),
        Value::Bytes(b) => std::str::from_utf8(b).ok().and_then(parse_instant_text),
        Value::Json(JsonValue::String(s)) => parse_instant_text(s),
        _ => None,
    }
}

pub fn to_timestamp(value: &Value) -> Value {
    parse_instant(value)
        .map(Value::Timestamp)
        .unwrap_or(Value::Null)
}

pub fn to_date(value: &Value) -> Value {
    let parsed = match value {
        Value::Date(d) => Some(*d),
        Value::Text(s) => parse_date_text(s).or_else(|| parse_instant_text(s).map(|ts| ts.date_naive())),
        other => parse_instant(other).map(|ts| ts.date_naive()),
    };
    parsed.map(Value::Date).unwrap_or(Value::Null)
}

/// Text rendering of a non-null cell: strings verbatim, structured values as
/// compact JSON, instants as RFC 3339.
pub fn text_of(value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    Some(match value {
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Timestamp(ts) => ts.to_rfc3339(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::Json(JsonValue::String(s)) => s.clone(),
        other => other.to_json().to_string(),
    })
}

pub fn to_text(value: &Value) -> Value {
    text_of(value).map(Value::Text).unwrap_or(Value::Null)
}

fn json_element_text(item: &JsonValue) -> String {
    match item {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Never null: absent becomes empty, a scalar becomes one element.
pub fn to_text_list(value: &Value) -> Value {
    let items = match value {
        v if v.is_null() => Vec::new(),
        Value::TextList(items) => items.clone(),
        Value::Json(JsonValue::Array(items)) => items.iter().map(json_element_text).collect(),
        other => text_of(other).into_iter().collect(),
    };
    Value::TextList(items)
}

/// Declared types without a dedicated converter: bytes are decoded when they
/// are valid UTF-8, everything else is left as is.
pub fn to_other(value: &Value) -> Value {
    match value {
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(text) => Value::Text(text.to_string()),
            Err(_) => value.clone(),
        },
        _ => value.clone(),
    }
}
