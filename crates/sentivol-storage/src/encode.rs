//! Arrow/Parquet encoding of a coerced batch under a target schema.
//!
//! The encoded file always carries exactly the schema's columns, in schema
//! order, so a table loaded from it is structurally identical to the target.

use std::sync::Arc;

use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array, Int64Array,
    RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use sentivol_core::{
    midnight_utc, row_value, Batch, FieldMode, FieldSpec, LogicalType, TargetSchema, Value,
};

use crate::WarehouseError;

pub const DECIMAL_PRECISION: u8 = 38;
pub const DECIMAL_SCALE: i8 = 9;

fn scalar_type(logical_type: &LogicalType) -> DataType {
    match logical_type {
        LogicalType::Int64 => DataType::Int64,
        LogicalType::Float64 => DataType::Float64,
        LogicalType::Numeric | LogicalType::BigNumeric => {
            DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE)
        }
        LogicalType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        LogicalType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
        LogicalType::Date => DataType::Date32,
        LogicalType::Bool => DataType::Boolean,
        LogicalType::Bytes => DataType::Binary,
        LogicalType::String | LogicalType::Json | LogicalType::Other(_) => DataType::Utf8,
    }
}

pub fn arrow_field(field: &FieldSpec) -> ArrowField {
    if field.is_repeated() {
        // Repeated columns are staged as string lists.
        let item = ArrowField::new("item", DataType::Utf8, true);
        return ArrowField::new(&field.name, DataType::List(Arc::new(item)), false);
    }
    ArrowField::new(
        &field.name,
        scalar_type(&field.logical_type),
        field.mode != FieldMode::Required,
    )
}

pub fn arrow_schema(schema: &TargetSchema) -> Schema {
    Schema::new(schema.fields().iter().map(arrow_field).collect::<Vec<_>>())
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        v if v.is_null() => None,
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        other => Some(other.to_json().to_string()),
    }
}

fn cell_micros(value: &Value) -> Option<i64> {
    match value {
        Value::Timestamp(ts) => Some(ts.timestamp_micros()),
        Value::Date(d) => Some(midnight_utc(*d).timestamp_micros()),
        _ => None,
    }
}

fn cell_days(value: &Value) -> Option<i32> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    match value {
        Value::Date(d) => i32::try_from((*d - epoch).num_days()).ok(),
        Value::Timestamp(ts) => i32::try_from((ts.date_naive() - epoch).num_days()).ok(),
        _ => None,
    }
}

fn cell_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) if f.is_finite() => Some(*f),
        Value::Int(i) => Some(*i as f64),
        _ => None,
    }
}

fn cell_decimal(value: &Value) -> Option<i128> {
    let scaled = cell_f64(value)? * 10f64.powi(DECIMAL_SCALE as i32);
    if scaled.abs() >= 1e37 {
        return None;
    }
    Some(scaled.round() as i128)
}

fn column_array(field: &FieldSpec, batch: &Batch) -> Result<ArrayRef, ArrowError> {
    let cells = batch.rows().iter().map(|row| row_value(row, &field.name));

    if field.is_repeated() {
        let mut builder = ListBuilder::new(StringBuilder::new());
        for cell in cells {
            match cell {
                Value::TextList(items) => {
                    for item in items {
                        builder.values().append_value(item);
                    }
                }
                other => {
                    if let Some(text) = cell_text(other) {
                        builder.values().append_value(text);
                    }
                }
            }
            builder.append(true);
        }
        return Ok(Arc::new(builder.finish()));
    }

    let array: ArrayRef = match &field.logical_type {
        LogicalType::Int64 => Arc::new(Int64Array::from(
            cells
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        LogicalType::Float64 => Arc::new(Float64Array::from(cells.map(cell_f64).collect::<Vec<_>>())),
        LogicalType::Numeric | LogicalType::BigNumeric => Arc::new(
            Decimal128Array::from(cells.map(cell_decimal).collect::<Vec<_>>())
                .with_precision_and_scale(DECIMAL_PRECISION, DECIMAL_SCALE)?,
        ),
        LogicalType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(cells.map(cell_micros).collect::<Vec<_>>())
                .with_timezone("UTC"),
        ),
        LogicalType::DateTime => Arc::new(TimestampMicrosecondArray::from(
            cells.map(cell_micros).collect::<Vec<_>>(),
        )),
        LogicalType::Date => Arc::new(Date32Array::from(cells.map(cell_days).collect::<Vec<_>>())),
        LogicalType::Bool => Arc::new(BooleanArray::from(
            cells
                .map(|v| match v {
                    Value::Bool(b) => Ok(Some(*b)),
                    v if v.is_null() => Ok(None),
                    other => Err(ArrowError::InvalidArgumentError(format!(
                        "column {} declared BOOL cannot hold {} value",
                        field.name,
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        LogicalType::Bytes => Arc::new(BinaryArray::from(
            cells
                .map(|v| match v {
                    Value::Bytes(b) => Some(b.as_slice()),
                    Value::Text(s) => Some(s.as_bytes()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        LogicalType::String | LogicalType::Json | LogicalType::Other(_) => Arc::new(
            StringArray::from(cells.map(cell_text).collect::<Vec<_>>()),
        ),
    };
    Ok(array)
}

pub fn to_record_batch(schema: &TargetSchema, batch: &Batch) -> Result<RecordBatch, ArrowError> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| column_array(field, batch))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(Arc::new(arrow_schema(schema)), columns)
}

/// Encodes `batch` as a single-row-group Parquet file held in memory.
pub fn to_parquet_bytes(schema: &TargetSchema, batch: &Batch) -> Result<Vec<u8>, WarehouseError> {
    let record_batch =
        to_record_batch(schema, batch).map_err(|e| WarehouseError::Encode(e.to_string()))?;
    let mut writer = ArrowWriter::try_new(Vec::new(), record_batch.schema(), None)
        .map_err(|e| WarehouseError::Encode(e.to_string()))?;
    writer
        .write(&record_batch)
        .map_err(|e| WarehouseError::Encode(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| WarehouseError::Encode(e.to_string()))
}
