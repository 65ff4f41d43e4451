//! In-process warehouse that executes loads and merge plans structurally.
//!
//! It mirrors the warehouse behaviour the engine relies on: loads reject cells
//! whose type disagrees with the declared schema, truncating loads replace the
//! table, and merges deduplicate the source with the plan's ranking before
//! matching on the key columns. Used by tests and dry runs.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sentivol_core::plan::{MergePlan, OrderTerm, SortDirection};
use sentivol_core::{
    midnight_utc, row_value, FieldMode, FieldSpec, LogicalType, Row, TableRef, TargetSchema,
    TypeFamily, Value,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{JobReceipt, LoadRequest, Warehouse, WarehouseError, WriteDisposition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarehouseOp {
    FetchSchema,
    Load,
    Merge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTable {
    pub schema: TargetSchema,
    pub rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    failures: HashMap<WarehouseOp, String>,
    jobs_run: u64,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, table: &TableRef, schema: TargetSchema) {
        let mut state = self.state.lock().await;
        state.tables.insert(
            table.to_string(),
            MemoryTable {
                schema,
                rows: Vec::new(),
            },
        );
    }

    /// Seeds rows directly, bypassing type checks.
    pub async fn insert_rows(&self, table: &TableRef, rows: Vec<Row>) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .get_mut(&table.to_string())
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        let schema = entry.schema.clone();
        entry
            .rows
            .extend(rows.into_iter().map(|row| project_row(&schema, &row)));
        Ok(())
    }

    pub async fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.state.lock().await.tables.get(&table.to_string()).cloned()
    }

    pub async fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.table(table).await.map(|t| t.rows).unwrap_or_default()
    }

    /// Makes every subsequent `op` fail with `message` until cleared.
    pub async fn fail_on(&self, op: WarehouseOp, message: impl Into<String>) {
        self.state.lock().await.failures.insert(op, message.into());
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    pub async fn jobs_run(&self) -> u64 {
        self.state.lock().await.jobs_run
    }
}

impl MemoryState {
    fn next_job(&mut self, op: WarehouseOp) -> Result<String, WarehouseError> {
        self.jobs_run += 1;
        let job_id = format!("memory-job-{}", self.jobs_run);
        match self.failures.get(&op) {
            Some(message) => Err(WarehouseError::JobFailed {
                job_id,
                message: message.clone(),
            }),
            None => Ok(job_id),
        }
    }
}

fn empty_cell(field: &FieldSpec) -> Value {
    if field.is_repeated() {
        Value::TextList(Vec::new())
    } else {
        Value::Null
    }
}

/// Keeps exactly the schema's columns, filling absent ones.
fn project_row(schema: &TargetSchema, row: &Row) -> Row {
    schema
        .fields()
        .iter()
        .map(|field| {
            let value = match row.get(&field.name) {
                Some(v) if !v.is_null() => v.clone(),
                _ => empty_cell(field),
            };
            (field.name.clone(), value)
        })
        .collect()
}

fn cell_matches(field: &FieldSpec, value: &Value) -> bool {
    if value.is_null() {
        return field.mode != FieldMode::Required;
    }
    if field.is_repeated() {
        return matches!(value, Value::TextList(_));
    }
    match field.logical_type.family() {
        TypeFamily::Integer => matches!(value, Value::Int(_)),
        TypeFamily::Float => matches!(value, Value::Int(_) | Value::Float(_)),
        TypeFamily::Instant => matches!(value, Value::Timestamp(_)),
        TypeFamily::Date => matches!(value, Value::Date(_)),
        TypeFamily::Text => matches!(value, Value::Text(_)),
        TypeFamily::Other => match field.logical_type {
            LogicalType::Bool => matches!(value, Value::Bool(_)),
            _ => true,
        },
    }
}

fn check_row(schema: &TargetSchema, row: &Row, index: usize) -> Result<(), String> {
    for field in schema.fields() {
        let value = row_value(row, &field.name);
        if !cell_matches(field, value) {
            return Err(format!(
                "row {index}: column {} declared {} {} cannot hold {} value",
                field.name,
                field.mode.as_str(),
                field.logical_type,
                value.type_name()
            ));
        }
    }
    Ok(())
}

/// `SAFE_CAST(x AS TIMESTAMP)`: unparsable input becomes null.
fn safe_cast_timestamp(value: &Value) -> Value {
    match value {
        Value::Timestamp(_) => value.clone(),
        Value::Date(d) => Value::Timestamp(midnight_utc(*d)),
        Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f").map(|n| n.and_utc())
            })
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn compare_by_terms(a: &Row, b: &Row, terms: &[OrderTerm]) -> Ordering {
    for term in terms {
        let (va, vb) = if term.cast_to_timestamp {
            (
                safe_cast_timestamp(row_value(a, &term.column)),
                safe_cast_timestamp(row_value(b, &term.column)),
            )
        } else {
            (
                row_value(a, &term.column).clone(),
                row_value(b, &term.column).clone(),
            )
        };
        // Nulls sort first ascending and last descending.
        let ord = match term.direction {
            SortDirection::Asc => va.sql_cmp(&vb),
            SortDirection::Desc => vb.sql_cmp(&va),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn partition_key(row: &Row, columns: &[String]) -> String {
    let parts: Vec<_> = columns.iter().map(|c| row_value(row, c).to_json()).collect();
    serde_json::Value::Array(parts).to_string()
}

/// `SELECT * EXCEPT(rank) FROM (... ROW_NUMBER() ...) WHERE rank = 1`.
/// Ties keep the earliest staged row.
fn rank_first_per_partition(rows: &[Row], plan: &MergePlan) -> Vec<Row> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Row>> = HashMap::new();
    for row in rows {
        let key = partition_key(row, &plan.ranking.partition_by);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    order
        .iter()
        .filter_map(|key| {
            let mut group = groups.remove(key)?;
            group.sort_by(|a, b| compare_by_terms(a, b, &plan.ranking.order_by));
            group.first().map(|row| (*row).clone())
        })
        .collect()
}

fn keys_equal(target: &Row, source: &Row, on: &[String]) -> bool {
    on.iter().all(|c| {
        let t = row_value(target, c);
        let s = row_value(source, c);
        // SQL equality: null never matches.
        !t.is_null() && !s.is_null() && t.sql_cmp(s) == Ordering::Equal
    })
}

fn missing_columns<'a>(schema: &TargetSchema, columns: impl Iterator<Item = &'a String>) -> Vec<String> {
    columns
        .filter(|c| !schema.contains(c))
        .cloned()
        .collect()
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn fetch_schema(&self, table: &TableRef) -> Result<TargetSchema, WarehouseError> {
        let mut state = self.state.lock().await;
        state.next_job(WarehouseOp::FetchSchema)?;
        state
            .tables
            .get(&table.to_string())
            .map(|t| t.schema.clone())
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
    }

    async fn load_table(&self, request: LoadRequest<'_>) -> Result<JobReceipt, WarehouseError> {
        let mut state = self.state.lock().await;
        let job_id = state.next_job(WarehouseOp::Load)?;

        let mut projected = Vec::with_capacity(request.batch.len());
        for (index, row) in request.batch.rows().iter().enumerate() {
            let row = project_row(request.schema, row);
            check_row(request.schema, &row, index).map_err(|message| WarehouseError::JobFailed {
                job_id: job_id.clone(),
                message,
            })?;
            projected.push(row);
        }
        let loaded = projected.len() as u64;

        let key = request.table.to_string();
        match request.disposition {
            WriteDisposition::Truncate => {
                state.tables.insert(
                    key,
                    MemoryTable {
                        schema: request.schema.clone(),
                        rows: projected,
                    },
                );
            }
            WriteDisposition::Append => {
                let table = state.tables.entry(key).or_insert_with(|| MemoryTable {
                    schema: request.schema.clone(),
                    rows: Vec::new(),
                });
                table.rows.extend(projected);
            }
        }
        debug!(%job_id, table = %request.table, rows = loaded, "memory load finished");

        Ok(JobReceipt {
            job_id,
            rows_affected: Some(loaded),
        })
    }

    async fn execute_merge(
        &self,
        plan: &MergePlan,
        _location: Option<&str>,
    ) -> Result<JobReceipt, WarehouseError> {
        let mut state = self.state.lock().await;
        let job_id = state.next_job(WarehouseOp::Merge)?;
        let fail = |message: String| WarehouseError::JobFailed {
            job_id: job_id.clone(),
            message,
        };

        let source = state
            .tables
            .get(&plan.source.to_string())
            .ok_or_else(|| fail(format!("Not found: Table {}", plan.source)))?;
        let target = state
            .tables
            .get(&plan.target.to_string())
            .ok_or_else(|| fail(format!("Not found: Table {}", plan.target)))?;

        let referenced = plan
            .insert_columns
            .iter()
            .chain(plan.on_columns.iter())
            .chain(plan.ranking.order_by.iter().map(|t| &t.column));
        let unknown_in_source = missing_columns(&source.schema, referenced.clone());
        if !unknown_in_source.is_empty() {
            return Err(fail(format!(
                "Unrecognized name(s) in {}: {}",
                plan.source,
                unknown_in_source.join(", ")
            )));
        }
        let unknown_in_target = missing_columns(
            &target.schema,
            plan.insert_columns.iter().chain(plan.on_columns.iter()),
        );
        if !unknown_in_target.is_empty() {
            return Err(fail(format!(
                "Unrecognized name(s) in {}: {}",
                plan.target,
                unknown_in_target.join(", ")
            )));
        }

        let winners = rank_first_per_partition(&source.rows, plan);
        let target_schema = target.schema.clone();
        let mut target_rows = target.rows.clone();
        let mut affected = 0u64;

        for winner in &winners {
            let mut matched = 0u64;
            for existing in target_rows
                .iter_mut()
                .filter(|t| keys_equal(t, winner, &plan.on_columns))
            {
                matched += 1;
                if plan.update_columns.is_empty() {
                    continue;
                }
                for column in &plan.update_columns {
                    existing.insert(column.clone(), row_value(winner, column).clone());
                }
            }
            if matched > 0 {
                if !plan.update_columns.is_empty() {
                    affected += matched;
                }
                continue;
            }
            let mut inserted = Row::new();
            for column in &plan.insert_columns {
                inserted.insert(column.clone(), row_value(winner, column).clone());
            }
            target_rows.push(project_row(&target_schema, &inserted));
            affected += 1;
        }

        if let Some(table) = state.tables.get_mut(&plan.target.to_string()) {
            table.rows = target_rows;
        }
        debug!(%job_id, table = %plan.target, affected, "memory merge finished");

        Ok(JobReceipt {
            job_id,
            rows_affected: Some(affected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sentivol_core::plan::{Ranking, RankingBasis};
    use sentivol_core::Batch;

    fn schema() -> TargetSchema {
        TargetSchema::new(vec![
            FieldSpec::nullable("id", LogicalType::String),
            FieldSpec::nullable("amount", LogicalType::Float64),
            FieldSpec::nullable("seen_at", LogicalType::Timestamp),
            FieldSpec::repeated("tickers", LogicalType::String),
        ])
    }

    fn row(id: &str, amount: f64, day: u32) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::text(id));
        row.insert("amount".into(), Value::Float(amount));
        row.insert(
            "seen_at".into(),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().expect("ts")),
        );
        row
    }

    fn plan(target: &TableRef, staging: &TableRef) -> MergePlan {
        MergePlan {
            target: target.clone(),
            source: staging.clone(),
            on_columns: vec!["id".into()],
            update_columns: vec!["amount".into(), "seen_at".into()],
            insert_columns: vec!["id".into(), "amount".into(), "seen_at".into()],
            ranking: Ranking {
                basis: RankingBasis::EventTime("seen_at".into()),
                partition_by: vec!["id".into()],
                order_by: vec![OrderTerm::recency("seen_at")],
            },
        }
    }

    #[tokio::test]
    async fn truncating_load_replaces_rows_and_fills_absent_columns() {
        let wh = MemoryWarehouse::new();
        let staging: TableRef = "p.d.t_staging".parse().expect("table");
        let schema = schema();

        for batch in [Batch::from_rows([row("a", 1.0, 1), row("b", 2.0, 1)]), Batch::from_rows([row("c", 3.0, 1)])] {
            wh.load_table(LoadRequest {
                table: &staging,
                schema: &schema,
                batch: &batch,
                disposition: WriteDisposition::Truncate,
                location: None,
            })
            .await
            .expect("load");
        }

        let rows = wh.rows(&staging).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("tickers"), Some(&Value::TextList(vec![])));
    }

    #[tokio::test]
    async fn load_rejects_type_mismatches() {
        let wh = MemoryWarehouse::new();
        let staging: TableRef = "p.d.t_staging".parse().expect("table");
        let mut bad = row("a", 1.0, 1);
        bad.insert("amount".into(), Value::text("12.5"));
        let err = wh
            .load_table(LoadRequest {
                table: &staging,
                schema: &schema(),
                batch: &Batch::from_rows([bad]),
                disposition: WriteDisposition::Truncate,
                location: None,
            })
            .await
            .expect_err("mismatch");
        assert!(err.to_string().contains("amount"));
    }

    #[tokio::test]
    async fn bool_columns_only_hold_booleans() {
        let wh = MemoryWarehouse::new();
        let staging: TableRef = "p.d.flags_staging".parse().expect("table");
        let schema = TargetSchema::new(vec![FieldSpec::nullable("is_live", LogicalType::Bool)]);
        let load = |value: Value| {
            let mut row = Row::new();
            row.insert("is_live".into(), value);
            Batch::from_rows([row])
        };

        let ok = load(Value::Bool(false));
        wh.load_table(LoadRequest {
            table: &staging,
            schema: &schema,
            batch: &ok,
            disposition: WriteDisposition::Truncate,
            location: None,
        })
        .await
        .expect("bool load");

        let bad = load(Value::text("true"));
        let err = wh
            .load_table(LoadRequest {
                table: &staging,
                schema: &schema,
                batch: &bad,
                disposition: WriteDisposition::Truncate,
                location: None,
            })
            .await
            .expect_err("text in bool");
        assert!(err.to_string().contains("is_live"));
    }

    #[tokio::test]
    async fn ranking_keeps_one_row_per_key_in_first_seen_order() {
        let wh = MemoryWarehouse::new();
        let target: TableRef = "p.d.t".parse().expect("table");
        let staging = target.with_table_suffix("_staging");
        wh.create_table(&target, schema()).await;

        let batch = Batch::from_rows([
            row("b", 1.0, 1),
            row("a", 2.0, 3),
            row("b", 3.0, 4),
            row("a", 4.0, 2),
            row("c", 5.0, 1),
        ]);
        wh.load_table(LoadRequest {
            table: &staging,
            schema: &schema(),
            batch: &batch,
            disposition: WriteDisposition::Truncate,
            location: None,
        })
        .await
        .expect("load");
        wh.execute_merge(&plan(&target, &staging), None).await.expect("merge");

        let rows = wh.rows(&target).await;
        let picked: Vec<_> = rows
            .iter()
            .map(|r| (row_value(r, "id").clone(), row_value(r, "amount").clone()))
            .collect();
        assert_eq!(
            picked,
            vec![
                (Value::text("b"), Value::Float(3.0)),
                (Value::text("a"), Value::Float(2.0)),
                (Value::text("c"), Value::Float(5.0)),
            ]
        );
    }

    #[tokio::test]
    async fn merge_keeps_latest_per_key_and_updates_existing() {
        let wh = MemoryWarehouse::new();
        let target: TableRef = "p.d.t".parse().expect("table");
        let staging = target.with_table_suffix("_staging");
        wh.create_table(&target, schema()).await;
        wh.insert_rows(&target, vec![row("b", 9.0, 1)]).await.expect("seed");

        let batch = Batch::from_rows([row("a", 12.5, 1), row("a", 13.0, 2), row("b", 10.0, 3)]);
        wh.load_table(LoadRequest {
            table: &staging,
            schema: &schema(),
            batch: &batch,
            disposition: WriteDisposition::Truncate,
            location: None,
        })
        .await
        .expect("load");

        let receipt = wh.execute_merge(&plan(&target, &staging), None).await.expect("merge");
        assert_eq!(receipt.rows_affected, Some(2));

        let mut rows = wh.rows(&target).await;
        rows.sort_by(|a, b| row_value(a, "id").sql_cmp(row_value(b, "id")));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("amount"), Some(&Value::Float(13.0)));
        assert_eq!(rows[1].get("amount"), Some(&Value::Float(10.0)));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_job_errors() {
        let wh = MemoryWarehouse::new();
        let target: TableRef = "p.d.t".parse().expect("table");
        wh.create_table(&target, schema()).await;
        wh.fail_on(WarehouseOp::Merge, "quota exceeded").await;

        let err = wh
            .execute_merge(&plan(&target, &target.with_table_suffix("_staging")), None)
            .await
            .expect_err("injected");
        assert!(matches!(err, WarehouseError::JobFailed { ref message, .. } if message == "quota exceeded"));
    }

    #[test]
    fn safe_cast_nulls_garbage() {
        assert_eq!(safe_cast_timestamp(&Value::text("not a time")), Value::Null);
        assert!(matches!(
            safe_cast_timestamp(&Value::text("2024-01-02T00:00:00Z")),
            Value::Timestamp(_)
        ));
    }
}
