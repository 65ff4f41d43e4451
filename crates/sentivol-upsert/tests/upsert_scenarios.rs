use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use sentivol_core::{
    row_value, Batch, FieldSpec, LogicalType, Row, TableRef, TargetSchema, UpsertStatus, Value,
};
use sentivol_storage::{MemoryWarehouse, WarehouseOp};
use sentivol_upsert::batch_file::{read_batch_file, read_schema_file};
use sentivol_upsert::{AppendRequest, UpsertConfig, UpsertError, UpsertRequest, Upserter};
use serde_json::json;

fn fixture(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(path)
}

fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("ts")
}

fn row(pairs: serde_json::Value) -> Row {
    match pairs {
        serde_json::Value::Object(object) => sentivol_core::row_from_json_object(object),
        other => panic!("not an object: {other}"),
    }
}

fn amounts_schema() -> TargetSchema {
    TargetSchema::new(vec![
        FieldSpec::nullable("id", LogicalType::String),
        FieldSpec::nullable("amount", LogicalType::Float64),
        FieldSpec::nullable("seen_at", LogicalType::Timestamp),
    ])
}

fn amounts_table() -> TableRef {
    "proj.markets.amounts".parse().expect("table")
}

async fn upserter_with(table: &TableRef, schema: TargetSchema) -> Upserter<MemoryWarehouse> {
    let warehouse = MemoryWarehouse::new();
    warehouse.create_table(table, schema).await;
    Upserter::new(warehouse, UpsertConfig::default())
}

fn sorted_by_id(mut rows: Vec<Row>, key: &str) -> Vec<Row> {
    rows.sort_by(|a, b| row_value(a, key).sql_cmp(row_value(b, key)));
    rows
}

#[tokio::test]
async fn seen_at_scenario_keeps_the_latest_row() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    let batch = Batch::from_rows([
        row(json!({"id": "a", "amount": "12.5", "seen_at": "2024-01-01T00:00:00Z"})),
        row(json!({"id": "a", "amount": "13.0", "seen_at": "2024-01-02T00:00:00Z"})),
        row(json!({"id": "", "amount": "9", "seen_at": "2024-01-01T00:00:00Z"})),
    ]);

    let outcome = upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["id"]))
        .await
        .expect("upsert");

    assert_eq!(outcome.status, UpsertStatus::Applied);
    assert_eq!(outcome.rows_considered, 3);
    assert_eq!(outcome.rows_staged, 2);
    assert_eq!(outcome.rows_merged, 1);

    let rows = upserter.warehouse().rows(&table).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(row_value(&rows[0], "id"), &Value::text("a"));
    assert_eq!(row_value(&rows[0], "amount"), &Value::Float(13.0));
    assert_eq!(row_value(&rows[0], "seen_at"), &Value::Timestamp(ts(2024, 1, 2, 0)));
}

#[tokio::test]
async fn unconvertible_amount_is_nulled_not_dropped() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    let batch = Batch::from_rows([row(json!({"id": "b", "amount": "N/A"}))]);

    upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["id"]))
        .await
        .expect("upsert");

    let rows = upserter.warehouse().rows(&table).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(row_value(&rows[0], "amount"), &Value::Null);
}

#[tokio::test]
async fn repeating_an_upsert_changes_nothing() {
    let table: TableRef = "proj.markets.news_articles".parse().expect("table");
    let schema = read_schema_file(&fixture("news_articles/schema.json"))
        .await
        .expect("schema");
    let batch = read_batch_file(&fixture("news_articles/batch.json"))
        .await
        .expect("batch");
    let upserter = upserter_with(&table, schema).await;

    upserter
        .upsert(UpsertRequest::new(table.clone(), batch.clone(), ["article_id"]))
        .await
        .expect("first upsert");
    let once = sorted_by_id(upserter.warehouse().rows(&table).await, "article_id");

    upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["article_id"]))
        .await
        .expect("second upsert");
    let twice = sorted_by_id(upserter.warehouse().rows(&table).await, "article_id");

    assert_eq!(once.len(), 2);
    assert_eq!(once, twice);
}

fn ledger_schema() -> TargetSchema {
    TargetSchema::new(vec![
        FieldSpec::nullable("id", LogicalType::String),
        FieldSpec::nullable("amount", LogicalType::Float64),
        FieldSpec::nullable("ingested_at", LogicalType::Timestamp),
    ])
}

#[tokio::test]
async fn repeating_an_unstamped_batch_changes_nothing() {
    let table: TableRef = "proj.markets.ledger".parse().expect("table");
    let upserter = upserter_with(&table, ledger_schema()).await;
    let batch = Batch::from_rows([row(json!({"id": "a", "amount": 1.5}))]);

    upserter
        .upsert(UpsertRequest::new(table.clone(), batch.clone(), ["id"]))
        .await
        .expect("first upsert");
    let once = upserter.warehouse().rows(&table).await;

    upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["id"]))
        .await
        .expect("second upsert");
    let twice = upserter.warehouse().rows(&table).await;

    assert_eq!(once.len(), 1);
    assert_eq!(row_value(&once[0], "ingested_at"), &Value::Null);
    assert_eq!(once, twice);
}

#[tokio::test]
async fn stamping_fills_the_ingestion_column_when_enabled() {
    let table: TableRef = "proj.markets.ledger".parse().expect("table");
    let warehouse = MemoryWarehouse::new();
    warehouse.create_table(&table, ledger_schema()).await;
    let config = UpsertConfig {
        stamp_ingested_at: true,
        ..UpsertConfig::default()
    };
    let upserter = Upserter::new(warehouse, config);
    let batch = Batch::from_rows([row(json!({"id": "a", "amount": 1.5}))]);

    let before = Utc::now();
    upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["id"]))
        .await
        .expect("upsert");

    let rows = upserter.warehouse().rows(&table).await;
    match row_value(&rows[0], "ingested_at") {
        Value::Timestamp(stamped) => assert!(*stamped >= before - chrono::Duration::seconds(1)),
        other => panic!("expected a stamp, got {other:?}"),
    }
}

#[tokio::test]
async fn fixture_batch_lands_normalized_and_deduplicated() {
    let table: TableRef = "proj.markets.news_articles".parse().expect("table");
    let schema = read_schema_file(&fixture("news_articles/schema.json"))
        .await
        .expect("schema");
    let batch = read_batch_file(&fixture("news_articles/batch.json"))
        .await
        .expect("batch");
    let upserter = upserter_with(&table, schema).await;

    let outcome = upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["article_id"]))
        .await
        .expect("upsert");
    assert_eq!(outcome.rows_considered, 5);
    assert_eq!(outcome.rows_staged, 3);
    assert_eq!(outcome.rows_merged, 2);

    let rows = sorted_by_id(upserter.warehouse().rows(&table).await, "article_id");
    let brent = &rows[0];
    assert_eq!(
        row_value(brent, "title"),
        &Value::text("Brent climbs as OPEC+ signals deeper output cuts")
    );
    assert_eq!(row_value(brent, "tickers"), &Value::TextList(vec!["BZ".into()]));
    assert_eq!(row_value(brent, "sentiment_score"), &Value::Float(0.55));
    assert_eq!(
        row_value(brent, "raw"),
        &Value::text(json!({"provider": "newsapi", "page": 2}).to_string())
    );

    let gold = &rows[1];
    assert_eq!(row_value(gold, "sentiment_score"), &Value::Null);
    assert_eq!(row_value(gold, "tickers"), &Value::TextList(vec![]));
    assert_eq!(row_value(gold, "published_at"), &Value::Timestamp(ts(2024, 3, 4, 7)));
}

#[tokio::test]
async fn later_recency_stamp_wins_in_either_order() {
    let schema = TargetSchema::new(vec![
        FieldSpec::nullable("id", LogicalType::String),
        FieldSpec::nullable("price", LogicalType::Float64),
        FieldSpec::nullable("ingested_at", LogicalType::Timestamp),
    ]);
    let table: TableRef = "proj.markets.bars".parse().expect("table");
    let early = row(json!({"id": "x", "price": 1.0, "ingested_at": "2024-05-01T00:00:00Z"}));
    let late = row(json!({"id": "x", "price": 2.0, "ingested_at": "2024-05-01T01:00:00Z"}));

    for rows in [[early.clone(), late.clone()], [late.clone(), early.clone()]] {
        let upserter = upserter_with(&table, schema.clone()).await;
        upserter
            .upsert(UpsertRequest::new(table.clone(), Batch::from_rows(rows), ["id"]))
            .await
            .expect("upsert");
        let stored = upserter.warehouse().rows(&table).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(row_value(&stored[0], "price"), &Value::Float(2.0));
    }
}

#[tokio::test]
async fn existing_rows_are_updated_and_new_keys_inserted() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    upserter
        .warehouse()
        .insert_rows(
            &table,
            vec![row(json!({"id": "a"})), row(json!({"id": "z"}))],
        )
        .await
        .expect("seed");

    let batch = Batch::from_rows([
        row(json!({"id": "a", "amount": 5})),
        row(json!({"id": "c", "amount": "7.25"})),
    ]);
    let outcome = upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["id"]))
        .await
        .expect("upsert");
    assert_eq!(outcome.rows_merged, 2);

    let rows = sorted_by_id(upserter.warehouse().rows(&table).await, "id");
    let amounts: Vec<_> = rows.iter().map(|r| row_value(r, "amount").clone()).collect();
    assert_eq!(amounts, vec![Value::Float(5.0), Value::Float(7.25), Value::Null]);
}

#[tokio::test]
async fn null_keys_never_reach_the_target() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    let batch = Batch::from_rows([
        row(json!({"id": null, "amount": 1})),
        row(json!({"id": "  ", "amount": 2})),
        row(json!({"amount": 3})),
        row(json!({"id": "k", "amount": 4})),
    ]);

    upserter
        .upsert(UpsertRequest::new(table.clone(), batch, ["id"]))
        .await
        .expect("upsert");
    let rows = upserter.warehouse().rows(&table).await;
    assert_eq!(rows.len(), 1);
    assert!(rows.iter().all(|r| !row_value(r, "id").is_null()));
}

#[tokio::test]
async fn empty_batches_skip_without_touching_the_warehouse() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;

    let empty = upserter
        .upsert(UpsertRequest::new(table.clone(), Batch::new(), ["id"]))
        .await
        .expect("empty");
    assert_eq!(empty.status, UpsertStatus::SkippedEmpty);

    let filtered = upserter
        .upsert(UpsertRequest::new(
            table.clone(),
            Batch::from_rows([row(json!({"id": "", "amount": 1}))]),
            ["id"],
        ))
        .await
        .expect("filtered");
    assert_eq!(filtered.status, UpsertStatus::SkippedEmpty);
    assert_eq!(filtered.rows_considered, 1);

    assert_eq!(upserter.warehouse().jobs_run().await, 0);
    assert!(upserter.warehouse().rows(&table).await.is_empty());
}

#[tokio::test]
async fn key_problems_are_validation_errors() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    let batch = || Batch::from_rows([row(json!({"id": "a", "amount": 1}))]);

    let no_keys = upserter
        .upsert(UpsertRequest::new(table.clone(), batch(), Vec::<String>::new()))
        .await
        .expect_err("no keys");
    assert_eq!(no_keys.status(), UpsertStatus::ValidationError);

    let absent = upserter
        .upsert(UpsertRequest::new(table.clone(), batch(), ["account"]))
        .await
        .expect_err("key missing from batch");
    assert!(matches!(absent, UpsertError::Validation(_)));

    let mut with_extra = batch();
    with_extra.fill_column("account", Value::text("acct-1"));
    let not_in_schema = upserter
        .upsert(UpsertRequest::new(table.clone(), with_extra, ["account"]))
        .await
        .expect_err("key missing from schema");
    assert!(matches!(not_in_schema, UpsertError::Validation(_)));

    // Nothing is staged when validation fails.
    assert!(upserter
        .warehouse()
        .table(&table.with_table_suffix("_staging"))
        .await
        .is_none());
}

#[tokio::test]
async fn missing_target_is_an_execution_error() {
    let upserter = Upserter::new(MemoryWarehouse::new(), UpsertConfig::default());
    let err = upserter
        .upsert(UpsertRequest::new(
            amounts_table(),
            Batch::from_rows([row(json!({"id": "a"}))]),
            ["id"],
        ))
        .await
        .expect_err("no target table");
    assert_eq!(err.status(), UpsertStatus::ExecutionError);
    assert!(err.to_string().contains("fetching schema of proj.markets.amounts"));
}

#[tokio::test]
async fn explicit_schema_skips_the_fetch() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    upserter
        .warehouse()
        .fail_on(WarehouseOp::FetchSchema, "permission denied")
        .await;

    let outcome = upserter
        .upsert(
            UpsertRequest::new(
                table.clone(),
                Batch::from_rows([row(json!({"id": "a", "amount": 1}))]),
                ["id"],
            )
            .with_schema(amounts_schema()),
        )
        .await
        .expect("explicit schema wins");
    assert_eq!(outcome.status, UpsertStatus::Applied);
}

#[tokio::test]
async fn merge_failures_carry_the_statement() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    upserter
        .warehouse()
        .fail_on(WarehouseOp::Merge, "Resources exceeded")
        .await;

    let err = upserter
        .upsert(UpsertRequest::new(
            table.clone(),
            Batch::from_rows([row(json!({"id": "a", "amount": 1}))]),
            ["id"],
        ))
        .await
        .expect_err("merge fails");

    assert_eq!(err.status(), UpsertStatus::ExecutionError);
    assert!(err.to_string().contains("Resources exceeded"));
    let statement = err.statement().expect("statement");
    assert!(statement.starts_with("MERGE `proj.markets.amounts` T"));
    assert!(statement.contains("FROM `proj.markets.amounts_staging`"));
    assert!(upserter.warehouse().rows(&table).await.is_empty());
}

#[tokio::test]
async fn staging_override_is_used() {
    let table = amounts_table();
    let staging: TableRef = "proj.scratch.amounts_run".parse().expect("staging");
    let upserter = upserter_with(&table, amounts_schema()).await;

    upserter
        .upsert(
            UpsertRequest::new(
                table.clone(),
                Batch::from_rows([row(json!({"id": "a", "amount": 1}))]),
                ["id"],
            )
            .with_staging(staging.clone()),
        )
        .await
        .expect("upsert");

    assert_eq!(upserter.warehouse().rows(&staging).await.len(), 1);
    assert!(upserter
        .warehouse()
        .table(&table.with_table_suffix("_staging"))
        .await
        .is_none());
}

#[tokio::test]
async fn append_adds_rows_without_key_matching() {
    let table = amounts_table();
    let upserter = upserter_with(&table, amounts_schema()).await;
    let batch = || {
        Batch::from_rows([
            row(json!({"id": "a", "amount": "1.5", "seen_at": "2024-01-01"})),
            row(json!({"id": null, "amount": null})),
        ])
    };

    let first = upserter
        .append(AppendRequest::new(table.clone(), batch()))
        .await
        .expect("append");
    upserter
        .append(AppendRequest::new(table.clone(), batch()))
        .await
        .expect("append again");

    assert_eq!(first.rows_considered, 2);
    assert_eq!(first.rows_staged, 1);
    let rows = upserter.warehouse().rows(&table).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(row_value(&rows[0], "seen_at"), &Value::Timestamp(ts(2024, 1, 1, 0)));

    let skipped = upserter
        .append(AppendRequest::new(table.clone(), Batch::new()))
        .await
        .expect("empty append");
    assert_eq!(skipped.status, UpsertStatus::SkippedEmpty);
}

#[tokio::test]
async fn run_summaries_are_exported_when_configured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let table = amounts_table();
    let warehouse = MemoryWarehouse::new();
    warehouse.create_table(&table, amounts_schema()).await;
    let upserter = Upserter::new(
        warehouse,
        UpsertConfig {
            export_dir: Some(dir.path().to_path_buf()),
            summary_page_size: 1,
            ..UpsertConfig::default()
        },
    );

    let outcome = upserter
        .upsert(UpsertRequest::new(
            table.clone(),
            Batch::from_rows([
                row(json!({"id": "a", "seen_at": "2024-01-01T00:00:00Z"})),
                row(json!({"id": "b", "seen_at": "2024-01-02T00:00:00Z"})),
            ]),
            ["id"],
        ))
        .await
        .expect("upsert");

    let mut exported = Vec::new();
    let mut stack = vec![dir.path().to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in std::fs::read_dir(&path).expect("read_dir") {
            let entry = entry.expect("entry").path();
            if entry.is_dir() {
                stack.push(entry);
            } else if entry.extension().is_some_and(|e| e == "json") {
                exported.push(entry);
            }
        }
    }
    assert_eq!(exported.len(), 1);
    assert_eq!(
        exported[0].file_stem().and_then(|s| s.to_str()),
        Some(outcome.run_id.to_string().as_str())
    );

    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&exported[0]).expect("read")).expect("json");
    assert_eq!(doc["pagination"]["total_records"], 2);
    assert_eq!(doc["pagination"]["total_pages"], 2);
    assert_eq!(doc["pagination"]["next_page"], 2);
    assert_eq!(doc["data"][1]["id"], "b");
    assert_eq!(doc["data"][1]["seen_at"], "2024-01-02T00:00:00+00:00");
    assert_eq!(doc["data"][1]["page_number"], 2);
}
