use sentivol_core::{Batch, TableRef, TargetSchema};
use sentivol_storage::{JobReceipt, LoadRequest, Warehouse, WriteDisposition};
use tracing::{error, info};

use crate::UpsertError;

/// Staging table for `target`: the override when given, else the target name
/// with `suffix` appended.
pub fn staging_table(target: &TableRef, suffix: &str, override_table: Option<&TableRef>) -> TableRef {
    override_table
        .cloned()
        .unwrap_or_else(|| target.with_table_suffix(suffix))
}

/// Replaces the whole contents of `staging` with `batch`, loaded under
/// `schema`.
pub async fn load_staging<W>(
    warehouse: &W,
    batch: &Batch,
    staging: &TableRef,
    schema: &TargetSchema,
    location: Option<&str>,
) -> Result<JobReceipt, UpsertError>
where
    W: Warehouse + ?Sized,
{
    if batch.is_empty() {
        return Err(UpsertError::Validation(format!(
            "refusing to stage an empty batch into {staging}"
        )));
    }

    info!(rows = batch.len(), %staging, "loading staging table");
    let receipt = warehouse
        .load_table(LoadRequest {
            table: staging,
            schema,
            batch,
            disposition: WriteDisposition::Truncate,
            location,
        })
        .await
        .map_err(|err| {
            error!(%staging, error = %err, "staging load failed");
            UpsertError::execution(format!("staging load into {staging}"), err)
        })?;
    info!(job_id = %receipt.job_id, %staging, "staging load complete");
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentivol_core::{FieldSpec, LogicalType, Row, Value};
    use sentivol_storage::{MemoryWarehouse, WarehouseOp};

    fn schema() -> TargetSchema {
        TargetSchema::new(vec![FieldSpec::nullable("id", LogicalType::String)])
    }

    fn batch(ids: &[&str]) -> Batch {
        Batch::from_rows(ids.iter().map(|id| {
            let mut row = Row::new();
            row.insert("id".into(), Value::text(*id));
            row
        }))
    }

    #[test]
    fn staging_names_derive_from_the_target() {
        let target: TableRef = "p.ds.news".parse().expect("target");
        let custom: TableRef = "p.scratch.news_tmp".parse().expect("custom");
        assert_eq!(staging_table(&target, "_staging", None).to_string(), "p.ds.news_staging");
        assert_eq!(staging_table(&target, "_staging", Some(&custom)), custom);
    }

    #[tokio::test]
    async fn each_load_replaces_the_previous_contents() {
        let warehouse = MemoryWarehouse::new();
        let staging: TableRef = "p.ds.news_staging".parse().expect("staging");

        load_staging(&warehouse, &batch(&["a", "b"]), &staging, &schema(), None)
            .await
            .expect("first load");
        load_staging(&warehouse, &batch(&["c"]), &staging, &schema(), None)
            .await
            .expect("second load");

        let rows = warehouse.rows(&staging).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::text("c")));
    }

    #[tokio::test]
    async fn load_failures_surface_as_execution_errors() {
        let warehouse = MemoryWarehouse::new();
        warehouse.fail_on(WarehouseOp::Load, "quota exceeded").await;
        let staging: TableRef = "p.ds.news_staging".parse().expect("staging");

        let err = load_staging(&warehouse, &batch(&["a"]), &staging, &schema(), Some("US"))
            .await
            .expect_err("load should fail");
        assert_eq!(err.status(), sentivol_core::UpsertStatus::ExecutionError);
        assert!(err.to_string().contains("quota exceeded"));
    }
}
