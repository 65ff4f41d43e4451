//! Merge planning: key validation, usable columns, recency ranking.

use sentivol_core::plan::{MergePlan, OrderTerm, Ranking, RankingBasis};
use sentivol_core::{KeySpec, TableRef, TargetSchema, TypeFamily};
use sentivol_storage::{JobReceipt, Warehouse};
use tracing::{error, info};

use crate::UpsertError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlanner {
    /// Highest priority first.
    pub recency_columns: Vec<String>,
    pub event_time_suffix: String,
}

impl Default for MergePlanner {
    fn default() -> Self {
        Self {
            recency_columns: vec![
                "ingested_at".to_string(),
                "published_at".to_string(),
                "created_at".to_string(),
            ],
            event_time_suffix: "_at".to_string(),
        }
    }
}

impl MergePlanner {
    /// Batch columns the target also declares, in batch order.
    pub fn usable_columns(schema: &TargetSchema, batch_columns: &[String]) -> Vec<String> {
        batch_columns
            .iter()
            .filter(|c| schema.contains(c))
            .cloned()
            .collect()
    }

    fn event_time_column<'a>(&self, schema: &TargetSchema, usable: &'a [String]) -> Option<&'a String> {
        usable.iter().find(|c| {
            c.ends_with(&self.event_time_suffix)
                && !self.recency_columns.contains(c)
                && schema
                    .field(c)
                    .is_some_and(|f| !f.is_repeated() && f.logical_type.family() == TypeFamily::Instant)
        })
    }

    /// Present recency columns in priority order, then the first event-time
    /// column as a final tie-break. With neither, rows are ordered by the key
    /// columns, which is deterministic but says nothing about recency.
    pub fn ranking(&self, schema: &TargetSchema, keys: &KeySpec, usable: &[String]) -> Ranking {
        let mut order_by: Vec<OrderTerm> = self
            .recency_columns
            .iter()
            .filter(|c| usable.contains(c))
            .map(|c| OrderTerm::recency(c.as_str()))
            .collect();
        let event_column = self.event_time_column(schema, usable);

        let basis = match (order_by.first(), event_column) {
            (Some(first), _) => RankingBasis::Recency(first.column.clone()),
            (None, Some(column)) => RankingBasis::EventTime(column.clone()),
            (None, None) => RankingBasis::KeyColumns,
        };
        if let Some(column) = event_column {
            order_by.push(OrderTerm::recency(column.as_str()));
        }
        if order_by.is_empty() {
            order_by = keys.iter().map(|k| OrderTerm::ascending(k)).collect();
        }

        Ranking {
            basis,
            partition_by: keys.columns().to_vec(),
            order_by,
        }
    }

    /// Validates the key columns and builds the plan. Touches nothing.
    pub fn plan(
        &self,
        target: &TableRef,
        staging: &TableRef,
        schema: &TargetSchema,
        keys: &KeySpec,
        batch_columns: &[String],
    ) -> Result<MergePlan, UpsertError> {
        let unknown: Vec<&str> = keys.iter().filter(|k| !schema.contains(k)).collect();
        if !unknown.is_empty() {
            return Err(UpsertError::Validation(format!(
                "key columns {unknown:?} are not in the schema of {target}"
            )));
        }

        let usable = Self::usable_columns(schema, batch_columns);
        if usable.is_empty() {
            return Err(UpsertError::Validation(format!(
                "no columns match target schema of {target}"
            )));
        }

        let absent: Vec<&str> = keys
            .iter()
            .filter(|k| !usable.iter().any(|c| c.as_str() == *k))
            .collect();
        if !absent.is_empty() {
            return Err(UpsertError::Validation(format!(
                "key columns {absent:?} are missing from the batch"
            )));
        }

        let update_columns = usable
            .iter()
            .filter(|c| !keys.contains(c))
            .cloned()
            .collect();
        let ranking = self.ranking(schema, keys, &usable);

        Ok(MergePlan {
            target: target.clone(),
            source: staging.clone(),
            on_columns: keys.columns().to_vec(),
            update_columns,
            insert_columns: usable,
            ranking,
        })
    }
}

/// Runs `plan`. On failure the rendered statement is logged and carried in
/// the error.
pub async fn execute_plan<W>(
    warehouse: &W,
    plan: &MergePlan,
    location: Option<&str>,
) -> Result<JobReceipt, UpsertError>
where
    W: Warehouse + ?Sized,
{
    info!(table = %plan.target, source = %plan.source, basis = ?plan.ranking.basis, "executing merge");
    match warehouse.execute_merge(plan, location).await {
        Ok(receipt) => {
            info!(job_id = %receipt.job_id, rows = ?receipt.rows_affected, "merge complete");
            Ok(receipt)
        }
        Err(err) => {
            let statement = plan.render();
            error!(table = %plan.target, error = %err, %statement, "merge failed");
            Err(UpsertError::Execution {
                context: format!("merge into {}", plan.target),
                message: err.to_string(),
                statement: Some(statement),
            })
        }
    }
}
