//! The senti-vol upsert engine: normalize, coerce, stage, then merge a batch
//! of loosely typed rows into a warehouse table keyed by a set of columns.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sentivol_core::plan::{MergePlan, RankingBasis};
use sentivol_core::{Batch, KeySpec, MergeOutcome, TableRef, TargetSchema, UpsertStatus, Value};
use sentivol_storage::{ExportStore, LoadRequest, Warehouse, WriteDisposition};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod batch_file;
pub mod coerce;
pub mod merge;
pub mod normalize;
pub mod staging;
pub mod summary;

pub use merge::MergePlanner;
pub use normalize::{NormalizeOptions, NormalizeReport};

pub const CRATE_NAME: &str = "sentivol-upsert";

#[derive(Debug, Error)]
pub enum UpsertError {
    /// Caller or configuration mistake; retrying will not help.
    #[error("validation error: {0}")]
    Validation(String),
    /// The warehouse rejected or failed a step.
    #[error("{context} failed: {message}")]
    Execution {
        context: String,
        message: String,
        /// The merge statement, for merge failures.
        statement: Option<String>,
    },
}

impl UpsertError {
    pub(crate) fn execution(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        UpsertError::Execution {
            context: context.into(),
            message: err.to_string(),
            statement: None,
        }
    }

    pub fn status(&self) -> UpsertStatus {
        match self {
            UpsertError::Validation(_) => UpsertStatus::ValidationError,
            UpsertError::Execution { .. } => UpsertStatus::ExecutionError,
        }
    }

    pub fn statement(&self) -> Option<&str> {
        match self {
            UpsertError::Execution { statement, .. } => statement.as_deref(),
            UpsertError::Validation(_) => None,
        }
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

#[derive(Debug, Clone)]
pub struct UpsertConfig {
    /// Job location; a request's own location wins.
    pub location: Option<String>,
    pub staging_suffix: String,
    pub normalize: NormalizeOptions,
    /// Ranking priority among same-key rows.
    pub recency_columns: Vec<String>,
    /// Stamp the ingestion column with the run start when a batch lacks it.
    /// Stamped runs are not idempotent.
    pub stamp_ingested_at: bool,
    pub export_dir: Option<PathBuf>,
    pub summary_page_size: usize,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            location: Some("US".to_string()),
            staging_suffix: "_staging".to_string(),
            normalize: NormalizeOptions::default(),
            recency_columns: MergePlanner::default().recency_columns,
            stamp_ingested_at: false,
            export_dir: None,
            summary_page_size: 10,
        }
    }
}

impl UpsertConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            location: match std::env::var("SENTIVOL_LOCATION") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(v.trim().to_string()),
                Err(_) => defaults.location,
            },
            staging_suffix: std::env::var("SENTIVOL_STAGING_SUFFIX")
                .unwrap_or(defaults.staging_suffix),
            normalize: defaults.normalize,
            recency_columns: env_list("SENTIVOL_RECENCY_COLUMNS")
                .unwrap_or(defaults.recency_columns),
            stamp_ingested_at: std::env::var("SENTIVOL_STAMP_INGESTED_AT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.stamp_ingested_at),
            export_dir: std::env::var("SENTIVOL_EXPORT_DIR").ok().map(PathBuf::from),
            summary_page_size: std::env::var("SENTIVOL_SUMMARY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.summary_page_size),
        }
    }

    pub fn planner(&self) -> MergePlanner {
        MergePlanner {
            recency_columns: self.recency_columns.clone(),
            event_time_suffix: self.normalize.event_time_suffix.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpsertRequest {
    pub target: TableRef,
    pub batch: Batch,
    pub key_fields: Vec<String>,
    /// Used instead of the target's live schema when given.
    pub schema: Option<TargetSchema>,
    pub staging: Option<TableRef>,
    pub location: Option<String>,
}

impl UpsertRequest {
    pub fn new<I, S>(target: TableRef, batch: Batch, key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target,
            batch,
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            schema: None,
            staging: None,
            location: None,
        }
    }

    pub fn with_schema(mut self, schema: TargetSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_staging(mut self, staging: TableRef) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub target: TableRef,
    pub batch: Batch,
    pub schema: Option<TargetSchema>,
    pub location: Option<String>,
}

impl AppendRequest {
    pub fn new(target: TableRef, batch: Batch) -> Self {
        Self {
            target,
            batch,
            schema: None,
            location: None,
        }
    }

    pub fn with_schema(mut self, schema: TargetSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

pub struct Upserter<W> {
    warehouse: W,
    config: UpsertConfig,
}

impl<W: Warehouse> Upserter<W> {
    pub fn new(warehouse: W, config: UpsertConfig) -> Self {
        Self { warehouse, config }
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub fn config(&self) -> &UpsertConfig {
        &self.config
    }

    async fn resolve_schema(
        &self,
        target: &TableRef,
        explicit: Option<TargetSchema>,
    ) -> Result<TargetSchema, UpsertError> {
        match explicit {
            Some(schema) => Ok(schema),
            None => self.warehouse.fetch_schema(target).await.map_err(|err| {
                warn!(table = %target, error = %err, "unable to fetch target schema");
                UpsertError::execution(format!("fetching schema of {target}"), err)
            }),
        }
    }

    /// Builds the merge plan an upsert of `batch_columns` would run, without
    /// touching the warehouse.
    pub fn plan(
        &self,
        target: &TableRef,
        schema: &TargetSchema,
        key_fields: &[String],
        batch_columns: &[String],
        staging: Option<&TableRef>,
    ) -> Result<MergePlan, UpsertError> {
        let keys = KeySpec::new(key_fields.iter().map(String::as_str))
            .ok_or_else(|| UpsertError::Validation("key fields are required for upsert".into()))?;
        let staging = staging::staging_table(target, &self.config.staging_suffix, staging);
        self.config
            .planner()
            .plan(target, &staging, schema, &keys, batch_columns)
    }

    /// Reconciles `request.batch` into the target: rows whose keys exist are
    /// updated, the rest inserted, and same-key duplicates collapse to the
    /// most recent row.
    pub async fn upsert(&self, request: UpsertRequest) -> Result<MergeOutcome, UpsertError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("upsert", %run_id, table = %request.target);
        self.run_upsert(run_id, request).instrument(span).await
    }

    async fn run_upsert(
        &self,
        run_id: Uuid,
        request: UpsertRequest,
    ) -> Result<MergeOutcome, UpsertError> {
        let started_at = Utc::now();
        let UpsertRequest {
            target,
            batch,
            key_fields,
            schema,
            staging,
            location,
        } = request;

        let keys = KeySpec::new(key_fields)
            .ok_or_else(|| UpsertError::Validation("key fields are required for upsert".into()))?;
        let rows_considered = batch.len();
        if batch.is_empty() {
            info!("empty batch, skipping upsert");
            return Ok(MergeOutcome::skipped(run_id, &target, 0));
        }
        let absent: Vec<&str> = keys.iter().filter(|k| !batch.has_column(k)).collect();
        if !absent.is_empty() {
            return Err(UpsertError::Validation(format!(
                "key columns {absent:?} are missing from the batch"
            )));
        }

        let (mut batch, report) = normalize::normalize(batch, Some(&keys), &self.config.normalize);
        if batch.is_empty() {
            info!(
                dropped_empty = report.dropped_empty,
                dropped_missing_key = report.dropped_missing_key,
                "all rows dropped after null-cleaning, skipping upsert"
            );
            return Ok(MergeOutcome::skipped(run_id, &target, rows_considered));
        }
        self.stamp_ingestion(&mut batch, started_at);

        let schema = self.resolve_schema(&target, schema).await?;
        let staging = staging::staging_table(&target, &self.config.staging_suffix, staging.as_ref());
        let plan = self
            .config
            .planner()
            .plan(&target, &staging, &schema, &keys, batch.columns())?;

        let batch = coerce::coerce(batch, &schema);
        let location = location.or_else(|| self.config.location.clone());
        staging::load_staging(&self.warehouse, &batch, &staging, &schema, location.as_deref())
            .await?;
        let receipt = merge::execute_plan(&self.warehouse, &plan, location.as_deref()).await?;

        let outcome = MergeOutcome {
            run_id,
            target: target.to_string(),
            rows_considered,
            rows_staged: batch.len(),
            rows_merged: receipt.rows_affected.unwrap_or(0) as usize,
            status: UpsertStatus::Applied,
        };
        info!(
            rows_considered,
            rows_staged = outcome.rows_staged,
            rows_merged = outcome.rows_merged,
            "upsert applied"
        );

        let recency_column = match &plan.ranking.basis {
            RankingBasis::Recency(column) | RankingBasis::EventTime(column) => Some(column.as_str()),
            RankingBasis::KeyColumns => None,
        };
        self.export_summary(run_id, started_at, &target, &batch, &keys, recency_column)
            .await;
        Ok(outcome)
    }

    fn stamp_ingestion(&self, batch: &mut Batch, started_at: DateTime<Utc>) {
        let column = &self.config.normalize.ingestion_column;
        if self.config.stamp_ingested_at && !column.is_empty() && !batch.has_column(column) {
            batch.fill_column(column, Value::Timestamp(started_at));
        }
    }

    /// Best effort: a failed export is logged, never returned.
    async fn export_summary(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        target: &TableRef,
        batch: &Batch,
        keys: &KeySpec,
        recency_column: Option<&str>,
    ) {
        let Some(dir) = &self.config.export_dir else {
            return;
        };
        let document = summary::summarize(batch, keys, recency_column, self.config.summary_page_size);
        match ExportStore::new(dir.clone())
            .write_summary(run_id, started_at, target, &document)
            .await
        {
            Ok(path) => info!(path = %path.display(), "wrote run summary"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run summary"),
        }
    }

    /// Adds `request.batch` to the target without key matching.
    pub async fn append(&self, request: AppendRequest) -> Result<MergeOutcome, UpsertError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("append", %run_id, table = %request.target);
        self.run_append(run_id, request).instrument(span).await
    }

    async fn run_append(
        &self,
        run_id: Uuid,
        request: AppendRequest,
    ) -> Result<MergeOutcome, UpsertError> {
        let AppendRequest {
            target,
            batch,
            schema,
            location,
        } = request;
        let rows_considered = batch.len();
        if batch.is_empty() {
            info!("empty batch, skipping append");
            return Ok(MergeOutcome::skipped(run_id, &target, 0));
        }

        let (batch, _) = normalize::normalize(batch, None, &self.config.normalize);
        if batch.is_empty() {
            info!("all rows became empty after null-cleaning, skipping append");
            return Ok(MergeOutcome::skipped(run_id, &target, rows_considered));
        }

        let schema = self.resolve_schema(&target, schema).await?;
        if MergePlanner::usable_columns(&schema, batch.columns()).is_empty() {
            return Err(UpsertError::Validation(format!(
                "no columns match target schema of {target}"
            )));
        }
        let batch = coerce::coerce(batch, &schema);
        let location = location.or_else(|| self.config.location.clone());

        let receipt = self
            .warehouse
            .load_table(LoadRequest {
                table: &target,
                schema: &schema,
                batch: &batch,
                disposition: WriteDisposition::Append,
                location: location.as_deref(),
            })
            .await
            .map_err(|err| UpsertError::execution(format!("append into {target}"), err))?;
        info!(job_id = %receipt.job_id, rows = batch.len(), "append complete");

        Ok(MergeOutcome {
            run_id,
            target: target.to_string(),
            rows_considered,
            rows_staged: batch.len(),
            rows_merged: receipt
                .rows_affected
                .map(|n| n as usize)
                .unwrap_or(batch.len()),
            status: UpsertStatus::Applied,
        })
    }
}
