//! Warehouse boundary for senti-vol: the `Warehouse` contract, its BigQuery
//! and in-memory implementations, staging-file encoding and diagnostic exports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use sentivol_core::plan::MergePlan;
use sentivol_core::{Batch, TableRef, TargetSchema};
use serde::Serialize;
use thiserror::Error;

pub mod bigquery;
pub mod encode;
pub mod export;
pub mod memory;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse};
pub use export::ExportStore;
pub use memory::{MemoryWarehouse, WarehouseOp};

pub const CRATE_NAME: &str = "sentivol-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteDisposition {
    /// Replace every row of the destination.
    Truncate,
    Append,
}

impl WriteDisposition {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
            WriteDisposition::Append => "WRITE_APPEND",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub table: &'a TableRef,
    pub schema: &'a TargetSchema,
    pub batch: &'a Batch,
    pub disposition: WriteDisposition,
    pub location: Option<&'a str>,
}

/// Completion record of a finished warehouse job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReceipt {
    pub job_id: String,
    /// Output rows for loads, DML-affected rows for merges, when reported.
    pub rows_affected: Option<u64>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    TableNotFound(String),
    #[error("http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
    #[error("encoding staging payload: {0}")]
    Encode(String),
    #[error("unexpected warehouse response: {0}")]
    Protocol(String),
}

/// The four capabilities the upsert engine needs from a warehouse. Every call
/// blocks until the underlying job has finished, successfully or not.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn fetch_schema(&self, table: &TableRef) -> Result<TargetSchema, WarehouseError>;

    async fn load_table(&self, request: LoadRequest<'_>) -> Result<JobReceipt, WarehouseError>;

    async fn execute_merge(
        &self,
        plan: &MergePlan,
        location: Option<&str>,
    ) -> Result<JobReceipt, WarehouseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
