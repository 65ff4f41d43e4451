//! BigQuery v2 REST warehouse.
//!
//! Staging loads go through a multipart job upload of a Parquet file; merges
//! run as query jobs. Every job is created with a client-chosen id so a
//! retried insert can never start the same work twice, then polled to `DONE`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sentivol_core::plan::MergePlan;
use sentivol_core::{FieldSpec, TableRef, TargetSchema};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::encode::to_parquet_bytes;
use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, JobReceipt, LoadRequest,
    RetryDisposition, Warehouse, WarehouseError,
};

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset: String,
    pub access_token: String,
    pub api_base: String,
    pub upload_base: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

fn required_env(key: &str) -> anyhow::Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => anyhow::bail!("missing required environment variable: {key}"),
    }
}

impl BigQueryConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            project_id: required_env("GCP_PROJECT_ID")?,
            dataset: required_env("BQ_DATASET")?,
            access_token: required_env("BIGQUERY_ACCESS_TOKEN")?,
            api_base: std::env::var("BIGQUERY_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            upload_base: std::env::var("BIGQUERY_UPLOAD_BASE")
                .unwrap_or_else(|_| DEFAULT_UPLOAD_BASE.to_string()),
            timeout: Duration::from_secs(
                std::env::var("BIGQUERY_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            poll_interval: Duration::from_millis(
                std::env::var("BIGQUERY_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            ),
            user_agent: std::env::var("SENTIVOL_USER_AGENT")
                .unwrap_or_else(|_| "sentivol/0.1".to_string()),
            backoff: BackoffPolicy::default(),
        })
    }

    /// `project.dataset.name` inside the configured dataset.
    pub fn table(&self, name: &str) -> TableRef {
        TableRef::new(Some(self.project_id.as_str()), self.dataset.as_str(), name)
    }
}

#[derive(Debug, Deserialize)]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchemaResource>,
}

/// `tables.get` nests fields under `schema.fields`.
#[derive(Debug, Deserialize)]
struct TableSchemaResource {
    #[serde(default)]
    fields: Vec<FieldSpec>,
}

impl From<TableSchemaResource> for TargetSchema {
    fn from(resource: TableSchemaResource) -> Self {
        TargetSchema::new(resource.fields)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect())
}

#[derive(Debug)]
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    config: BigQueryConfig,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    fn project_of<'a>(&'a self, table: &'a TableRef) -> &'a str {
        table.project.as_deref().unwrap_or(&self.config.project_id)
    }

    fn table_reference(&self, table: &TableRef) -> JsonValue {
        json!({
            "projectId": self.project_of(table),
            "datasetId": table.dataset,
            "tableId": table.table,
        })
    }

    fn job_reference(&self, job_id: &str, location: Option<&str>) -> JsonValue {
        let mut reference = json!({
            "projectId": self.config.project_id,
            "jobId": job_id,
        });
        if let Some(location) = location {
            reference["location"] = json!(location);
        }
        reference
    }

    /// Sends a request built by `build`, retrying throttling, server errors
    /// and transport failures with backoff. `409 Conflict` is returned as-is
    /// so job inserts can recognise their own earlier attempt.
    async fn send_json(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<(StatusCode, JsonValue), WarehouseError> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            let result = build().bearer_auth(&self.config.access_token).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let text = resp.text().await?;
                    if status.is_success() || status == StatusCode::CONFLICT {
                        let body = if text.trim().is_empty() {
                            JsonValue::Null
                        } else {
                            serde_json::from_str(&text).map_err(|e| {
                                WarehouseError::Protocol(format!("decoding {url}: {e}"))
                            })?
                        };
                        return Ok((status, body));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%status, %url, attempt, "retrying warehouse request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(WarehouseError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        message: api_error_message(&text),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying warehouse request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(WarehouseError::Request(err));
                }
            }
        }
    }

    fn job_url(&self, job_id: &str, location: Option<&str>) -> String {
        let mut url = format!(
            "{}/projects/{}/jobs/{}",
            self.config.api_base, self.config.project_id, job_id
        );
        if let Some(location) = location {
            url.push_str("?location=");
            url.push_str(location);
        }
        url
    }

    /// Polls `jobs.get` until the job reports `DONE`.
    async fn wait_for_job(
        &self,
        job_id: &str,
        location: Option<&str>,
    ) -> Result<JsonValue, WarehouseError> {
        let url = self.job_url(job_id, location);
        loop {
            let (_, job) = self.send_json(|| self.client.get(&url)).await?;
            let state = job
                .pointer("/status/state")
                .and_then(JsonValue::as_str)
                .unwrap_or("PENDING");
            if state == "DONE" {
                if let Some(message) = job
                    .pointer("/status/errorResult/message")
                    .and_then(JsonValue::as_str)
                {
                    return Err(WarehouseError::JobFailed {
                        job_id: job_id.to_string(),
                        message: message.to_string(),
                    });
                }
                return Ok(job);
            }
            debug!(job_id, state, "waiting for warehouse job");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn insert_query_job(
        &self,
        sql: &str,
        job_id: &str,
        location: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let url = format!(
            "{}/projects/{}/jobs",
            self.config.api_base, self.config.project_id
        );
        let body = json!({
            "jobReference": self.job_reference(job_id, location),
            "configuration": {
                "query": {
                    "query": sql,
                    "useLegacySql": false,
                }
            }
        });
        let (status, _) = self.send_json(|| self.client.post(&url).json(&body)).await?;
        if status == StatusCode::CONFLICT {
            debug!(job_id, "query job already inserted by an earlier attempt");
        }
        Ok(())
    }
}

/// `multipart/related` body: JSON job metadata followed by the raw payload.
fn multipart_related(boundary: &str, metadata: &JsonValue, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn stat_u64(job: &JsonValue, pointer: &str) -> Option<u64> {
    match job.pointer(pointer)? {
        JsonValue::String(s) => s.parse().ok(),
        JsonValue::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn fetch_schema(&self, table: &TableRef) -> Result<TargetSchema, WarehouseError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.config.api_base,
            self.project_of(table),
            table.dataset,
            table.table
        );
        let (_, body) = match self.send_json(|| self.client.get(&url)).await {
            Err(WarehouseError::HttpStatus { status: 404, .. }) => {
                return Err(WarehouseError::TableNotFound(table.to_string()))
            }
            other => other?,
        };
        let resource: TableResource = serde_json::from_value(body)
            .map_err(|e| WarehouseError::Protocol(format!("table resource for {table}: {e}")))?;
        resource
            .schema
            .map(TargetSchema::from)
            .ok_or_else(|| WarehouseError::Protocol(format!("table {table} has no schema")))
    }

    async fn load_table(&self, request: LoadRequest<'_>) -> Result<JobReceipt, WarehouseError> {
        let job_id = format!("sentivol_load_{}", Uuid::new_v4().simple());
        let span = info_span!("bq_load", job_id = %job_id, table = %request.table);

        async {
            let payload = to_parquet_bytes(request.schema, request.batch)?;
            let metadata = json!({
                "jobReference": self.job_reference(&job_id, request.location),
                "configuration": {
                    "load": {
                        "destinationTable": self.table_reference(request.table),
                        "sourceFormat": "PARQUET",
                        "writeDisposition": request.disposition.as_api_str(),
                        "createDisposition": "CREATE_IF_NEEDED",
                        "schema": { "fields": request.schema },
                        "parquetOptions": { "enableListInference": true },
                    }
                }
            });
            let boundary = format!("sentivol_{}", Uuid::new_v4().simple());
            let body = multipart_related(&boundary, &metadata, &payload);
            let url = format!(
                "{}/projects/{}/jobs?uploadType=multipart",
                self.config.upload_base, self.config.project_id
            );
            info!(rows = request.batch.len(), bytes = payload.len(), "uploading staging payload");

            self.send_json(|| {
                self.client
                    .post(&url)
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body.clone())
            })
            .await?;

            let job = self.wait_for_job(&job_id, request.location).await?;
            Ok::<_, WarehouseError>(JobReceipt {
                job_id: job_id.clone(),
                rows_affected: stat_u64(&job, "/statistics/load/outputRows"),
            })
        }
        .instrument(span)
        .await
    }

    async fn execute_merge(
        &self,
        plan: &MergePlan,
        location: Option<&str>,
    ) -> Result<JobReceipt, WarehouseError> {
        let job_id = format!("sentivol_merge_{}", Uuid::new_v4().simple());
        let span = info_span!("bq_merge", job_id = %job_id, table = %plan.target);

        async {
            let sql = plan.render();
            self.insert_query_job(&sql, &job_id, location).await?;
            let job = self.wait_for_job(&job_id, location).await?;
            Ok::<_, WarehouseError>(JobReceipt {
                job_id: job_id.clone(),
                rows_affected: stat_u64(&job, "/statistics/query/numDmlAffectedRows"),
            })
        }
        .instrument(span)
        .await
    }
}
