//! Per-run JSON summaries on local disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sentivol_core::TableRef;
use serde::Serialize;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Filesystem-safe directory name for a table: `project.dataset.table` with
/// anything outside `[A-Za-z0-9_.-]` replaced by `_`.
pub fn table_slug(table: &TableRef) -> String {
    table
        .to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Lays summaries out as `{YYYYmmdd_HHMMSS}/{table}/{run_id}.json` under a root.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn summary_path(&self, run_id: Uuid, started_at: DateTime<Utc>, table: &TableRef) -> PathBuf {
        self.root
            .join(started_at.format("%Y%m%d_%H%M%S").to_string())
            .join(table_slug(table))
            .join(format!("{run_id}.json"))
    }

    /// Writes one run's summary and returns where it landed.
    pub async fn write_summary<T: Serialize>(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        table: &TableRef,
        document: &T,
    ) -> anyhow::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(document).context("serializing run summary")?;
        let path = self.summary_path(run_id, started_at, table);
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "run summary written");
        Ok(path)
    }
}

/// Readers see either no file or the whole file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("summary path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating summary directory {}", parent.display()))?;

    let partial = path.with_extension("json.partial");
    fs::write(&partial, bytes)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    if let Err(err) = fs::rename(&partial, path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err).with_context(|| format!("moving summary into {}", path.display()));
    }
    Ok(())
}
