// Overflow log - JSON-lines side channel for batches that could not be stored
use crate::domain::sample::Sample;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
struct OverflowRecord<'a> {
    logged_at: DateTime<Utc>,
    batch_id: u64,
    attempts: u32,
    reason: &'a str,
    sample: &'a Sample,
}

#[derive(Debug)]
pub struct OverflowLog {
    path: PathBuf,
    // Serializes writers so records from different batches never interleave
    write_lock: Mutex<()>,
}

impl OverflowLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append every sample of a failed batch, one JSON object per line
    pub async fn record(
        &self,
        batch_id: u64,
        attempts: u32,
        reason: &str,
        samples: &[Sample],
    ) -> anyhow::Result<()> {
        let logged_at = Utc::now();
        let mut lines = Vec::with_capacity(samples.len() * 160);
        for sample in samples {
            let record = OverflowRecord {
                logged_at,
                batch_id,
                attempts,
                reason,
                sample,
            };
            serde_json::to_writer(&mut lines, &record).context("Failed to encode overflow record")?;
            lines.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open overflow log {}", self.path.display()))?;
        file.write_all(&lines).await?;
        file.flush().await?;
        Ok(())
    }
}
