use crate::error::{FramepulseError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One finalized session summary, immutable once created.
///
/// Lifecycle: built from the session accumulator, appended to the WAL,
/// enqueued in memory, shipped by the upload worker, trimmed from the WAL
/// on confirmed delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub game: Option<String>,
    pub avg_fps: f64,
    pub avg_frametime: f64,
    pub one_percent_low: f64,
    pub sample_count: u32,
}

/// Write-ahead log of telemetry records, one JSON object per line.
///
/// Append-only; records are removed only by head-trimming after their batch
/// is confirmed uploaded. One async mutex serializes append and trim so the
/// file never sees interleaved writes. Single process, single writer.
pub struct TelemetryWal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TelemetryWal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record; returns only after the line is on disk
    pub async fn append(&self, record: &TelemetryRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                FramepulseError::component("wal", format!("Failed to open WAL file: {}", e))
            })?;

        file.write_all(line.as_bytes()).await.map_err(|e| {
            FramepulseError::component("wal", format!("Failed to append to WAL: {}", e))
        })?;

        file.sync_data().await.map_err(|e| {
            FramepulseError::component("wal", format!("Failed to sync WAL: {}", e))
        })?;

        debug!("Appended record to WAL: {}", self.path.display());
        Ok(())
    }

    /// Read back all persisted records in append order.
    ///
    /// Corrupt lines (torn writes from a crash) are skipped, not fatal.
    pub async fn replay(&self) -> Result<Vec<TelemetryRecord>> {
        let _guard = self.lock.lock().await;

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FramepulseError::component("wal", format!("Failed to read WAL file: {}", e))
        })?;

        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping corrupt WAL line: {}", e);
                }
            }
        }

        info!(
            "Replayed {} records from WAL: {}",
            records.len(),
            self.path.display()
        );
        Ok(records)
    }

    /// Remove the oldest `removed` lines after their batch was delivered.
    ///
    /// Rewrites the file without the delivered prefix; deletes it entirely
    /// when everything has been delivered.
    pub async fn trim(&self, removed: usize) -> Result<()> {
        if removed == 0 {
            return Ok(());
        }

        let _guard = self.lock.lock().await;

        if !self.path.exists() {
            return Ok(());
        }

        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FramepulseError::component("wal", format!("Failed to read WAL file: {}", e))
        })?;
        let lines: Vec<&str> = contents.lines().collect();

        if removed >= lines.len() {
            tokio::fs::remove_file(&self.path).await.map_err(|e| {
                FramepulseError::component("wal", format!("Failed to delete WAL file: {}", e))
            })?;
            debug!("WAL fully delivered, deleted: {}", self.path.display());
        } else {
            let mut remaining = lines[removed..].join("\n");
            remaining.push('\n');
            tokio::fs::write(&self.path, remaining).await.map_err(|e| {
                FramepulseError::component("wal", format!("Failed to rewrite WAL file: {}", e))
            })?;
            debug!(
                "Trimmed {} delivered records from WAL head ({} remain)",
                removed,
                lines.len() - removed
            );
        }

        Ok(())
    }

    /// Number of records currently persisted
    pub async fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;

        if !self.path.exists() {
            return Ok(0);
        }

        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FramepulseError::component("wal", format!("Failed to read WAL file: {}", e))
        })?;
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count())
    }
}
