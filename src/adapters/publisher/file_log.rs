//! File Log Publisher - Append-only JSONL event log.
//!
//! Records land in `<data_dir>/<topic>/YYYY-MM-DD.jsonl`, one JSON object
//! per line. Offsets are a per-topic sequence that survives restarts
//! (recovered by counting existing records). Used for local runs and
//! as a test double with real I/O.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::domain::errors::PublishError;
use crate::ports::event_publisher::{BatchHeaders, EventPublisher};

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Per-topic sequence number.
    pub offset: u64,
    /// Partition key.
    pub key: String,
    /// Batch headers.
    pub headers: BTreeMap<String, String>,
    /// Base64 payload.
    pub payload: String,
    /// Append time.
    pub appended_at: DateTime<Utc>,
}

impl LogRecord {
    /// Decoded payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.payload)
            .context("Invalid base64 payload")
    }
}

/// Append-only JSONL publisher with daily file rotation.
pub struct FileLogPublisher {
    /// Directory for this topic.
    topic_dir: PathBuf,
    /// Next offset; the lock also serializes appends.
    next_offset: Mutex<u64>,
}

impl FileLogPublisher {
    /// Open (or create) the log for `topic` under `data_dir`.
    pub async fn open(data_dir: &str, topic: &str) -> Result<Self> {
        let topic_dir = Path::new(data_dir).join(topic);
        fs::create_dir_all(&topic_dir)
            .await
            .with_context(|| format!("Failed to create log directory {}", topic_dir.display()))?;

        let existing = read_records(&topic_dir).await?;
        let next_offset = existing.last().map_or(0, |r| r.offset + 1);
        info!(dir = %topic_dir.display(), next_offset, "File event log opened");

        Ok(Self {
            topic_dir,
            next_offset: Mutex::new(next_offset),
        })
    }

    /// Every record, in offset order.
    pub async fn records(&self) -> Result<Vec<LogRecord>> {
        read_records(&self.topic_dir).await
    }

    async fn append(&self, record: &LogRecord) -> std::io::Result<()> {
        let date = record.appended_at.format("%Y-%m-%d").to_string();
        let path = self.topic_dir.join(format!("{date}.jsonl"));

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

async fn read_records(dir: &Path) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            let content = fs::read_to_string(&path).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<LogRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(file = %path.display(), error = %e, "Skipping malformed log record"),
                }
            }
        }
    }

    records.sort_by_key(|r| r.offset);
    Ok(records)
}

#[async_trait]
impl EventPublisher for FileLogPublisher {
    #[instrument(skip(self, payload, headers), fields(bytes = payload.len()))]
    async fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
        headers: &BatchHeaders,
    ) -> Result<u64, PublishError> {
        let mut next = self.next_offset.lock().await;
        let record = LogRecord {
            offset: *next,
            key: key.to_string(),
            headers: headers
                .pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            payload: STANDARD.encode(&payload),
            appended_at: Utc::now(),
        };

        self.append(&record)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        *next += 1;
        Ok(record.offset)
    }

    async fn is_healthy(&self) -> bool {
        fs::metadata(&self.topic_dir).await.is_ok_and(|m| m.is_dir())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tick::Compression;

    #[tokio::test]
    async fn test_offsets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let headers = BatchHeaders::ndjson(Compression::None, 1);

        let log = FileLogPublisher::open(root, "ticks").await.unwrap();
        assert_eq!(log.publish("TXFR1", b"x\n".to_vec(), &headers).await, Ok(0));
        assert_eq!(log.publish("MXFR1", b"y\n".to_vec(), &headers).await, Ok(1));
        assert!(log.is_healthy().await);

        let reopened = FileLogPublisher::open(root, "ticks").await.unwrap();
        assert_eq!(reopened.publish("TXFR1", b"z\n".to_vec(), &headers).await, Ok(2));

        let records = reopened.records().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].key, "MXFR1");
        assert_eq!(records[1].payload_bytes().unwrap(), b"y\n");
        assert_eq!(records[0].headers["content-encoding"], "identity");
    }
}
