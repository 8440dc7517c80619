//! Event Publisher Port - Durable Event Log Interface
//!
//! One call appends one record to the log. Records sharing a key must
//! land in the same partition, in call order.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::PublishError;
use crate::domain::tick::Compression;

/// Content type of every batch payload.
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Metadata attached to a batch record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeaders {
  /// Payload media type.
  pub content_type: &'static str,
  /// Payload compression.
  pub compression: Compression,
  /// Number of ticks in the payload.
  pub record_count: usize,
  /// Unique batch identifier, for deduplication downstream.
  pub batch_id: Uuid,
}

impl BatchHeaders {
  /// Headers for a fresh NDJSON batch.
  pub fn ndjson(compression: Compression, record_count: usize) -> Self {
    Self {
      content_type: CONTENT_TYPE_NDJSON,
      compression,
      record_count,
      batch_id: Uuid::new_v4(),
    }
  }

  /// Header name/value pairs in wire order.
  pub fn pairs(&self) -> Vec<(&'static str, String)> {
    vec![
      ("content-type", self.content_type.to_string()),
      ("content-encoding", self.compression.content_encoding().to_string()),
      ("record-count", self.record_count.to_string()),
      ("batch-id", self.batch_id.to_string()),
    ]
  }
}

/// Trait for durable log backends.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
  /// Append one record. Returns the offset assigned by the log.
  async fn publish(
    &self,
    key: &str,
    payload: Vec<u8>,
    headers: &BatchHeaders,
  ) -> Result<u64, PublishError>;

  /// Whether the backend is reachable.
  async fn is_healthy(&self) -> bool;

  /// Short name for logs and metrics.
  fn name(&self) -> &'static str;
}
