//! Tick Publisher - Batching hand-off to the event log.
//!
//! `publish` never blocks: it encodes the tick and pushes it into a
//! bounded queue. A single flush task owns per-symbol batches and sends
//! them one at a time, so records for one symbol reach the log in the
//! order they were published.
//!
//! A batch flushes when its encoded size reaches `batch_size_bytes` or
//! `linger` after its first tick, whichever comes first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::stats::BridgeStats;
use crate::config::PublisherConfig;
use crate::domain::errors::PublishError;
use crate::domain::tick::{Compression, Tick};
use crate::ports::event_publisher::{BatchHeaders, EventPublisher};

/// Batching and retry tunables.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
  /// Flush threshold on encoded (uncompressed) size.
  pub batch_size_bytes: usize,
  /// Maximum time a tick waits in a batch.
  pub linger: Duration,
  /// Payload compression.
  pub compression: Compression,
  /// Intake queue capacity.
  pub buffer_capacity: usize,
  /// Send attempts beyond the first.
  pub max_send_retries: u32,
  /// First retry delay, doubled per attempt.
  pub retry_base_delay: Duration,
}

impl From<&PublisherConfig> for PublisherSettings {
  fn from(config: &PublisherConfig) -> Self {
    Self {
      batch_size_bytes: config.batch_size_bytes,
      linger: config.linger(),
      compression: config.compression,
      buffer_capacity: config.buffer_capacity,
      max_send_retries: config.max_send_retries,
      retry_base_delay: config.retry_base_delay(),
    }
  }
}

/// Log acknowledgement for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
  /// Offset of the batch record that carried the tick.
  pub offset: u64,
  /// Batch identifier.
  pub batch_id: Uuid,
  /// Ticks in that batch.
  pub record_count: usize,
}

type AckSender = oneshot::Sender<Result<Ack, PublishError>>;

/// Resolves once the tick's batch has been acknowledged or abandoned.
///
/// Dropping the handle is fine; delivery proceeds regardless.
#[derive(Debug)]
pub struct DeliveryHandle {
  rx: oneshot::Receiver<Result<Ack, PublishError>>,
}

impl DeliveryHandle {
  /// Wait for the delivery outcome.
  pub async fn wait(self) -> Result<Ack, PublishError> {
    self.rx.await.unwrap_or(Err(PublishError::Closed))
  }
}

enum Command {
  Line {
    symbol: String,
    line: Vec<u8>,
    ack: AckSender,
  },
  Flush(oneshot::Sender<()>),
  Shutdown,
}

/// Non-blocking, batching publisher in front of an `EventPublisher`.
pub struct TickPublisher {
  tx: mpsc::Sender<Command>,
  closed: AtomicBool,
  task: Mutex<Option<JoinHandle<()>>>,
  stats: Arc<BridgeStats>,
}

impl TickPublisher {
  /// Spawn the flush task. Must be called inside a tokio runtime.
  pub fn spawn(
    sink: Arc<dyn EventPublisher>,
    settings: PublisherSettings,
    stats: Arc<BridgeStats>,
  ) -> Self {
    let (tx, rx) = mpsc::channel(settings.buffer_capacity.max(1));
    let flusher = Flusher {
      sink,
      settings,
      stats: Arc::clone(&stats),
      batches: HashMap::new(),
    };
    let task = tokio::spawn(flusher.run(rx));
    stats.publisher_open.store(true, Ordering::Relaxed);

    Self {
      tx,
      closed: AtomicBool::new(false),
      task: Mutex::new(Some(task)),
      stats,
    }
  }

  /// Enqueue a tick. Returns immediately.
  ///
  /// # Errors
  /// `BufferFull` when the queue is saturated, `Closed` after shutdown,
  /// `Serialization` if the tick cannot be encoded. Every failure counts
  /// as a dropped tick.
  pub fn publish(&self, tick: &Tick) -> Result<DeliveryHandle, PublishError> {
    let result = self.enqueue(tick);
    if let Err(e) = &result {
      self.stats.record_dropped(1);
      debug!(symbol = %tick.symbol, error = %e, "Tick not accepted");
    }
    result
  }

  fn enqueue(&self, tick: &Tick) -> Result<DeliveryHandle, PublishError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(PublishError::Closed);
    }
    let line = tick.to_line()?;
    let (ack, rx) = oneshot::channel();
    let command = Command::Line {
      symbol: tick.symbol.clone(),
      line,
      ack,
    };
    self.tx.try_send(command).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => PublishError::BufferFull,
      mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
    })?;
    Ok(DeliveryHandle { rx })
  }

  /// Whether new ticks are still accepted.
  pub fn is_open(&self) -> bool {
    !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
  }

  /// Send every pending batch now and wait for the sends to finish.
  pub async fn flush(&self) -> Result<(), PublishError> {
    let (done, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Flush(done))
      .await
      .map_err(|_| PublishError::Closed)?;
    rx.await.map_err(|_| PublishError::Closed)
  }

  /// Stop intake, drain the queue and flush every batch, waiting at most
  /// `grace`. Returns whether the drain completed in time.
  #[instrument(skip(self))]
  pub async fn shutdown(&self, grace: Duration) -> bool {
    if self.closed.swap(true, Ordering::AcqRel) {
      return true;
    }
    self.stats.publisher_open.store(false, Ordering::Relaxed);

    let task = self
      .task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    let Some(mut task) = task else {
      return true;
    };

    let drained = timeout(grace, async {
      let _ = self.tx.send(Command::Shutdown).await;
      (&mut task).await
    })
    .await;

    match drained {
      Ok(Ok(())) => {
        info!("Publisher drained");
        true
      }
      Ok(Err(e)) => {
        error!(error = %e, "Publisher flush task failed");
        false
      }
      Err(_) => {
        task.abort();
        warn!(grace_secs = grace.as_secs(), "Publisher drain exceeded grace period");
        false
      }
    }
  }
}

struct Batch {
  lines: Vec<u8>,
  acks: Vec<AckSender>,
  opened_at: Instant,
}

struct Flusher {
  sink: Arc<dyn EventPublisher>,
  settings: PublisherSettings,
  stats: Arc<BridgeStats>,
  batches: HashMap<String, Batch>,
}

impl Flusher {
  async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
    loop {
      let deadline = self.next_deadline();
      tokio::select! {
        command = rx.recv() => match command {
          Some(Command::Line { symbol, line, ack }) => self.append(symbol, line, ack).await,
          Some(Command::Flush(done)) => {
            self.flush_all().await;
            let _ = done.send(());
          }
          // Remaining queued lines are still delivered by recv().
          Some(Command::Shutdown) => rx.close(),
          None => break,
        },
        () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
          self.flush_expired().await;
        }
      }
    }
    self.flush_all().await;
    debug!("Flush task stopped");
  }

  fn next_deadline(&self) -> Option<Instant> {
    self
      .batches
      .values()
      .map(|b| b.opened_at + self.settings.linger)
      .min()
  }

  async fn append(&mut self, symbol: String, line: Vec<u8>, ack: AckSender) {
    let batch = self.batches.entry(symbol.clone()).or_insert_with(|| Batch {
      lines: Vec::with_capacity(line.len() * 16),
      acks: Vec::new(),
      opened_at: Instant::now(),
    });
    batch.lines.extend_from_slice(&line);
    batch.acks.push(ack);

    if batch.lines.len() >= self.settings.batch_size_bytes {
      if let Some(batch) = self.batches.remove(&symbol) {
        self.send(&symbol, batch).await;
      }
    }
  }

  async fn flush_expired(&mut self) {
    let now = Instant::now();
    let mut due: Vec<(String, Instant)> = self
      .batches
      .iter()
      .filter(|(_, b)| b.opened_at + self.settings.linger <= now)
      .map(|(symbol, b)| (symbol.clone(), b.opened_at))
      .collect();
    due.sort_by_key(|(_, opened)| *opened);

    for (symbol, _) in due {
      if let Some(batch) = self.batches.remove(&symbol) {
        self.send(&symbol, batch).await;
      }
    }
  }

  async fn flush_all(&mut self) {
    let mut all: Vec<(String, Batch)> = self.batches.drain().collect();
    all.sort_by_key(|(_, b)| b.opened_at);
    for (symbol, batch) in all {
      self.send(&symbol, batch).await;
    }
  }

  async fn send(&self, symbol: &str, batch: Batch) {
    let count = batch.acks.len();
    let outcome = self.send_with_retry(symbol, batch.lines, count).await;

    match &outcome {
      Ok(ack) => {
        debug!(symbol, offset = ack.offset, records = count, batch_id = %ack.batch_id, "Batch sent");
      }
      Err(e) => {
        self.stats.record_dropped(count);
        BridgeStats::add(&self.stats.batches_failed, 1);
        error!(symbol, records = count, error = %e, "Batch dropped");
      }
    }

    for ack in batch.acks {
      let _ = ack.send(outcome.clone());
    }
  }

  async fn send_with_retry(
    &self,
    symbol: &str,
    body: Vec<u8>,
    count: usize,
  ) -> Result<Ack, PublishError> {
    let payload = self.settings.compression.compress(body)?;
    let headers = BatchHeaders::ndjson(self.settings.compression, count);
    let mut last_error = None;

    for attempt in 0..=self.settings.max_send_retries {
      if attempt > 0 {
        let delay = self
          .settings
          .retry_base_delay
          .saturating_mul(2u32.saturating_pow(attempt - 1));
        debug!(symbol, attempt, delay_ms = delay.as_millis(), "Retrying batch");
        sleep(delay).await;
      }

      let started = Instant::now();
      match self.sink.publish(symbol, payload.clone(), &headers).await {
        Ok(offset) => {
          self.stats.record_batch(count, started.elapsed());
          return Ok(Ack {
            offset,
            batch_id: headers.batch_id,
            record_count: count,
          });
        }
        Err(e) if e.is_retryable() => {
          warn!(symbol, attempt, error = %e, sink = self.sink.name(), "Batch send failed");
          last_error = Some(e);
        }
        Err(e) => return Err(e),
      }
    }

    Err(PublishError::RetriesExhausted {
      attempts: self.settings.max_send_retries + 1,
      last: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::tick::decode_batch;
  use async_trait::async_trait;
  use chrono::Utc;
  use rust_decimal_macros::dec;
  use std::collections::BTreeMap;
  use std::sync::atomic::AtomicU32;

  /// Records every call; fails the first `failures` attempts.
  #[derive(Default)]
  struct RecordingSink {
    records: Mutex<Vec<(String, Vec<u8>, BatchHeaders)>>,
    failures: AtomicU32,
    reject: bool,
  }

  #[async_trait]
  impl EventPublisher for RecordingSink {
    async fn publish(
      &self,
      key: &str,
      payload: Vec<u8>,
      headers: &BatchHeaders,
    ) -> Result<u64, PublishError> {
      if self.reject {
        return Err(PublishError::Rejected("schema".to_string()));
      }
      if self
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
      {
        return Err(PublishError::Transport("connection refused".to_string()));
      }
      let mut records = self.records.lock().unwrap();
      records.push((key.to_string(), payload, headers.clone()));
      Ok(records.len() as u64 - 1)
    }

    async fn is_healthy(&self) -> bool {
      true
    }

    fn name(&self) -> &'static str {
      "recording"
    }
  }

  fn settings() -> PublisherSettings {
    PublisherSettings {
      batch_size_bytes: 1 << 20,
      linger: Duration::from_millis(100),
      compression: Compression::Zstd,
      buffer_capacity: 64,
      max_send_retries: 2,
      retry_base_delay: Duration::from_millis(10),
    }
  }

  fn tick(symbol: &str, seq: u64) -> Tick {
    Tick {
      symbol: symbol.to_string(),
      timestamp: Utc::now(),
      price: dec!(17350.5),
      volume: dec!(1),
      sequence: Some(seq),
      received_at: Utc::now(),
      attributes: BTreeMap::new(),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_linger_flushes_per_symbol_in_order() {
    let sink = Arc::new(RecordingSink::default());
    let stats = Arc::new(BridgeStats::new());
    let publisher = TickPublisher::spawn(sink.clone(), settings(), stats.clone());

    let ticks: Vec<Tick> = (0..5).map(|i| tick("TXFR1", i)).collect();
    let mut handles = Vec::new();
    for t in &ticks {
      handles.push(publisher.publish(t).unwrap());
    }
    publisher.publish(&tick("MXFR1", 9)).unwrap();

    let ack = handles.pop().unwrap().wait().await.unwrap();
    assert_eq!(ack.record_count, 5);

    let records = sink.records.lock().unwrap().clone();
    let (key, payload, headers) = records.iter().find(|r| r.0 == "TXFR1").unwrap();
    assert_eq!(key, "TXFR1");
    assert_eq!(headers.record_count, 5);
    assert_eq!(decode_batch(payload, Compression::Zstd).unwrap(), ticks);
    drop(records);

    assert!(publisher.shutdown(Duration::from_secs(1)).await);
    assert_eq!(BridgeStats::get(&stats.ticks_published), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_size_threshold_flushes_without_linger() {
    let sink = Arc::new(RecordingSink::default());
    let mut s = settings();
    s.batch_size_bytes = 1;
    s.linger = Duration::from_secs(3600);
    let publisher = TickPublisher::spawn(sink.clone(), s, Arc::new(BridgeStats::new()));

    let ack = publisher.publish(&tick("TXFR1", 1)).unwrap().wait().await.unwrap();
    assert_eq!(ack.record_count, 1);
    assert_eq!(sink.records.lock().unwrap().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_is_retried() {
    let sink = Arc::new(RecordingSink {
      failures: AtomicU32::new(2),
      ..RecordingSink::default()
    });
    let publisher = TickPublisher::spawn(sink.clone(), settings(), Arc::new(BridgeStats::new()));
    let ack = publisher.publish(&tick("TXFR1", 1)).unwrap().wait().await;
    assert!(ack.is_ok());
    assert_eq!(sink.records.lock().unwrap().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_retries_drop_and_count() {
    let sink = Arc::new(RecordingSink {
      failures: AtomicU32::new(10),
      ..RecordingSink::default()
    });
    let stats = Arc::new(BridgeStats::new());
    let publisher = TickPublisher::spawn(sink, settings(), stats.clone());

    let a = publisher.publish(&tick("TXFR1", 1)).unwrap();
    let b = publisher.publish(&tick("TXFR1", 2)).unwrap();
    let err = a.wait().await.unwrap_err();
    assert!(matches!(err, PublishError::RetriesExhausted { attempts: 3, .. }));
    assert!(b.wait().await.is_err());
    assert_eq!(BridgeStats::get(&stats.ticks_dropped), 2);
    assert_eq!(BridgeStats::get(&stats.batches_failed), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejection_is_not_retried() {
    let sink = Arc::new(RecordingSink {
      reject: true,
      ..RecordingSink::default()
    });
    let publisher = TickPublisher::spawn(sink, settings(), Arc::new(BridgeStats::new()));
    let err = publisher.publish(&tick("TXFR1", 1)).unwrap().wait().await.unwrap_err();
    assert_eq!(err, PublishError::Rejected("schema".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_closed_after_shutdown() {
    let sink = Arc::new(RecordingSink::default());
    let stats = Arc::new(BridgeStats::new());
    let publisher = TickPublisher::spawn(sink.clone(), settings(), stats.clone());
    let pending = publisher.publish(&tick("TXFR1", 1)).unwrap();

    assert!(publisher.shutdown(Duration::from_secs(5)).await);
    assert!(pending.wait().await.is_ok());
    assert!(!publisher.is_open());
    assert_eq!(publisher.publish(&tick("TXFR1", 2)).unwrap_err(), PublishError::Closed);
    assert_eq!(BridgeStats::get(&stats.ticks_dropped), 1);
  }

  #[tokio::test]
  async fn test_full_buffer_rejects() {
    let sink = Arc::new(RecordingSink::default());
    let mut s = settings();
    s.buffer_capacity = 1;
    let stats = Arc::new(BridgeStats::new());
    let publisher = TickPublisher::spawn(sink, s, stats.clone());

    // The flush task has not been polled yet on this single-threaded runtime.
    publisher.publish(&tick("TXFR1", 1)).unwrap();
    assert_eq!(publisher.publish(&tick("TXFR1", 2)).unwrap_err(), PublishError::BufferFull);
    assert_eq!(BridgeStats::get(&stats.ticks_dropped), 1);
  }
}
