//! Bridge Stats - Lock-free counters shared across tasks.
//!
//! Use cases bump these atomics on the hot path; the metrics and
//! health adapters read them at scrape / probe time.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use super::quote_ingress::ConnectionState;

type LatencyHook = Box<dyn Fn(Duration) + Send + Sync>;

/// Runtime counters and gauges for the whole bridge.
#[derive(Default)]
pub struct BridgeStats {
  /// Quotes delivered by the upstream.
  pub ticks_received: AtomicU64,
  /// Quotes that could not be parsed into ticks.
  pub ticks_rejected: AtomicU64,
  /// Ticks acknowledged by the event log.
  pub ticks_published: AtomicU64,
  /// Ticks lost to a full buffer, closed publisher or exhausted retries.
  pub ticks_dropped: AtomicU64,
  /// Batches acknowledged by the event log.
  pub batches_sent: AtomicU64,
  /// Batches abandoned after retries.
  pub batches_failed: AtomicU64,
  /// Reconnects that re-established the session.
  pub reconnects_succeeded: AtomicU64,
  /// Reconnects that failed or timed out.
  pub reconnects_failed: AtomicU64,
  /// Reconnects skipped because one was already running.
  pub reconnects_skipped: AtomicU64,
  /// Monitor evaluation cycles run.
  pub monitor_evaluations: AtomicU64,
  /// Monitor state gauge (see `HealthState::as_gauge`).
  pub monitor_state: AtomicI64,
  /// Seconds since the last tick at the last evaluation.
  pub silence_secs: AtomicU64,
  /// Consecutive critical timeouts.
  pub consecutive_timeouts: AtomicU64,
  /// Connection state gauge (see `ConnectionState::as_gauge`).
  pub connection_state: AtomicI64,
  /// Whether the publisher accepts new ticks.
  pub publisher_open: AtomicBool,
  /// Set once the shutdown sequence starts.
  pub shutting_down: AtomicBool,
  /// Receives every batch send latency.
  latency_hook: OnceLock<LatencyHook>,
}

impl fmt::Debug for BridgeStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BridgeStats")
      .field("ticks_received", &self.ticks_received)
      .field("ticks_published", &self.ticks_published)
      .field("ticks_dropped", &self.ticks_dropped)
      .field("connection_state", &self.connection_state)
      .field("monitor_state", &self.monitor_state)
      .finish_non_exhaustive()
  }
}

impl BridgeStats {
  /// Fresh, zeroed stats.
  pub fn new() -> Self {
    Self::default()
  }

  /// Add `n` to a counter.
  pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Read a counter.
  pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
  }

  /// Install the latency observer. Only the first call wins.
  pub fn on_publish_latency(&self, hook: impl Fn(Duration) + Send + Sync + 'static) -> bool {
    self.latency_hook.set(Box::new(hook)).is_ok()
  }

  /// Record one acknowledged batch.
  pub fn record_batch(&self, ticks: usize, latency: Duration) {
    Self::add(&self.batches_sent, 1);
    Self::add(&self.ticks_published, ticks as u64);
    if let Some(hook) = self.latency_hook.get() {
      hook(latency);
    }
  }

  /// Record ticks that will never reach the log.
  pub fn record_dropped(&self, ticks: usize) {
    Self::add(&self.ticks_dropped, ticks as u64);
  }

  /// Ready when the upstream is connected, the publisher is open and no
  /// shutdown is under way.
  pub fn is_ready(&self) -> bool {
    !self.shutting_down.load(Ordering::Relaxed)
      && self.publisher_open.load(Ordering::Relaxed)
      && self.connection_state.load(Ordering::Relaxed) == ConnectionState::Connected.as_gauge()
  }
}
