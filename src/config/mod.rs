//! Configuration Module - TOML-based Bridge Configuration
//!
//! Loads and validates configuration from `config.toml` with
//! environment variable overrides via `.env` files.
//! Session tables, holidays and endpoints are externalized
//! here - nothing is hardcoded in the domain layer.

pub mod loader;

use std::time::Duration;

use serde::Deserialize;

use crate::domain::calendar::SessionKind;
use crate::domain::health::MonitorPolicy;
use crate::domain::tick::Compression;

/// Top-level bridge configuration.
///
/// Loaded from `config.toml` at startup and never mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Bridge identity and instrument set.
  pub bridge: BridgeConfig,
  /// Liveness monitor tuning.
  #[serde(default)]
  pub monitor: MonitorConfig,
  /// Exchange trading calendar.
  pub calendar: CalendarConfig,
  /// Upstream quote gateway.
  pub source: SourceConfig,
  /// Downstream event log.
  pub publisher: PublisherConfig,
  /// Metrics and health endpoints.
  #[serde(default)]
  pub metrics: MetricsConfig,
}

/// Bridge identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
  /// Human-readable instance name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Instruments to subscribe to.
  pub symbols: Vec<String>,
  /// Exchange time zone (IANA name).
  #[serde(default = "default_timezone")]
  pub timezone: String,
}

/// Liveness monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
  /// Evaluation period (seconds).
  #[serde(default = "default_interval")]
  pub interval_secs: u64,
  /// Silence that counts as a critical timeout (seconds).
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Timeouts tolerated before a closed market is presumed.
  #[serde(default = "default_max_timeout_retries")]
  pub max_timeout_retries: u32,
  /// Additional silence between repeated slow warnings (seconds).
  #[serde(default = "default_slow_escalation")]
  pub slow_escalation_secs: u64,
  /// Evaluation period while a holiday is suspected (seconds).
  #[serde(default = "default_holiday_poll")]
  pub holiday_poll_secs: u64,
  /// Upper bound for one reconnect attempt (seconds).
  #[serde(default = "default_reconnect_timeout")]
  pub reconnect_timeout_secs: u64,
  /// Session expiring this soon after a reconnect backs off (seconds).
  #[serde(default = "default_reexpiry_window")]
  pub reexpiry_window_secs: u64,
  /// Cap on the re-expiry cooldown (seconds).
  #[serde(default = "default_max_reexpiry_backoff")]
  pub max_reexpiry_backoff_secs: u64,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval(),
      timeout_secs: default_timeout_secs(),
      max_timeout_retries: default_max_timeout_retries(),
      slow_escalation_secs: default_slow_escalation(),
      holiday_poll_secs: default_holiday_poll(),
      reconnect_timeout_secs: default_reconnect_timeout(),
      reexpiry_window_secs: default_reexpiry_window(),
      max_reexpiry_backoff_secs: default_max_reexpiry_backoff(),
    }
  }
}

impl MonitorConfig {
  /// Evaluation period.
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  /// Evaluation period during a holiday hold.
  pub fn holiday_poll(&self) -> Duration {
    Duration::from_secs(self.holiday_poll_secs)
  }

  /// Upper bound for one reconnect attempt.
  pub fn reconnect_timeout(&self) -> Duration {
    Duration::from_secs(self.reconnect_timeout_secs)
  }

  /// State machine tunables.
  pub fn policy(&self) -> MonitorPolicy {
    MonitorPolicy {
      interval: self.interval(),
      timeout: Duration::from_secs(self.timeout_secs),
      max_timeout_retries: self.max_timeout_retries,
      slow_escalation_step: Duration::from_secs(self.slow_escalation_secs),
      reconnect_timeout: self.reconnect_timeout(),
      reexpiry_window: Duration::from_secs(self.reexpiry_window_secs),
      max_reexpiry_backoff: Duration::from_secs(self.max_reexpiry_backoff_secs),
    }
  }
}

/// Exchange calendar configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
  /// Minutes added around every session.
  #[serde(default = "default_buffer_minutes")]
  pub buffer_minutes: u32,
  /// Exchange holidays (`YYYY-MM-DD`).
  #[serde(default)]
  pub holidays: Vec<String>,
  /// Session table.
  pub sessions: Vec<SessionConfig>,
}

/// One row of the session table.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
  /// Day or night session.
  pub kind: SessionKind,
  /// Local open time (`HH:MM`).
  pub open: String,
  /// Local close time (`HH:MM`); earlier than `open` means overnight.
  pub close: String,
  /// Silence before a slow warning (seconds).
  pub slow_threshold_secs: u64,
}

/// Upstream quote gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
  /// Gateway WebSocket URL.
  pub url: String,
  /// Wait for a login acknowledgement (seconds).
  #[serde(default = "default_login_timeout")]
  pub login_timeout_secs: u64,
  /// Attempts to establish the first session before giving up.
  #[serde(default = "default_startup_attempts")]
  pub startup_attempts: u32,
  /// Hard cap on logins per minute, across all triggers.
  #[serde(default = "default_login_rate")]
  pub login_attempts_per_minute: u32,
}

impl SourceConfig {
  /// Wait for a login acknowledgement.
  pub fn login_timeout(&self) -> Duration {
    Duration::from_secs(self.login_timeout_secs)
  }
}

/// Event log backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
  /// Kafka REST proxy (v3 records API).
  RestProxy,
  /// Local append-only JSONL files.
  File,
}

/// Downstream event log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
  /// Backend selection.
  #[serde(default = "default_publisher_kind")]
  pub kind: PublisherKind,
  /// REST proxy base URL.
  #[serde(default)]
  pub broker_url: String,
  /// Kafka cluster id for the v3 API.
  #[serde(default)]
  pub cluster_id: String,
  /// Destination topic.
  pub topic: String,
  /// Root directory for the file backend.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
  /// Flush a symbol's batch once its encoded size reaches this.
  #[serde(default = "default_batch_size")]
  pub batch_size_bytes: usize,
  /// Flush a symbol's batch this long after its first tick (milliseconds).
  #[serde(default = "default_linger_ms")]
  pub linger_ms: u64,
  /// Batch payload compression.
  #[serde(default)]
  pub compression: Compression,
  /// Intake queue capacity, in ticks.
  #[serde(default = "default_buffer_capacity")]
  pub buffer_capacity: usize,
  /// Send attempts beyond the first.
  #[serde(default = "default_max_send_retries")]
  pub max_send_retries: u32,
  /// First retry delay, doubled on each attempt (milliseconds).
  #[serde(default = "default_retry_base_delay")]
  pub retry_base_delay_ms: u64,
  /// HTTP request timeout (seconds).
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// Time allowed to drain on shutdown (seconds).
  #[serde(default = "default_shutdown_grace")]
  pub shutdown_grace_secs: u64,
}

impl PublisherConfig {
  /// Batch linger.
  pub fn linger(&self) -> Duration {
    Duration::from_millis(self.linger_ms)
  }

  /// First retry delay.
  pub fn retry_base_delay(&self) -> Duration {
    Duration::from_millis(self.retry_base_delay_ms)
  }

  /// HTTP request timeout.
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Drain budget on shutdown.
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_timezone() -> String {
  "Asia/Taipei".to_string()
}

fn default_true() -> bool {
  true
}

fn default_interval() -> u64 {
  10
}

fn default_timeout_secs() -> u64 {
  300
}

fn default_max_timeout_retries() -> u32 {
  3
}

fn default_slow_escalation() -> u64 {
  60
}

fn default_holiday_poll() -> u64 {
  300
}

fn default_reconnect_timeout() -> u64 {
  30
}

fn default_reexpiry_window() -> u64 {
  60
}

fn default_max_reexpiry_backoff() -> u64 {
  300
}

fn default_buffer_minutes() -> u32 {
  1
}

fn default_login_timeout() -> u64 {
  15
}

fn default_startup_attempts() -> u32 {
  5
}

fn default_login_rate() -> u32 {
  6
}

fn default_publisher_kind() -> PublisherKind {
  PublisherKind::RestProxy
}

fn default_data_dir() -> String {
  "data".to_string()
}

fn default_batch_size() -> usize {
  262_144 // 256 KiB
}

fn default_linger_ms() -> u64 {
  100
}

fn default_buffer_capacity() -> usize {
  65_536
}

fn default_max_send_retries() -> u32 {
  5
}

fn default_retry_base_delay() -> u64 {
  200
}

fn default_request_timeout() -> u64 {
  10
}

fn default_shutdown_grace() -> u64 {
  15
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}
