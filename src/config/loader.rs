//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, applying environment overrides,
//! validating all parameters, and providing clear error messages
//! for misconfiguration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use super::{AppConfig, PublisherKind};
use crate::domain::calendar::{MarketCalendar, SessionSpec};
use crate::ports::quote_source::Credentials;

/// Environment variable holding the upstream API key.
pub const ENV_API_KEY: &str = "QUOTE_API_KEY";
/// Environment variable holding the upstream secret.
pub const ENV_SECRET_KEY: &str = "QUOTE_SECRET_KEY";
/// Overrides `publisher.broker_url`.
pub const ENV_BROKER_URL: &str = "BRIDGE_BROKER_URL";
/// Overrides `publisher.topic`.
pub const ENV_TOPIC: &str = "BRIDGE_TOPIC";

/// Load, override from the environment and validate a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let mut config = parse_config(&content)?;
  apply_env_overrides(&mut config, |key| std::env::var(key).ok());
  validate_config(&config)?;

  info!(
    name = %config.bridge.name,
    symbols = config.bridge.symbols.len(),
    sessions = config.calendar.sessions.len(),
    holidays = config.calendar.holidays.len(),
    topic = %config.publisher.topic,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse TOML text without validation.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  toml::from_str(content).with_context(|| "Failed to parse config.toml")
}

/// Apply `BRIDGE_*` overrides. `lookup` abstracts the environment.
pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
  if let Some(url) = lookup(ENV_BROKER_URL).filter(|v| !v.trim().is_empty()) {
    config.publisher.broker_url = url;
  }
  if let Some(topic) = lookup(ENV_TOPIC).filter(|v| !v.trim().is_empty()) {
    config.publisher.topic = topic;
  }
}

/// Read upstream credentials from the environment.
///
/// # Errors
/// Fails when either variable is missing or empty.
pub fn credentials_from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials> {
  let api_key = lookup(ENV_API_KEY)
    .filter(|v| !v.is_empty())
    .with_context(|| format!("{ENV_API_KEY} is not set"))?;
  let secret_key = lookup(ENV_SECRET_KEY)
    .filter(|v| !v.is_empty())
    .with_context(|| format!("{ENV_SECRET_KEY} is not set"))?;
  Ok(Credentials::new(api_key, secret_key))
}

/// Build the exchange calendar from the `[calendar]` section.
pub fn build_calendar(config: &AppConfig) -> Result<MarketCalendar> {
  let tz = MarketCalendar::parse_timezone(&config.bridge.timezone)?;
  let holidays = MarketCalendar::parse_holidays(&config.calendar.holidays)?;
  let sessions = config
    .calendar
    .sessions
    .iter()
    .map(|s| {
      SessionSpec::parse(
        s.kind,
        &s.open,
        &s.close,
        Duration::from_secs(s.slow_threshold_secs),
      )
      .with_context(|| format!("Invalid {} session {}-{}", s.kind, s.open, s.close))
    })
    .collect::<Result<Vec<_>>>()?;

  Ok(MarketCalendar::new(tz, sessions, holidays, config.calendar.buffer_minutes))
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Non-empty symbol set and session table
/// - Parseable calendar (zone, clock times, holidays)
/// - Positive intervals and a timeout longer than every slow threshold
/// - Complete publisher endpoint for the selected backend
pub fn validate_config(config: &AppConfig) -> Result<()> {
  // Bridge validation
  anyhow::ensure!(
    !config.bridge.symbols.is_empty(),
    "At least one symbol must be configured"
  );
  for (i, symbol) in config.bridge.symbols.iter().enumerate() {
    anyhow::ensure!(!symbol.trim().is_empty(), "Symbol {} is empty", i);
  }

  // Calendar validation
  anyhow::ensure!(
    !config.calendar.sessions.is_empty(),
    "At least one calendar session must be configured"
  );
  build_calendar(config)?;

  // Monitor validation
  let monitor = &config.monitor;
  anyhow::ensure!(monitor.interval_secs > 0, "monitor.interval_secs must be positive");
  anyhow::ensure!(monitor.holiday_poll_secs > 0, "monitor.holiday_poll_secs must be positive");
  anyhow::ensure!(
    monitor.reconnect_timeout_secs > 0,
    "monitor.reconnect_timeout_secs must be positive"
  );
  for session in &config.calendar.sessions {
    anyhow::ensure!(
      session.slow_threshold_secs > 0 && session.slow_threshold_secs < monitor.timeout_secs,
      "{} session slow_threshold_secs must be in (0, timeout_secs={}), got {}",
      session.kind,
      monitor.timeout_secs,
      session.slow_threshold_secs
    );
  }
  anyhow::ensure!(
    monitor.max_reexpiry_backoff_secs >= monitor.interval_secs,
    "monitor.max_reexpiry_backoff_secs must be at least interval_secs"
  );

  // Source validation
  anyhow::ensure!(!config.source.url.is_empty(), "Source URL must not be empty");
  anyhow::ensure!(config.source.startup_attempts > 0, "source.startup_attempts must be positive");
  anyhow::ensure!(
    config.source.login_attempts_per_minute > 0,
    "source.login_attempts_per_minute must be positive"
  );

  // Publisher validation
  let publisher = &config.publisher;
  anyhow::ensure!(!publisher.topic.is_empty(), "Publisher topic must not be empty");
  anyhow::ensure!(publisher.batch_size_bytes > 0, "publisher.batch_size_bytes must be positive");
  anyhow::ensure!(publisher.buffer_capacity > 0, "publisher.buffer_capacity must be positive");
  match publisher.kind {
    PublisherKind::RestProxy => {
      anyhow::ensure!(
        !publisher.broker_url.is_empty(),
        "publisher.broker_url must be set for the rest_proxy backend"
      );
      anyhow::ensure!(
        !publisher.cluster_id.is_empty(),
        "publisher.cluster_id must be set for the rest_proxy backend"
      );
    }
    PublisherKind::File => {
      anyhow::ensure!(
        !publisher.data_dir.is_empty(),
        "publisher.data_dir must be set for the file backend"
      );
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::tick::Compression;

  const SAMPLE: &str = r#"
[bridge]
name = "taifex-bridge"
symbols = ["TXFR1", "MXFR1"]
timezone = "Asia/Taipei"

[calendar]
buffer_minutes = 1
holidays = ["2024-02-28"]

[[calendar.sessions]]
kind = "day"
open = "08:45"
close = "13:45"
slow_threshold_secs = 60

[[calendar.sessions]]
kind = "night"
open = "15:00"
close = "05:00"
slow_threshold_secs = 180

[source]
url = "wss://quotes.example.com/ws"

[publisher]
kind = "rest_proxy"
broker_url = "http://localhost:8082"
cluster_id = "lkc-1"
topic = "ticks"
"#;

  #[test]
  fn test_load_nonexistent_file() {
    let result = load_config("nonexistent.toml");
    assert!(result.is_err());
  }

  #[test]
  fn test_sample_parses_with_defaults() {
    let config = parse_config(SAMPLE).unwrap();
    validate_config(&config).unwrap();
    assert_eq!(config.monitor.interval_secs, 10);
    assert_eq!(config.monitor.timeout_secs, 300);
    assert_eq!(config.monitor.max_timeout_retries, 3);
    assert_eq!(config.publisher.linger_ms, 100);
    assert_eq!(config.publisher.batch_size_bytes, 256 * 1024);
    assert_eq!(config.publisher.compression, Compression::Zstd);
    assert_eq!(config.publisher.shutdown_grace_secs, 15);
    assert!(config.metrics.enabled);
  }

  #[test]
  fn test_calendar_builds_from_config() {
    let config = parse_config(SAMPLE).unwrap();
    let calendar = build_calendar(&config).unwrap();
    assert_eq!(calendar.timezone(), chrono_tz::Asia::Taipei);
    let holiday = chrono::NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
    assert!(!calendar.is_trading_date(holiday));
  }

  #[test]
  fn test_env_overrides_topic_and_broker() {
    let mut config = parse_config(SAMPLE).unwrap();
    apply_env_overrides(&mut config, |key| match key {
      ENV_TOPIC => Some("ticks-staging".to_string()),
      ENV_BROKER_URL => Some(String::new()),
      _ => None,
    });
    assert_eq!(config.publisher.topic, "ticks-staging");
    assert_eq!(config.publisher.broker_url, "http://localhost:8082");
  }

  #[test]
  fn test_credentials_required() {
    assert!(credentials_from_env(|_| None).is_err());
    let creds = credentials_from_env(|key| Some(format!("{key}-value"))).unwrap();
    assert_eq!(creds.api_key, "QUOTE_API_KEY-value");
    assert!(!format!("{creds:?}").contains("value"));
  }

  #[test]
  fn test_rejects_bad_calendar() {
    let mut config = parse_config(SAMPLE).unwrap();
    config.calendar.holidays.push("2024-13-01".to_string());
    assert!(validate_config(&config).is_err());

    let mut config = parse_config(SAMPLE).unwrap();
    config.bridge.timezone = "Mars/Olympus".to_string();
    assert!(validate_config(&config).is_err());

    let mut config = parse_config(SAMPLE).unwrap();
    config.calendar.sessions[0].open = "8:75".to_string();
    assert!(validate_config(&config).is_err());
  }

  #[test]
  fn test_rejects_slow_threshold_above_timeout() {
    let mut config = parse_config(SAMPLE).unwrap();
    config.calendar.sessions[1].slow_threshold_secs = 600;
    assert!(validate_config(&config).is_err());
  }

  #[test]
  fn test_rest_proxy_requires_endpoint() {
    let mut config = parse_config(SAMPLE).unwrap();
    config.publisher.cluster_id.clear();
    assert!(validate_config(&config).is_err());

    config.publisher.kind = PublisherKind::File;
    validate_config(&config).unwrap();
  }

  #[test]
  fn test_rejects_empty_symbols() {
    let mut config = parse_config(SAMPLE).unwrap();
    config.bridge.symbols.clear();
    assert!(validate_config(&config).is_err());
  }
}
