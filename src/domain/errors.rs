//! Error taxonomy shared by the domain, ports and use cases.
//!
//! Three families, one per failure boundary:
//! - `ConnectError`: upstream login / session failures (recovered by the monitor)
//! - `PublishError`: outbound log failures (bounded retry, then counted drop)
//! - `CalendarError`: calendar lookups (never escapes `session_at`)

use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Upstream authentication or session failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Credentials rejected or login handshake failed.
    #[error("login failed: {0}")]
    LoginFailed(String),
    /// Subscription request was rejected or never confirmed.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    /// The attempt did not finish within its time budget.
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
    /// Local login quota exhausted; the attempt was never sent upstream.
    #[error("login attempts rate limited")]
    RateLimited,
    /// Network-level failure talking to the upstream.
    #[error("transport error: {0}")]
    Transport(String),
    /// Operation requires a live session.
    #[error("no live upstream session")]
    NotConnected,
}

/// Outbound publish failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Intake buffer saturated; the tick was not accepted.
    #[error("publish buffer full")]
    BufferFull,
    /// Publisher is shut down.
    #[error("publisher closed")]
    Closed,
    /// Tick could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// Batch could not be compressed.
    #[error("compression failed: {0}")]
    Compression(String),
    /// Log system unreachable or request failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Log system answered but refused the record.
    #[error("record rejected: {0}")]
    Rejected(String),
    /// Bounded send retry gave up.
    #[error("send failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of send attempts made.
        attempts: u32,
        /// Last underlying error message.
        last: String,
    },
}

impl PublishError {
    /// Whether another send attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Calendar lookup or calendar configuration failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalendarError {
    /// Time zone name not present in the tz database.
    #[error("unknown time zone: {0}")]
    UnknownTimezone(String),
    /// Session boundary is not a valid `HH:MM` clock time.
    #[error("invalid time of day: {0}")]
    InvalidTimeOfDay(String),
    /// Holiday entry is not a valid `YYYY-MM-DD` date.
    #[error("invalid holiday date: {0}")]
    InvalidHoliday(String),
    /// Local wall-clock time skipped by a zone transition.
    #[error("local time {0} does not exist in the exchange time zone")]
    NonexistentLocalTime(NaiveDateTime),
}
