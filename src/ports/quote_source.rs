//! Quote Source Port - Upstream Quote Gateway Interface
//!
//! The upstream pushes quotes and session events through a registered
//! handler; the bridge drives login, subscription and teardown.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::ConnectError;
use crate::domain::tick::RawQuote;

/// Upstream login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  /// API key issued by the broker.
  pub api_key: String,
  /// Secret paired with the API key.
  pub secret_key: String,
}

impl Credentials {
  /// Build credentials from raw strings.
  pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
    Self {
      api_key: api_key.into(),
      secret_key: secret_key.into(),
    }
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("api_key", &"<redacted>")
      .field("secret_key", &"<redacted>")
      .finish()
  }
}

/// Session lifecycle notification from the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
  /// Transport dropped.
  Disconnected,
  /// Transport came back on its own.
  Reconnected,
  /// Login session is no longer valid.
  SessionExpired,
}

impl fmt::Display for SessionEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Disconnected => write!(f, "disconnected"),
      Self::Reconnected => write!(f, "reconnected"),
      Self::SessionExpired => write!(f, "session_expired"),
    }
  }
}

/// Receiver for upstream callbacks.
///
/// Called from the source's delivery task; implementations must not block.
pub trait QuoteHandler: Send + Sync + 'static {
  /// One quote arrived.
  fn on_tick(&self, quote: RawQuote);

  /// Session state changed.
  fn on_session_event(&self, event: SessionEvent);
}

/// Trait for upstream quote gateways.
#[async_trait]
pub trait QuoteSource: Send + Sync + 'static {
  /// Register the callback receiver. Replaces any previous handler.
  fn set_handler(&self, handler: Arc<dyn QuoteHandler>);

  /// Open a session and authenticate.
  async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectError>;

  /// Start quote delivery for the given symbols.
  async fn subscribe(&self, symbols: &[String]) -> Result<(), ConnectError>;

  /// Stop quote delivery for the given symbols.
  async fn unsubscribe(&self, symbols: &[String]) -> Result<(), ConnectError>;

  /// End the session. Safe to call when already logged out.
  async fn logout(&self) -> Result<(), ConnectError>;

  /// Short name for logs and metrics.
  fn name(&self) -> &'static str;
}
