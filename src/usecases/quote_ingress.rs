//! Quote Ingress - Upstream session owner and callback hand-off.
//!
//! Owns the `ConnectionState` and the only path to the upstream login.
//! Callbacks from the source are turned into `Tick`s and handed to the
//! publisher; the monitor hears about them through a `watch` channel
//! (ticks) and a bounded signal queue (session events), neither of which
//! can block the source's delivery task.
//!
//! Every login and teardown runs under one session lock. Once `stop` has
//! begun, no reconnect may leave a live session behind.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono_tz::Tz;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::health_monitor::{MonitorLink, MonitorSignal};
use super::stats::BridgeStats;
use super::tick_publisher::TickPublisher;
use crate::domain::errors::ConnectError;
use crate::domain::tick::{RawQuote, Tick};
use crate::ports::clock::Clock;
use crate::ports::quote_source::{Credentials, QuoteHandler, QuoteSource, SessionEvent};

/// Upstream session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  /// No session.
  Disconnected,
  /// Login or re-login in progress.
  Connecting,
  /// Logged in and subscribed.
  Connected,
  /// Upstream reported the session as expired.
  SessionExpired,
}

impl ConnectionState {
  /// Numeric encoding for the connection gauge.
  pub fn as_gauge(self) -> i64 {
    match self {
      Self::Disconnected => 0,
      Self::Connecting => 1,
      Self::Connected => 2,
      Self::SessionExpired => 3,
    }
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Disconnected => write!(f, "disconnected"),
      Self::Connecting => write!(f, "connecting"),
      Self::Connected => write!(f, "connected"),
      Self::SessionExpired => write!(f, "session_expired"),
    }
  }
}

/// Result of a reconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
  /// Session torn down and re-established.
  Reconnected,
  /// Another attempt was running; nothing was sent upstream.
  AlreadyInProgress,
  /// The ingress was stopped; any session the attempt opened is closed.
  Stopped,
}

/// Ingress tunables.
#[derive(Debug, Clone)]
pub struct IngressSettings {
  /// Instruments to subscribe to.
  pub symbols: Vec<String>,
  /// Zone for naive upstream timestamps.
  pub exchange_tz: Tz,
  /// Upper bound for one reconnect.
  pub reconnect_timeout: Duration,
  /// Hard cap on logins per minute.
  pub login_attempts_per_minute: u32,
}

/// Owner of the upstream session.
pub struct QuoteIngress {
  source: Arc<dyn QuoteSource>,
  handler: Arc<IngressHandler>,
  settings: IngressSettings,
  credentials: Mutex<Option<Credentials>>,
  state: Arc<RwLock<ConnectionState>>,
  /// Held across every login and teardown.
  session: AsyncMutex<()>,
  /// Set by `stop`; refuses further logins.
  stopped: AtomicBool,
  login_limiter: DefaultDirectRateLimiter,
  stats: Arc<BridgeStats>,
}

impl QuoteIngress {
  /// Build the ingress and register its callback handler with `source`.
  pub fn new(
    source: Arc<dyn QuoteSource>,
    publisher: Arc<TickPublisher>,
    clock: Arc<dyn Clock>,
    link: MonitorLink,
    settings: IngressSettings,
    stats: Arc<BridgeStats>,
  ) -> Self {
    let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
    let handler = Arc::new(IngressHandler {
      publisher,
      clock,
      link,
      exchange_tz: settings.exchange_tz,
      state: Arc::clone(&state),
      stats: Arc::clone(&stats),
    });
    source.set_handler(Arc::clone(&handler) as Arc<dyn QuoteHandler>);

    let per_minute = NonZeroU32::new(settings.login_attempts_per_minute).unwrap_or(NonZeroU32::MIN);
    let login_limiter = RateLimiter::direct(Quota::per_minute(per_minute));

    Self {
      source,
      handler,
      settings,
      credentials: Mutex::new(None),
      state,
      session: AsyncMutex::new(()),
      stopped: AtomicBool::new(false),
      login_limiter,
      stats,
    }
  }

  /// Current connection state.
  pub async fn connection_state(&self) -> ConnectionState {
    *self.state.read().await
  }

  /// Callback receiver registered with the source.
  pub fn handler(&self) -> Arc<dyn QuoteHandler> {
    Arc::clone(&self.handler) as Arc<dyn QuoteHandler>
  }

  /// Log in and subscribe to the configured symbols.
  ///
  /// The credentials are kept for later reconnects.
  #[instrument(skip(self, credentials), fields(source = self.source.name()))]
  pub async fn start(&self, credentials: &Credentials) -> Result<(), ConnectError> {
    *self
      .credentials
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());

    let _session = self.session.lock().await;
    self.set_state(ConnectionState::Connecting).await;
    let result = self.establish(credentials).await;
    match &result {
      Ok(()) => {
        self.set_state(ConnectionState::Connected).await;
        info!(symbols = ?self.settings.symbols, "Upstream session established");
      }
      Err(e) => {
        self.set_state(ConnectionState::Disconnected).await;
        warn!(error = %e, "Upstream session could not be established");
      }
    }
    result
  }

  /// Unsubscribe and log out for good.
  ///
  /// Waits for an in-flight reconnect to finish; later reconnects return
  /// `ReconnectOutcome::Stopped` without logging in.
  #[instrument(skip(self), fields(source = self.source.name()))]
  pub async fn stop(&self) {
    self.stopped.store(true, Ordering::Release);
    let _session = self.session.lock().await;
    self.teardown().await;
    info!("Upstream session closed");
  }

  /// Whether `stop` has been called.
  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::Acquire)
  }

  /// Release the upstream session during a suspected holiday.
  ///
  /// The ingress stays `Disconnected` until the next `reconnect`.
  #[instrument(skip(self), fields(source = self.source.name()))]
  pub async fn suspend(&self) {
    if self.connection_state().await == ConnectionState::Connecting {
      debug!("Reconnect in flight, suspend deferred to it");
      return;
    }
    let _session = self.session.lock().await;
    self.teardown().await;
    info!("Upstream session released until next session open");
  }

  /// Tear down the live session and log in again.
  ///
  /// Returns `AlreadyInProgress` without touching the upstream when
  /// another attempt is running. Failures are reported, never retried here.
  #[instrument(skip(self), fields(source = self.source.name()))]
  pub async fn reconnect(&self) -> Result<ReconnectOutcome, ConnectError> {
    if self.is_stopped() {
      debug!("Ingress stopped, reconnect refused");
      return Ok(ReconnectOutcome::Stopped);
    }
    {
      let mut state = self.state.write().await;
      if *state == ConnectionState::Connecting {
        BridgeStats::add(&self.stats.reconnects_skipped, 1);
        debug!("Reconnect already in progress");
        return Ok(ReconnectOutcome::AlreadyInProgress);
      }
      *state = ConnectionState::Connecting;
    }
    self.publish_state(ConnectionState::Connecting);

    let credentials = self
      .credentials
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();

    let budget = self.settings.reconnect_timeout;
    let result = match credentials {
      None => Err(ConnectError::NotConnected),
      Some(credentials) => timeout(budget, async {
        let _session = self.session.lock().await;
        if self.is_stopped() {
          return Ok(ReconnectOutcome::Stopped);
        }
        if let Err(e) = self.source.logout().await {
          debug!(error = %e, "Logout before reconnect failed");
        }
        if let Err(e) = self.establish(&credentials).await {
          return Err(e);
        }
        if self.is_stopped() {
          self.teardown().await;
          return Ok(ReconnectOutcome::Stopped);
        }
        self.set_state(ConnectionState::Connected).await;
        Ok(ReconnectOutcome::Reconnected)
      })
      .await
      .unwrap_or(Err(ConnectError::Timeout(budget))),
    };

    match &result {
      Ok(ReconnectOutcome::Reconnected) => {
        BridgeStats::add(&self.stats.reconnects_succeeded, 1);
        info!("Reconnected to upstream");
      }
      Ok(_) => {
        self.set_state(ConnectionState::Disconnected).await;
        info!("Ingress stopped during reconnect, upstream session released");
      }
      Err(e) => {
        self.set_state(ConnectionState::Disconnected).await;
        BridgeStats::add(&self.stats.reconnects_failed, 1);
        warn!(error = %e, "Reconnect failed");
      }
    }
    result
  }

  async fn establish(&self, credentials: &Credentials) -> Result<(), ConnectError> {
    if self.login_limiter.check().is_err() {
      return Err(ConnectError::RateLimited);
    }
    self.source.connect(credentials).await?;
    self.source.subscribe(&self.settings.symbols).await
  }

  async fn teardown(&self) {
    if let Err(e) = self.source.unsubscribe(&self.settings.symbols).await {
      debug!(error = %e, "Unsubscribe failed");
    }
    if let Err(e) = self.source.logout().await {
      debug!(error = %e, "Logout failed");
    }
    self.set_state(ConnectionState::Disconnected).await;
  }

  async fn set_state(&self, next: ConnectionState) {
    *self.state.write().await = next;
    self.publish_state(next);
  }

  fn publish_state(&self, state: ConnectionState) {
    self
      .stats
      .connection_state
      .store(state.as_gauge(), Ordering::Relaxed);
  }
}

/// Callback side of the ingress, invoked on the source's delivery task.
pub struct IngressHandler {
  publisher: Arc<TickPublisher>,
  clock: Arc<dyn Clock>,
  link: MonitorLink,
  exchange_tz: Tz,
  state: Arc<RwLock<ConnectionState>>,
  stats: Arc<BridgeStats>,
}

impl IngressHandler {
  fn signal(&self, event: SessionEvent) {
    let signal = match event {
      SessionEvent::Disconnected => MonitorSignal::Disconnected,
      SessionEvent::SessionExpired => MonitorSignal::SessionExpired,
      SessionEvent::Reconnected => MonitorSignal::Reconnected,
    };
    if let Err(e) = self.link.signals.try_send(signal) {
      warn!(error = %e, "Monitor signal queue full, signal dropped");
    }
  }
}

impl QuoteHandler for IngressHandler {
  fn on_tick(&self, quote: RawQuote) {
    let received_at = self.clock.now();
    BridgeStats::add(&self.stats.ticks_received, 1);

    let tick = match Tick::parse(quote, self.exchange_tz, received_at) {
      Ok(tick) => tick,
      Err(e) => {
        BridgeStats::add(&self.stats.ticks_rejected, 1);
        warn!(error = %e, "Malformed quote skipped");
        return;
      }
    };

    // Failures are counted and logged by the publisher.
    let _ = self.publisher.publish(&tick);
    self.link.ticks.send_replace(received_at);
  }

  fn on_session_event(&self, event: SessionEvent) {
    // Events caused by our own teardown or re-login are not news.
    let Ok(mut state) = self.state.try_write() else {
      warn!(%event, "Connection state busy, forwarding session event to monitor");
      self.signal(event);
      return;
    };
    let previous = *state;
    let ignored = match (previous, event) {
      (ConnectionState::Connecting, _) => true,
      (ConnectionState::Disconnected, ev) => ev != SessionEvent::Reconnected,
      _ => false,
    };
    if ignored {
      debug!(%event, state = %previous, "Session event ignored");
      return;
    }

    let next = match event {
      SessionEvent::Disconnected => ConnectionState::Disconnected,
      SessionEvent::SessionExpired => ConnectionState::SessionExpired,
      SessionEvent::Reconnected => ConnectionState::Connected,
    };
    *state = next;
    drop(state);
    self
      .stats
      .connection_state
      .store(next.as_gauge(), Ordering::Relaxed);
    info!(%event, from = %previous, to = %next, "Upstream session event");
    self.signal(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::errors::PublishError;
  use crate::domain::tick::Compression;
  use crate::ports::clock::SystemClock;
  use crate::ports::event_publisher::{BatchHeaders, EventPublisher};
  use crate::usecases::health_monitor::{monitor_channel, MonitorInbox};
  use crate::usecases::tick_publisher::PublisherSettings;
  use async_trait::async_trait;
  use chrono::Utc;
  use std::sync::atomic::AtomicU32;
  use tokio::sync::mpsc::error::TryRecvError;

  #[derive(Default)]
  struct CountingSource {
    logins: AtomicU32,
    logouts: AtomicU32,
  }

  #[async_trait]
  impl QuoteSource for CountingSource {
    fn set_handler(&self, _handler: Arc<dyn QuoteHandler>) {}

    async fn connect(&self, _credentials: &Credentials) -> Result<(), ConnectError> {
      self.logins.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    async fn subscribe(&self, _symbols: &[String]) -> Result<(), ConnectError> {
      Ok(())
    }

    async fn unsubscribe(&self, _symbols: &[String]) -> Result<(), ConnectError> {
      Ok(())
    }

    async fn logout(&self) -> Result<(), ConnectError> {
      self.logouts.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    fn name(&self) -> &'static str {
      "counting"
    }
  }

  struct NullSink;

  #[async_trait]
  impl EventPublisher for NullSink {
    async fn publish(&self, _: &str, _: Vec<u8>, _: &BatchHeaders) -> Result<u64, PublishError> {
      Ok(0)
    }

    async fn is_healthy(&self) -> bool {
      true
    }

    fn name(&self) -> &'static str {
      "null"
    }
  }

  fn ingress(source: Arc<CountingSource>) -> (QuoteIngress, MonitorInbox) {
    let stats = Arc::new(BridgeStats::new());
    let publisher = Arc::new(TickPublisher::spawn(
      Arc::new(NullSink),
      PublisherSettings {
        batch_size_bytes: 1 << 16,
        linger: Duration::from_millis(10),
        compression: Compression::None,
        buffer_capacity: 16,
        max_send_retries: 0,
        retry_base_delay: Duration::from_millis(1),
      },
      Arc::clone(&stats),
    ));
    let (link, inbox) = monitor_channel(Utc::now());
    let ingress = QuoteIngress::new(
      source,
      publisher,
      Arc::new(SystemClock),
      link,
      IngressSettings {
        symbols: vec!["TXFC4".to_string()],
        exchange_tz: chrono_tz::Asia::Taipei,
        reconnect_timeout: Duration::from_secs(5),
        login_attempts_per_minute: 60,
      },
      stats,
    );
    (ingress, inbox)
  }

  #[tokio::test]
  async fn test_session_event_reaches_monitor_while_state_is_busy() {
    let source = Arc::new(CountingSource::default());
    let (ingress, mut inbox) = ingress(Arc::clone(&source));
    ingress.start(&Credentials::new("key", "secret")).await.unwrap();

    let reader = ingress.state.read().await;
    ingress.handler().on_session_event(SessionEvent::SessionExpired);
    drop(reader);

    assert_eq!(inbox.signals.try_recv(), Ok(MonitorSignal::SessionExpired));
    assert_eq!(inbox.signals.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_reconnect_after_stop_is_refused() {
    let source = Arc::new(CountingSource::default());
    let (ingress, _inbox) = ingress(Arc::clone(&source));
    ingress.start(&Credentials::new("key", "secret")).await.unwrap();

    ingress.stop().await;
    assert!(ingress.is_stopped());
    assert_eq!(ingress.reconnect().await, Ok(ReconnectOutcome::Stopped));

    assert_eq!(source.logins.load(Ordering::SeqCst), 1);
    assert_eq!(source.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(ingress.connection_state().await, ConnectionState::Disconnected);
  }
}
