//! Health Monitor - Liveness loop around the feed state machine.
//!
//! Evaluates `MonitorState` every interval and on every signal from the
//! ingress, performs the resulting action, and reports transitions.
//! While a holiday is suspected the interval ticks are thinned out to
//! one evaluation per holiday poll, ending on the next session open.
//! Reconnects run in their own task so the loop keeps consuming signals
//! while an upstream login is in flight; the outcome comes back as a
//! `MonitorSignal::ReconnectFinished`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::quote_ingress::{QuoteIngress, ReconnectOutcome};
use super::stats::BridgeStats;
use crate::config::MonitorConfig;
use crate::domain::calendar::MarketCalendar;
use crate::domain::errors::ConnectError;
use crate::domain::health::{
  Assessment, HealthState, MonitorAction, MonitorPolicy, MonitorState, Notice, Severity,
};
use crate::ports::clock::Clock;

/// Capacity of the session signal queue.
const SIGNAL_CAPACITY: usize = 64;

/// Notification for the monitor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorSignal {
  /// Upstream reported an expired session.
  SessionExpired,
  /// Upstream transport dropped.
  Disconnected,
  /// Upstream restored the transport on its own.
  Reconnected,
  /// A reconnect spawned by the monitor finished.
  ReconnectFinished(Result<ReconnectOutcome, ConnectError>),
}

/// Sending half, held by the ingress callback handler.
#[derive(Debug, Clone)]
pub struct MonitorLink {
  /// Receive time of the latest tick.
  pub ticks: watch::Sender<DateTime<Utc>>,
  /// Session signals.
  pub signals: mpsc::Sender<MonitorSignal>,
}

/// Receiving half, owned by the monitor.
#[derive(Debug)]
pub struct MonitorInbox {
  pub(crate) ticks: watch::Receiver<DateTime<Utc>>,
  pub(crate) signals: mpsc::Receiver<MonitorSignal>,
  results: mpsc::Sender<MonitorSignal>,
}

/// Create the ingress → monitor channels, armed at `now`.
pub fn monitor_channel(now: DateTime<Utc>) -> (MonitorLink, MonitorInbox) {
  let (tick_tx, tick_rx) = watch::channel(now);
  let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
  let link = MonitorLink {
    ticks: tick_tx,
    signals: signal_tx.clone(),
  };
  let inbox = MonitorInbox {
    ticks: tick_rx,
    signals: signal_rx,
    results: signal_tx,
  };
  (link, inbox)
}

/// Liveness monitor for the upstream feed.
pub struct HealthMonitor {
  ingress: Arc<QuoteIngress>,
  calendar: Arc<MarketCalendar>,
  clock: Arc<dyn Clock>,
  policy: MonitorPolicy,
  holiday_poll: Duration,
  state: Mutex<MonitorState>,
  inbox: tokio::sync::Mutex<MonitorInbox>,
  results: mpsc::Sender<MonitorSignal>,
  market_open: Mutex<Option<bool>>,
  /// Earliest interval tick that evaluates during a holiday hold.
  next_holiday_poll: Mutex<Option<DateTime<Utc>>>,
  stats: Arc<BridgeStats>,
}

impl HealthMonitor {
  /// Create a monitor armed at the clock's current time.
  pub fn new(
    ingress: Arc<QuoteIngress>,
    calendar: Arc<MarketCalendar>,
    clock: Arc<dyn Clock>,
    config: &MonitorConfig,
    inbox: MonitorInbox,
    stats: Arc<BridgeStats>,
  ) -> Self {
    let now = clock.now();
    let slow = calendar
      .session_at(now)
      .map_or(Duration::from_secs(config.timeout_secs), |s| s.slow_threshold);
    let results = inbox.results.clone();

    Self {
      ingress,
      calendar,
      clock,
      policy: config.policy(),
      holiday_poll: config.holiday_poll(),
      state: Mutex::new(MonitorState::new(now, slow)),
      inbox: tokio::sync::Mutex::new(inbox),
      results,
      market_open: Mutex::new(None),
      next_holiday_poll: Mutex::new(None),
      stats,
    }
  }

  /// Current classification.
  pub fn health_state(&self) -> HealthState {
    self.lock_state().state()
  }

  /// Copy of the full machine state.
  pub fn snapshot(&self) -> MonitorState {
    self.lock_state().clone()
  }

  /// Run until shutdown. Safe to call again after a panic: the machine
  /// state and the inbox survive.
  #[instrument(skip_all)]
  pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut guard = self.inbox.lock().await;
    let inbox = &mut *guard;
    let mut ticker = interval(self.policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    let now = self.clock.now();
    self.banner(now, self.calendar.session_at(now).is_some());
    info!(
      interval_secs = self.policy.interval.as_secs(),
      timeout_secs = self.policy.timeout.as_secs(),
      max_timeout_retries = self.policy.max_timeout_retries,
      "Health monitor started"
    );

    loop {
      tokio::select! {
        biased;
        _ = shutdown_rx.recv() => {
          info!("Health monitor shutting down");
          break;
        }
        Some(signal) = inbox.signals.recv() => self.handle_signal(signal),
        Ok(()) = inbox.ticks.changed() => {
          let at = *inbox.ticks.borrow_and_update();
          self.on_tick(at);
        }
        _ = ticker.tick() => self.on_interval(),
      }
    }
  }

  /// A tick arrived at `at`.
  pub fn on_tick(&self, at: DateTime<Utc>) {
    let previous = self.lock_state().record_tick(at);
    self.stats.monitor_state.store(HealthState::Healthy.as_gauge(), Ordering::Relaxed);
    self.stats.consecutive_timeouts.store(0, Ordering::Relaxed);
    self.stats.silence_secs.store(0, Ordering::Relaxed);
    if previous != HealthState::Healthy {
      info!(from = %previous, to = %HealthState::Healthy, "Tick received, feed healthy");
    }
  }

  /// Interval tick. Skipped between polls of a holiday hold.
  pub fn on_interval(&self) {
    let now = self.clock.now();
    let mut next_poll = self
      .next_holiday_poll
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let held = self.health_state() == HealthState::HolidaySuspected;
    if held && next_poll.is_some_and(|at| now < at) {
      return;
    }
    *next_poll = None;
    drop(next_poll);

    self.evaluate();

    let state = self.snapshot();
    if state.state() == HealthState::HolidaySuspected {
      let until_open = state
        .holiday_until()
        .map_or(self.holiday_poll, |until| {
          (until - now).to_std().unwrap_or(Duration::ZERO)
        });
      let wait = self.holiday_poll.min(until_open);
      if let Ok(wait) = TimeDelta::from_std(wait) {
        *self
          .next_holiday_poll
          .lock()
          .unwrap_or_else(PoisonError::into_inner) = Some(now + wait);
      }
    }
  }

  /// Run one evaluation cycle and perform its action.
  pub fn evaluate(&self) {
    let now = self.clock.now();
    let assessment = self.lock_state().evaluate(now, &self.calendar, &self.policy);
    BridgeStats::add(&self.stats.monitor_evaluations, 1);

    self
      .stats
      .monitor_state
      .store(assessment.state.as_gauge(), Ordering::Relaxed);
    self
      .stats
      .silence_secs
      .store(assessment.elapsed.as_secs(), Ordering::Relaxed);
    self
      .stats
      .consecutive_timeouts
      .store(u64::from(assessment.consecutive_timeouts), Ordering::Relaxed);

    self.banner(now, assessment.session.is_some());
    self.report(&assessment);

    match assessment.action {
      MonitorAction::Reconnect => self.spawn_reconnect(),
      MonitorAction::Suspend => self.spawn_suspend(),
      MonitorAction::None => {}
    }
  }

  /// Handle one signal from the ingress or a reconnect task.
  pub fn handle_signal(&self, signal: MonitorSignal) {
    let now = self.clock.now();
    match signal {
      MonitorSignal::SessionExpired | MonitorSignal::Disconnected => {
        let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
        let reconnect = self
          .lock_state()
          .on_session_expired(now, &self.policy, jitter);
        if reconnect {
          warn!(signal = ?signal, "Upstream session lost, reconnecting immediately");
          self.spawn_reconnect();
        } else {
          debug!(signal = ?signal, "Upstream session lost, reconnect deferred to cooldown");
        }
      }
      MonitorSignal::Reconnected => {
        self.lock_state().rearm(now);
        info!("Upstream restored its session, silence timer re-armed");
      }
      MonitorSignal::ReconnectFinished(result) => {
        let succeeded = matches!(result, Ok(ReconnectOutcome::Reconnected));
        let holiday = {
          let mut state = self.lock_state();
          state.record_reconnect_result(now, succeeded);
          state.state() == HealthState::HolidaySuspected
        };
        match result {
          Ok(ReconnectOutcome::Reconnected) if holiday => {
            info!("Reconnect landed during a suspected holiday, releasing the session");
            self.spawn_suspend();
          }
          Ok(ReconnectOutcome::Reconnected) => info!("Reconnect succeeded, silence timer re-armed"),
          Ok(ReconnectOutcome::AlreadyInProgress) => debug!("Reconnect skipped, already in progress"),
          Ok(ReconnectOutcome::Stopped) => debug!("Reconnect skipped, ingress stopped"),
          Err(e) => warn!(error = %e, "Reconnect failed, retrying on a later cycle"),
        }
      }
    }
  }

  fn spawn_reconnect(&self) {
    let ingress = Arc::clone(&self.ingress);
    let results = self.results.clone();
    tokio::spawn(async move {
      let outcome = ingress.reconnect().await;
      if results
        .send(MonitorSignal::ReconnectFinished(outcome))
        .await
        .is_err()
      {
        debug!("Monitor gone, reconnect outcome discarded");
      }
    });
  }

  fn spawn_suspend(&self) {
    let ingress = Arc::clone(&self.ingress);
    tokio::spawn(async move {
      ingress.suspend().await;
    });
  }

  fn banner(&self, now: DateTime<Utc>, open: bool) {
    let mut last = self.market_open.lock().unwrap_or_else(PoisonError::into_inner);
    if *last == Some(open) {
      return;
    }
    *last = Some(open);
    drop(last);

    if open {
      let kind = self.calendar.session_at(now).map(|s| s.kind.to_string());
      info!(session = kind.as_deref().unwrap_or("unknown"), "==== MARKET OPEN ====");
    } else {
      let next_open = self.calendar.next_session_open(now);
      info!(next_open = ?next_open, "==== MARKET CLOSED ====");
    }
  }

  fn report(&self, a: &Assessment) {
    let elapsed_secs = a.elapsed.as_secs();
    let session = a.session.as_ref().map(|s| s.kind.to_string());
    let session = session.as_deref().unwrap_or("closed");

    if a.is_transition() {
      info!(
        from = %a.previous,
        to = %a.state,
        elapsed_secs,
        consecutive_timeouts = a.consecutive_timeouts,
        session,
        "Monitor state changed"
      );
    }

    let Some(notice) = a.notice else {
      return;
    };
    match notice {
      Notice::Recovered => info!(elapsed_secs, session, "Tick flow recovered"),
      Notice::SlowWarning { level } => warn!(
        level,
        elapsed_secs,
        threshold_secs = a.session.as_ref().map_or(0, |s| s.slow_threshold.as_secs()),
        session,
        "Ticks slower than expected"
      ),
      Notice::Timeout { attempt } if a.severity == Severity::Outage => error!(
        alert = "outage",
        attempt,
        max = self.policy.max_timeout_retries,
        elapsed_secs,
        session,
        "No ticks during open session after exhausting retries, reconnecting"
      ),
      Notice::Timeout { attempt } => error!(
        attempt,
        max = self.policy.max_timeout_retries,
        elapsed_secs,
        session,
        "Tick timeout, reconnecting"
      ),
      Notice::AwaitingReconnect => debug!(elapsed_secs, "Tick timeout, reconnect pending"),
      Notice::HolidaySuspected { until } => info!(
        until = ?until,
        consecutive_timeouts = a.consecutive_timeouts,
        "No ticks and no scheduled session, holiday suspected; releasing upstream until next open"
      ),
      Notice::HolidayHold { until } => {
        info!(until = ?until, "Holiday hold, waiting for next session open");
      }
      Notice::SessionResumed => info!(session, "Scheduled session open reached, re-establishing upstream"),
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
