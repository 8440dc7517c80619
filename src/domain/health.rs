//! Feed health state machine.
//!
//! Classifies upstream silence into `Healthy`, `Slow`, `CriticalTimeout`
//! or `HolidaySuspected` and decides when a reconnect is due. Pure: time
//! and calendar are inputs, the caller performs the returned action.
//!
//! The holiday branch needs both conditions at once: the timeout budget is
//! spent AND the calendar reports no active session. Inside a session the
//! machine never leaves `CriticalTimeout` on its own; it keeps reconnecting
//! once per evaluation cycle and escalates to an outage alert instead.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::calendar::{MarketCalendar, SessionWindow};

/// Health classification of the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Ticks flowing, or silence is expected.
    Healthy,
    /// Silence longer than the session's slow threshold.
    Slow,
    /// Silence long enough to presume the connection failed.
    CriticalTimeout,
    /// Silence explained by the absence of any trading session.
    HolidaySuspected,
}

impl HealthState {
    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            Self::Healthy => 0,
            Self::Slow => 1,
            Self::CriticalTimeout => 2,
            Self::HolidaySuspected => 3,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Slow => write!(f, "slow"),
            Self::CriticalTimeout => write!(f, "critical_timeout"),
            Self::HolidaySuspected => write!(f, "holiday_suspected"),
        }
    }
}

/// Alert level attached to an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational, expected condition.
    Info,
    /// Degraded but no action taken.
    Warn,
    /// Critical timeout within the retry budget.
    Error,
    /// Retry budget exhausted during an open session.
    Outage,
}

/// What the caller must do after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Nothing to do.
    None,
    /// Tear down and re-establish the upstream session.
    Reconnect,
    /// Release the upstream session until the next session open.
    Suspend,
}

/// Notable event produced by an evaluation, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Flow returned to normal after `Slow` or `CriticalTimeout`.
    Recovered,
    /// Slow-tick warning at the given escalation level (1-based).
    SlowWarning { level: u32 },
    /// Critical timeout; reconnect attempt number `attempt`.
    Timeout { attempt: u32 },
    /// Critical timeout but a reconnect is in flight or cooling down.
    AwaitingReconnect,
    /// Holiday branch taken; holding until `until` (if a session is known).
    HolidaySuspected { until: Option<DateTime<Utc>> },
    /// Still inside a holiday hold.
    HolidayHold { until: Option<DateTime<Utc>> },
    /// Holiday hold ended at a scheduled session open.
    SessionResumed,
}

/// Tunables for the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorPolicy {
    /// Period of the evaluation cycle.
    pub interval: Duration,
    /// Silence that counts as a critical timeout.
    pub timeout: Duration,
    /// Timeouts tolerated before the holiday check runs.
    pub max_timeout_retries: u32,
    /// Extra silence between consecutive slow warnings.
    pub slow_escalation_step: Duration,
    /// Upper bound for a single reconnect attempt.
    pub reconnect_timeout: Duration,
    /// A session expiring this soon after a reconnect counts as re-expiry.
    pub reexpiry_window: Duration,
    /// Cap for the re-expiry cooldown.
    pub max_reexpiry_backoff: Duration,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// State before the evaluation.
    pub previous: HealthState,
    /// State after the evaluation.
    pub state: HealthState,
    /// Action for the caller.
    pub action: MonitorAction,
    /// Alert level.
    pub severity: Severity,
    /// Silence since the last tick (or re-arm).
    pub elapsed: Duration,
    /// Timeout counter after the evaluation.
    pub consecutive_timeouts: u32,
    /// Session active at evaluation time.
    pub session: Option<SessionWindow>,
    /// Notable event, if any.
    pub notice: Option<Notice>,
}

impl Assessment {
    /// Whether the state changed.
    pub fn is_transition(&self) -> bool {
        self.previous != self.state
    }
}

/// Memory of the health machine.
#[derive(Debug, Clone)]
pub struct MonitorState {
    /// Last tick seen (or last re-arm after a reconnect / resume).
    pub last_tick_at: DateTime<Utc>,
    /// Critical timeouts since the last healthy evaluation or tick.
    pub consecutive_timeouts: u32,
    /// Slow threshold of the most recent active session.
    pub current_slow_threshold: Duration,
    /// Whether the holiday branch is active.
    pub suspected_holiday: bool,
    state: HealthState,
    slow_warning_level: u32,
    cycle: u64,
    reconnect_cycle: Option<u64>,
    last_reconnect_at: Option<DateTime<Utc>>,
    last_reconnect_ok_at: Option<DateTime<Utc>>,
    reconnect_in_flight: Option<DateTime<Utc>>,
    holiday_until: Option<DateTime<Utc>>,
    reexpiry_streak: u32,
    reexpiry_cooldown: Duration,
}

impl MonitorState {
    /// Fresh state, armed at `now`.
    pub fn new(now: DateTime<Utc>, slow_threshold: Duration) -> Self {
        Self {
            last_tick_at: now,
            consecutive_timeouts: 0,
            current_slow_threshold: slow_threshold,
            suspected_holiday: false,
            state: HealthState::Healthy,
            slow_warning_level: 0,
            cycle: 0,
            reconnect_cycle: None,
            last_reconnect_at: None,
            last_reconnect_ok_at: None,
            reconnect_in_flight: None,
            holiday_until: None,
            reexpiry_streak: 0,
            reexpiry_cooldown: Duration::ZERO,
        }
    }

    /// Current classification.
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// End of the current holiday hold, if any.
    pub fn holiday_until(&self) -> Option<DateTime<Utc>> {
        self.holiday_until
    }

    /// Whether a reconnect issued by this machine has not reported back yet.
    pub fn reconnect_in_flight(&self) -> bool {
        self.reconnect_in_flight.is_some()
    }

    /// Silence measured at `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_tick_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// A tick arrived: back to `Healthy`, every counter cleared.
    ///
    /// Returns the state the machine was in before.
    pub fn record_tick(&mut self, at: DateTime<Utc>) -> HealthState {
        let previous = self.state;
        if at > self.last_tick_at {
            self.last_tick_at = at;
        }
        self.consecutive_timeouts = 0;
        self.slow_warning_level = 0;
        self.suspected_holiday = false;
        self.holiday_until = None;
        self.reexpiry_streak = 0;
        self.reexpiry_cooldown = Duration::ZERO;
        self.state = HealthState::Healthy;
        previous
    }

    /// Outcome of a reconnect this machine asked for.
    ///
    /// Success re-arms the silence timer; the timeout counter is left to
    /// the next evaluation.
    pub fn record_reconnect_result(&mut self, now: DateTime<Utc>, succeeded: bool) {
        self.reconnect_in_flight = None;
        if succeeded {
            self.rearm(now);
            self.last_reconnect_ok_at = Some(now);
        }
    }

    /// Restart the silence timer without touching the timeout counter.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        if now > self.last_tick_at {
            self.last_tick_at = now;
        }
        self.slow_warning_level = 0;
    }

    /// The upstream reported an expired session. Returns whether to
    /// reconnect immediately.
    ///
    /// `jitter` in `[-1, 1]` scales ±10 % of the re-expiry cooldown.
    pub fn on_session_expired(&mut self, now: DateTime<Utc>, policy: &MonitorPolicy, jitter: f64) -> bool {
        if self.state == HealthState::HolidaySuspected {
            return false;
        }

        let reexpired = self
            .last_reconnect_ok_at
            .is_some_and(|ok| since(now, ok) < policy.reexpiry_window);
        if reexpired {
            self.reexpiry_streak = self.reexpiry_streak.saturating_add(1);
            self.reexpiry_cooldown = reexpiry_backoff(policy, self.reexpiry_streak, jitter);
        } else {
            self.reexpiry_streak = 0;
            self.reexpiry_cooldown = Duration::ZERO;
        }

        if self.in_flight(now, policy) {
            return false;
        }
        let cooldown = policy.interval.max(self.reexpiry_cooldown);
        if self
            .last_reconnect_at
            .is_some_and(|last| since(now, last) < cooldown)
        {
            return false;
        }

        // Claims the next evaluation cycle's reconnect slot.
        self.mark_reconnect(now, self.cycle + 1);
        true
    }

    /// Run one evaluation cycle.
    pub fn evaluate(&mut self, now: DateTime<Utc>, calendar: &MarketCalendar, policy: &MonitorPolicy) -> Assessment {
        self.cycle += 1;
        let previous = self.state;
        let session = calendar.session_at(now);

        if self.state == HealthState::HolidaySuspected {
            if self.holiday_until.is_none() {
                self.holiday_until = calendar.next_session_open(now);
            }
            match self.holiday_until {
                Some(until) if now >= until => {
                    self.resume(now);
                    return self.assess(previous, now, MonitorAction::Reconnect, Severity::Info, session, Some(Notice::SessionResumed));
                }
                until => {
                    return self.assess(previous, now, MonitorAction::None, Severity::Info, session, Some(Notice::HolidayHold { until }));
                }
            }
        }

        let elapsed = self.elapsed(now);

        if elapsed >= policy.timeout {
            self.slow_warning_level = 0;

            if self.consecutive_timeouts >= policy.max_timeout_retries && session.is_none() {
                let until = calendar.next_session_open(now);
                self.state = HealthState::HolidaySuspected;
                self.suspected_holiday = true;
                self.holiday_until = until;
                return self.assess(previous, now, MonitorAction::Suspend, Severity::Info, session, Some(Notice::HolidaySuspected { until }));
            }

            self.state = HealthState::CriticalTimeout;
            let severity = self.timeout_severity(policy, session.is_some());

            if self.in_flight(now, policy) || !self.cycle_allows_reconnect(policy) {
                return self.assess(previous, now, MonitorAction::None, severity, session, Some(Notice::AwaitingReconnect));
            }

            self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
            self.mark_reconnect(now, self.cycle);
            let attempt = self.consecutive_timeouts;
            let severity = self.timeout_severity(policy, session.is_some());
            return self.assess(previous, now, MonitorAction::Reconnect, severity, session, Some(Notice::Timeout { attempt }));
        }

        let Some(window) = session.as_ref() else {
            // Closed market: silence is expected, counters carry over.
            self.state = HealthState::Healthy;
            return self.assess(previous, now, MonitorAction::None, Severity::Info, session, None);
        };

        let threshold = window.slow_threshold;
        self.current_slow_threshold = threshold;

        if elapsed < threshold {
            self.state = HealthState::Healthy;
            self.consecutive_timeouts = 0;
            self.slow_warning_level = 0;
            let notice = matches!(previous, HealthState::Slow | HealthState::CriticalTimeout)
                .then_some(Notice::Recovered);
            return self.assess(previous, now, MonitorAction::None, Severity::Info, session, notice);
        }

        self.state = HealthState::Slow;
        let next_warning = threshold + policy.slow_escalation_step * self.slow_warning_level;
        if elapsed >= next_warning {
            self.slow_warning_level += 1;
            let level = self.slow_warning_level;
            return self.assess(previous, now, MonitorAction::None, Severity::Warn, session, Some(Notice::SlowWarning { level }));
        }
        self.assess(previous, now, MonitorAction::None, Severity::Warn, session, None)
    }

    fn timeout_severity(&self, policy: &MonitorPolicy, in_session: bool) -> Severity {
        if in_session && self.consecutive_timeouts > policy.max_timeout_retries {
            Severity::Outage
        } else {
            Severity::Error
        }
    }

    fn resume(&mut self, now: DateTime<Utc>) {
        self.last_tick_at = now;
        self.consecutive_timeouts = 0;
        self.slow_warning_level = 0;
        self.suspected_holiday = false;
        self.holiday_until = None;
        self.reexpiry_streak = 0;
        self.reexpiry_cooldown = Duration::ZERO;
        self.state = HealthState::Healthy;
        self.mark_reconnect(now, self.cycle);
    }

    fn mark_reconnect(&mut self, now: DateTime<Utc>, cycle: u64) {
        self.reconnect_cycle = Some(cycle);
        self.last_reconnect_at = Some(now);
        self.reconnect_in_flight = Some(now);
    }

    fn in_flight(&self, now: DateTime<Utc>, policy: &MonitorPolicy) -> bool {
        // A lost result must not wedge the machine: the attempt is bounded anyway.
        self.reconnect_in_flight
            .is_some_and(|started| since(now, started) < policy.reconnect_timeout + policy.interval)
    }

    fn cycle_allows_reconnect(&self, policy: &MonitorPolicy) -> bool {
        let backoff_cycles = cooldown_cycles(policy, self.reexpiry_cooldown);
        self.reconnect_cycle
            .is_none_or(|claimed| self.cycle >= claimed + backoff_cycles)
    }

    fn assess(
        &self,
        previous: HealthState,
        now: DateTime<Utc>,
        action: MonitorAction,
        severity: Severity,
        session: Option<SessionWindow>,
        notice: Option<Notice>,
    ) -> Assessment {
        Assessment {
            previous,
            state: self.state,
            action,
            severity,
            elapsed: self.elapsed(now),
            consecutive_timeouts: self.consecutive_timeouts,
            session,
            notice,
        }
    }
}

fn since(now: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// Interval doubled per re-expiry, capped, with ±10 % jitter.
fn reexpiry_backoff(policy: &MonitorPolicy, streak: u32, jitter: f64) -> Duration {
    let factor = 2u32.saturating_pow(streak.min(16));
    let base = policy.interval.saturating_mul(factor).min(policy.max_reexpiry_backoff);
    let scale = 1.0 + 0.1 * jitter.clamp(-1.0, 1.0);
    base.mul_f64(scale).max(policy.interval)
}

/// Evaluation cycles a cooldown spans (at least one).
fn cooldown_cycles(policy: &MonitorPolicy, cooldown: Duration) -> u64 {
    if policy.interval.is_zero() || cooldown <= policy.interval {
        return 1;
    }
    let cycles = cooldown.as_millis().div_ceil(policy.interval.as_millis());
    u64::try_from(cycles).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::calendar::{SessionKind, SessionSpec};
    use chrono::{TimeDelta, TimeZone};

    fn calendar() -> MarketCalendar {
        let sessions = vec![
            SessionSpec::parse(SessionKind::Day, "08:45", "13:45", Duration::from_secs(60)).unwrap(),
            SessionSpec::parse(SessionKind::Night, "15:00", "05:00", Duration::from_secs(180))
                .unwrap(),
        ];
        MarketCalendar::new(chrono_tz::Asia::Taipei, sessions, [], 1)
    }

    fn policy() -> MonitorPolicy {
        MonitorPolicy {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
            max_timeout_retries: 3,
            slow_escalation_step: Duration::from_secs(60),
            reconnect_timeout: Duration::from_secs(30),
            reexpiry_window: Duration::from_secs(30),
            max_reexpiry_backoff: Duration::from_secs(160),
        }
    }

    /// Monday 2024-03-04, Taipei local time.
    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Taipei
            .with_ymd_and_hms(2024, 3, 4, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    #[test]
    fn test_slow_then_critical_in_session() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(9, 0, 0), Duration::from_secs(60));

        assert_eq!(m.evaluate(at(9, 0, 30), &cal, &p).state, HealthState::Healthy);
        let slow = m.evaluate(at(9, 1, 0), &cal, &p);
        assert_eq!(slow.state, HealthState::Slow);
        assert_eq!(slow.notice, Some(Notice::SlowWarning { level: 1 }));
        assert_eq!(slow.action, MonitorAction::None);

        // No new warning until threshold + one escalation step.
        assert_eq!(m.evaluate(at(9, 1, 30), &cal, &p).notice, None);
        assert_eq!(
            m.evaluate(at(9, 2, 0), &cal, &p).notice,
            Some(Notice::SlowWarning { level: 2 })
        );

        let critical = m.evaluate(at(9, 5, 0), &cal, &p);
        assert_eq!(critical.state, HealthState::CriticalTimeout);
        assert_eq!(critical.action, MonitorAction::Reconnect);
        assert_eq!(critical.notice, Some(Notice::Timeout { attempt: 1 }));
    }

    #[test]
    fn test_tick_resets_everything() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(9, 0, 0), Duration::from_secs(60));
        m.evaluate(at(9, 5, 0), &cal, &p);
        assert_eq!(m.consecutive_timeouts, 1);

        let previous = m.record_tick(at(9, 5, 3));
        assert_eq!(previous, HealthState::CriticalTimeout);
        assert_eq!(m.state(), HealthState::Healthy);
        assert_eq!(m.consecutive_timeouts, 0);
        assert_eq!(m.evaluate(at(9, 5, 10), &cal, &p).state, HealthState::Healthy);
    }

    #[test]
    fn test_in_flight_reconnect_is_not_repeated() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(9, 0, 0), Duration::from_secs(60));
        assert_eq!(m.evaluate(at(9, 5, 0), &cal, &p).action, MonitorAction::Reconnect);
        let waiting = m.evaluate(at(9, 5, 10), &cal, &p);
        assert_eq!(waiting.action, MonitorAction::None);
        assert_eq!(waiting.notice, Some(Notice::AwaitingReconnect));
        assert_eq!(waiting.consecutive_timeouts, 1);

        m.record_reconnect_result(at(9, 5, 15), false);
        assert_eq!(m.evaluate(at(9, 5, 20), &cal, &p).action, MonitorAction::Reconnect);
    }

    #[test]
    fn test_successful_reconnect_rearms_silence() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(9, 0, 0), Duration::from_secs(60));
        m.evaluate(at(9, 5, 0), &cal, &p);
        m.record_reconnect_result(at(9, 5, 2), true);
        let next = m.evaluate(at(9, 5, 10), &cal, &p);
        assert_eq!(next.state, HealthState::Healthy);
        assert_eq!(next.notice, Some(Notice::Recovered));
        assert_eq!(next.elapsed, Duration::from_secs(8));
    }

    #[test]
    fn test_outage_severity_after_budget_in_session() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(10, 0, 0), Duration::from_secs(60));
        let mut now = at(10, 5, 0);
        let mut severities = Vec::new();
        for _ in 0..5 {
            let a = m.evaluate(now, &cal, &p);
            assert_eq!(a.state, HealthState::CriticalTimeout);
            assert_eq!(a.action, MonitorAction::Reconnect);
            severities.push(a.severity);
            m.record_reconnect_result(now + secs(1), false);
            now += secs(10);
        }
        assert_eq!(
            severities,
            vec![Severity::Error, Severity::Error, Severity::Error, Severity::Outage, Severity::Outage]
        );
    }

    #[test]
    fn test_holiday_branch_outside_session() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(13, 50, 0), Duration::from_secs(60));
        let mut now = at(13, 55, 0);
        for attempt in 1..=3 {
            let a = m.evaluate(now, &cal, &p);
            assert_eq!(a.notice, Some(Notice::Timeout { attempt }));
            m.record_reconnect_result(now + secs(1), false);
            now += secs(10);
        }
        let holiday = m.evaluate(now, &cal, &p);
        assert_eq!(holiday.state, HealthState::HolidaySuspected);
        assert_eq!(holiday.action, MonitorAction::Suspend);
        assert_eq!(m.holiday_until(), Some(at(14, 59, 0)));
        assert!(m.suspected_holiday);

        assert_eq!(m.evaluate(at(14, 58, 50), &cal, &p).action, MonitorAction::None);
        let resumed = m.evaluate(at(14, 59, 0), &cal, &p);
        assert_eq!(resumed.state, HealthState::Healthy);
        assert_eq!(resumed.action, MonitorAction::Reconnect);
        assert_eq!(resumed.notice, Some(Notice::SessionResumed));
        assert_eq!(resumed.consecutive_timeouts, 0);
    }

    #[test]
    fn test_session_expiry_respects_cooldown_and_backoff() {
        let cal = calendar();
        let p = policy();
        let mut m = MonitorState::new(at(9, 0, 0), Duration::from_secs(60));

        assert!(m.on_session_expired(at(9, 0, 5), &p, 0.0));
        // Still in flight.
        assert!(!m.on_session_expired(at(9, 0, 6), &p, 0.0));
        m.record_reconnect_result(at(9, 0, 7), true);

        // Expires again within the re-expiry window: cooldown doubles to 20s.
        assert!(!m.on_session_expired(at(9, 0, 12), &p, 0.0));
        // And again: 40s.
        assert!(!m.on_session_expired(at(9, 0, 30), &p, 0.0));

        // Outside the window the streak resets to the plain interval.
        assert!(m.on_session_expired(at(9, 0, 45), &p, 0.0));
        m.record_reconnect_result(at(9, 0, 46), true);
        m.record_tick(at(9, 0, 48));
        assert_eq!(m.evaluate(at(9, 0, 50), &cal, &p).state, HealthState::Healthy);
        assert!(!m.on_session_expired(at(9, 0, 52), &p, 0.0));
    }

    #[test]
    fn test_reexpiry_backoff_is_capped() {
        let p = policy();
        assert_eq!(reexpiry_backoff(&p, 1, 0.0), Duration::from_secs(20));
        assert_eq!(reexpiry_backoff(&p, 10, 0.0), Duration::from_secs(160));
        assert_eq!(reexpiry_backoff(&p, 10, 1.0), Duration::from_secs(176));
        assert_eq!(cooldown_cycles(&p, Duration::from_secs(25)), 3);
        assert_eq!(cooldown_cycles(&p, Duration::ZERO), 1);
    }
}
