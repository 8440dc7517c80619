//! Market calendar - wall-clock time to trading-session state.
//!
//! Pure and deterministic: the same instant always yields the same answer.
//! The session table and holiday list are data supplied by configuration,
//! never inlined here.
//!
//! Rules:
//! - A session belongs to a trading date: a weekday that is not a holiday.
//! - A session whose close is not after its open runs past midnight.
//! - An overnight session only runs if the next calendar day is not a
//!   holiday, so a holiday is closed from midnight to midnight.
//! - Every window is widened by `buffer_minutes` on both ends.
//! - Any lookup failure fails safe to "no session".

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::errors::CalendarError;

/// How far ahead `next_session_open` searches, in calendar days.
const LOOKAHEAD_DAYS: u64 = 14;

/// Kind of trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Regular daytime session.
    Day,
    /// After-hours session, usually crossing midnight.
    Night,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Night => write!(f, "night"),
        }
    }
}

/// One row of the exchange session table, in exchange-local clock times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    /// Session kind.
    pub kind: SessionKind,
    /// Local opening time.
    pub open: NaiveTime,
    /// Local closing time; `<= open` means the next calendar day.
    pub close: NaiveTime,
    /// Silence tolerated inside this session before warning.
    pub slow_threshold: Duration,
}

impl SessionSpec {
    /// Build a row from `HH:MM` strings.
    pub fn parse(
        kind: SessionKind,
        open: &str,
        close: &str,
        slow_threshold: Duration,
    ) -> Result<Self, CalendarError> {
        Ok(Self {
            kind,
            open: parse_clock(open)?,
            close: parse_clock(close)?,
            slow_threshold,
        })
    }

    /// Whether the session closes on the following calendar day.
    pub fn is_overnight(&self) -> bool {
        self.close <= self.open
    }
}

fn parse_clock(text: &str) -> Result<NaiveTime, CalendarError> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|_| CalendarError::InvalidTimeOfDay(text.to_string()))
}

/// One concrete trading session on one trading date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWindow {
    /// Session kind.
    pub kind: SessionKind,
    /// Trading date the session belongs to (the date it opens on).
    pub trading_date: NaiveDate,
    /// Scheduled open, unbuffered.
    pub open: DateTime<Utc>,
    /// Scheduled close, unbuffered.
    pub close: DateTime<Utc>,
    /// Pre-open / post-close tolerance in minutes.
    pub buffer_minutes: u32,
    /// Silence tolerated before warning.
    pub slow_threshold: Duration,
}

impl SessionWindow {
    fn buffer(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.buffer_minutes))
    }

    /// Open minus buffer.
    pub fn buffered_open(&self) -> DateTime<Utc> {
        self.open - self.buffer()
    }

    /// Close plus buffer.
    pub fn buffered_close(&self) -> DateTime<Utc> {
        self.close + self.buffer()
    }

    /// Whether `now` falls inside the buffered window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.buffered_open() <= now && now < self.buffered_close()
    }
}

/// Exchange calendar: time zone, session table, holidays, buffer.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    sessions: Vec<SessionSpec>,
    holidays: BTreeSet<NaiveDate>,
    buffer_minutes: u32,
}

impl MarketCalendar {
    /// Create a calendar from already-parsed parts.
    pub fn new(
        tz: Tz,
        sessions: Vec<SessionSpec>,
        holidays: impl IntoIterator<Item = NaiveDate>,
        buffer_minutes: u32,
    ) -> Self {
        Self {
            tz,
            sessions,
            holidays: holidays.into_iter().collect(),
            buffer_minutes,
        }
    }

    /// Resolve a tz database name such as `Asia/Taipei`.
    pub fn parse_timezone(name: &str) -> Result<Tz, CalendarError> {
        Tz::from_str(name).map_err(|_| CalendarError::UnknownTimezone(name.to_string()))
    }

    /// Parse `YYYY-MM-DD` holiday entries.
    pub fn parse_holidays(entries: &[String]) -> Result<Vec<NaiveDate>, CalendarError> {
        entries
            .iter()
            .map(|s| {
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|_| CalendarError::InvalidHoliday(s.clone()))
            })
            .collect()
    }

    /// Exchange time zone.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Whether `date` can carry sessions at all.
    pub fn is_trading_date(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// The session active at `now` (buffer included), or `None` when closed.
    pub fn session_at(&self, now: DateTime<Utc>) -> Option<SessionWindow> {
        match self.try_session_at(now) {
            Ok(window) => window,
            Err(e) => {
                warn!(error = %e, now = %now, "Calendar lookup failed, treating market as closed");
                None
            }
        }
    }

    /// Whether any session is active at `now`.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.session_at(now).is_some()
    }

    /// Fallible form of [`MarketCalendar::session_at`].
    pub fn try_session_at(&self, now: DateTime<Utc>) -> Result<Option<SessionWindow>, CalendarError> {
        let today = now.with_timezone(&self.tz).date_naive();
        for date in [today.pred_opt(), Some(today), today.succ_opt()].into_iter().flatten() {
            if let Some(window) = self
                .windows_for_date(date)?
                .into_iter()
                .find(|w| w.contains(now))
            {
                return Ok(Some(window));
            }
        }
        Ok(None)
    }

    /// Earliest buffered open strictly after `now`, within two weeks.
    pub fn next_session_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = now.with_timezone(&self.tz).date_naive().pred_opt()?;
        (0..=LOOKAHEAD_DAYS)
            .filter_map(|offset| start.checked_add_days(Days::new(offset)))
            .filter_map(|date| self.windows_for_date(date).ok())
            .flatten()
            .map(|w| w.buffered_open())
            .filter(|open| *open > now)
            .min()
    }

    /// All sessions that open on `date`, sorted by open time.
    pub fn windows_for_date(&self, date: NaiveDate) -> Result<Vec<SessionWindow>, CalendarError> {
        if !self.is_trading_date(date) {
            return Ok(Vec::new());
        }

        let mut windows = Vec::with_capacity(self.sessions.len());
        for spec in &self.sessions {
            let close_date = if spec.is_overnight() {
                let Some(next) = date.succ_opt() else { continue };
                if self.holidays.contains(&next) {
                    continue;
                }
                next
            } else {
                date
            };

            windows.push(SessionWindow {
                kind: spec.kind,
                trading_date: date,
                open: self.resolve(date, spec.open)?,
                close: self.resolve(close_date, spec.close)?,
                buffer_minutes: self.buffer_minutes,
                slow_threshold: spec.slow_threshold,
            });
        }
        windows.sort_by_key(|w| w.open);
        Ok(windows)
    }

    fn resolve(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, CalendarError> {
        let local = date.and_time(time);
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(CalendarError::NonexistentLocalTime(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taifex() -> MarketCalendar {
        let sessions = vec![
            SessionSpec::parse(SessionKind::Day, "08:45", "13:45", Duration::from_secs(60)).unwrap(),
            SessionSpec::parse(SessionKind::Night, "15:00", "05:00", Duration::from_secs(180))
                .unwrap(),
        ];
        let holidays = MarketCalendar::parse_holidays(&["2024-02-28".to_string()]).unwrap();
        MarketCalendar::new(chrono_tz::Asia::Taipei, sessions, holidays, 1)
    }

    /// Taipei local time to UTC (fixed +08:00).
    fn tpe(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Taipei
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_day_session_mid_morning() {
        // 2024-03-04 is a Monday.
        let window = taifex().session_at(tpe(2024, 3, 4, 10, 0)).unwrap();
        assert_eq!(window.kind, SessionKind::Day);
        assert_eq!(window.slow_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_buffer_extends_both_edges() {
        let cal = taifex();
        assert!(cal.session_at(tpe(2024, 3, 5, 8, 44)).is_some());
        assert!(cal.session_at(tpe(2024, 3, 5, 8, 43)).is_none());
        assert!(cal.session_at(tpe(2024, 3, 5, 13, 45)).is_some());
        assert!(cal.session_at(tpe(2024, 3, 5, 13, 46)).is_none());
    }

    #[test]
    fn test_night_session_crosses_midnight() {
        let window = taifex().session_at(tpe(2024, 3, 5, 2, 0)).unwrap();
        assert_eq!(window.kind, SessionKind::Night);
        assert_eq!(window.trading_date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn test_weekend_rules() {
        let cal = taifex();
        // Friday night runs into Saturday morning.
        assert!(cal.session_at(tpe(2024, 3, 9, 3, 0)).is_some());
        assert!(cal.session_at(tpe(2024, 3, 9, 6, 0)).is_none());
        assert!(cal.session_at(tpe(2024, 3, 10, 10, 0)).is_none());
        // Monday before the day open.
        assert!(cal.session_at(tpe(2024, 3, 11, 2, 0)).is_none());
    }

    #[test]
    fn test_holiday_is_closed_midnight_to_midnight() {
        let cal = taifex();
        assert!(cal.session_at(tpe(2024, 2, 28, 10, 0)).is_none());
        assert!(cal.session_at(tpe(2024, 2, 28, 2, 0)).is_none());
        assert!(cal.session_at(tpe(2024, 2, 27, 20, 0)).is_none());
        assert!(cal.session_at(tpe(2024, 2, 27, 10, 0)).is_some());
    }

    #[test]
    fn test_next_session_open_between_sessions() {
        let cal = taifex();
        assert_eq!(cal.next_session_open(tpe(2024, 3, 4, 13, 50)), Some(tpe(2024, 3, 4, 14, 59)));
        // Saturday morning: next open is Monday's day session.
        assert_eq!(cal.next_session_open(tpe(2024, 3, 9, 6, 0)), Some(tpe(2024, 3, 11, 8, 44)));
    }

    #[test]
    fn test_next_session_open_skips_holiday() {
        let cal = taifex();
        assert_eq!(cal.next_session_open(tpe(2024, 2, 27, 14, 0)), Some(tpe(2024, 2, 29, 8, 44)));
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        assert_eq!(
            MarketCalendar::parse_timezone("Mars/Olympus"),
            Err(CalendarError::UnknownTimezone("Mars/Olympus".to_string()))
        );
        assert!(MarketCalendar::parse_holidays(&["2024-13-01".to_string()]).is_err());
        assert!(SessionSpec::parse(SessionKind::Day, "8h45", "13:45", Duration::ZERO).is_err());
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let cal = taifex();
        let now = tpe(2024, 3, 6, 23, 30);
        assert_eq!(cal.session_at(now), cal.session_at(now));
        assert_eq!(cal.next_session_open(now), cal.next_session_open(now));
    }
}
