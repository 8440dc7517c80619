//! Clock Port - Wall-clock time source.
//!
//! The monitor and calendar never read time directly, so tests can
//! drive them through a manual clock.

use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

/// Source of the current UTC time.
pub trait Clock: Send + Sync + 'static {
  /// Current instant.
  fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  /// Clock frozen at `start`.
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move forward by `delta`.
  pub fn advance(&self, delta: TimeDelta) {
    let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    *now += delta;
  }

  /// Jump to `at`.
  pub fn set(&self, at: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = at;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_manual_clock_moves_only_on_demand() {
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);
    clock.advance(TimeDelta::seconds(90));
    assert_eq!(clock.now(), start + TimeDelta::seconds(90));
    clock.set(start);
    assert_eq!(clock.now(), start);
  }
}
