//! Time source for TTL decisions.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for every staleness decision in the crate.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Used to drive TTL expiry in tests
/// and in embedding applications that replay recorded sessions.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Whether more than `ttl` has passed between `then` and `now`. An entry
/// exactly `ttl` old is still fresh.
///
/// Timestamps in the future (clock skew after a restore) count as fresh.
pub fn is_older_than(then: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
  now - then > ttl
}

/// Age of `then` relative to `now`, clamped at zero.
pub fn age(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  (now - then).max(Duration::zero())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_older_than_boundaries() {
    let now = Utc::now();
    let ttl = Duration::minutes(5);

    assert!(!is_older_than(now - Duration::minutes(2), ttl, now));
    assert!(!is_older_than(now - Duration::minutes(5), ttl, now));
    assert!(is_older_than(now - Duration::minutes(5) - Duration::seconds(1), ttl, now));
    assert!(is_older_than(now - Duration::minutes(6), ttl, now));
    assert!(!is_older_than(now + Duration::minutes(1), ttl, now));
  }

  #[test]
  fn test_manual_clock_advances() {
    let start = Utc::now();
    let clock = ManualClock::new(start);
    clock.advance(Duration::seconds(90));
    assert_eq!(clock.now(), start + Duration::seconds(90));
    assert_eq!(age(start, clock.now()), Duration::seconds(90));
    assert_eq!(age(clock.now(), start), Duration::zero());
  }
}
