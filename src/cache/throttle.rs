//! Refresh gate: one run at a time, and at most one run per interval.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::clock::Clock;

#[derive(Debug, Default)]
struct Gate {
  last_run_at: Option<DateTime<Utc>>,
  running: bool,
}

/// Collapses bursts of refresh requests (screen focus, pull-to-refresh,
/// post-mutation refresh) into a single execution per window.
///
/// Requests that hit the gate are dropped, not queued.
pub struct ThrottledRefresher {
  min_interval: Duration,
  clock: Arc<dyn Clock>,
  gate: Arc<Mutex<Gate>>,
}

impl ThrottledRefresher {
  pub fn new(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      min_interval,
      clock,
      gate: Arc::new(Mutex::new(Gate::default())),
    }
  }

  /// Run `action` unless a run is in progress or the last one started less
  /// than `min_interval` ago. Returns `None` when the request was dropped.
  pub async fn attempt<F, Fut, T>(&self, action: F) -> Option<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    {
      let mut gate = self.lock();
      if gate.running {
        debug!("refresh already running, dropping request");
        return None;
      }
      let now = self.clock.now();
      if let Some(last) = gate.last_run_at {
        if now - last < self.min_interval {
          debug!(since_last_ms = (now - last).num_milliseconds(), "refresh throttled");
          return None;
        }
      }
      // Stamp before awaiting so a caller arriving mid-run is also gated.
      gate.running = true;
      gate.last_run_at = Some(now);
    }

    let _running = RunningGuard { gate: &self.gate };
    Some(action().await)
  }

  /// Whether an action is executing right now.
  pub fn is_running(&self) -> bool {
    self.lock().running
  }

  pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
    self.lock().last_run_at
  }

  fn lock(&self) -> MutexGuard<'_, Gate> {
    self.gate.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Clears the running flag when the action settles or its future is dropped.
struct RunningGuard<'a> {
  gate: &'a Mutex<Gate>,
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self
      .gate
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .running = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn refresher() -> (ThrottledRefresher, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (
      ThrottledRefresher::new(Duration::seconds(1), clock.clone()),
      clock,
    )
  }

  #[tokio::test]
  async fn test_second_call_within_interval_is_dropped() {
    let (refresher, clock) = refresher();
    let runs = AtomicUsize::new(0);

    let first = refresher
      .attempt(|| async { runs.fetch_add(1, Ordering::SeqCst) })
      .await;
    let second = refresher
      .attempt(|| async { runs.fetch_add(1, Ordering::SeqCst) })
      .await;

    assert_eq!(first, Some(0));
    assert_eq!(second, None);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    clock.advance(Duration::milliseconds(1000));
    let third = refresher
      .attempt(|| async { runs.fetch_add(1, Ordering::SeqCst) })
      .await;
    assert_eq!(third, Some(1));
  }

  #[tokio::test]
  async fn test_overlapping_call_is_dropped() {
    let (refresher, clock) = refresher();
    let runs = AtomicUsize::new(0);

    let slow = refresher.attempt(|| async {
      tokio::time::sleep(std::time::Duration::from_millis(30)).await;
      runs.fetch_add(1, Ordering::SeqCst);
    });
    let overlapping = async {
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      // Past the interval, but the first run is still going.
      clock.advance(Duration::seconds(5));
      assert!(refresher.is_running());
      refresher
        .attempt(|| async {
          runs.fetch_add(1, Ordering::SeqCst);
        })
        .await
    };

    let (first, second) = tokio::join!(slow, overlapping);
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!refresher.is_running());
  }

  #[tokio::test]
  async fn test_running_flag_cleared_when_future_dropped() {
    let (refresher, _clock) = refresher();

    let attempt = refresher.attempt(|| std::future::pending::<()>());
    let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), attempt).await;

    assert!(timed_out.is_err());
    assert!(!refresher.is_running());
    assert!(refresher.last_run_at().is_some());
  }
}
