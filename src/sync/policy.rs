//! Refresh decisions over the timestamps the stores keep.

use chrono::{DateTime, Duration, Utc};

use crate::cache::{clock, CacheStats};
use crate::config::CacheConfig;

/// True if nothing was ever fetched successfully, or the last success is
/// more than `ttl` old.
pub fn should_refresh(last_success: Option<DateTime<Utc>>, ttl: Duration, now: DateTime<Utc>) -> bool {
  last_success
    .map(|at| clock::is_older_than(at, ttl, now))
    .unwrap_or(true)
}

pub fn cache_stats(
  fetched_at: Option<DateTime<Utc>>,
  ttl: Duration,
  now: DateTime<Utc>,
) -> Option<CacheStats> {
  fetched_at.map(|at| CacheStats::compute(at, ttl, now))
}

/// Which halves of the group store a focus event should refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshPlan {
  pub groups: bool,
  pub invitations: bool,
}

impl RefreshPlan {
  pub fn is_empty(&self) -> bool {
    !self.groups && !self.invitations
  }
}

/// TTLs and limits for the sync engine.
///
/// Invitations get a shorter TTL than groups: a missed invitation is a worse
/// experience than a slightly stale item count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
  pub groups_ttl: Duration,
  pub invitations_ttl: Duration,
  pub subscription_ttl: Duration,
  /// Persisted entries older than this are not used to hydrate
  pub max_cache_age: Duration,
  pub refresh_min_interval: Duration,
  pub fetch_timeout: std::time::Duration,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self::from(&CacheConfig::default())
  }
}

impl From<&CacheConfig> for SyncPolicy {
  fn from(config: &CacheConfig) -> Self {
    Self {
      groups_ttl: Duration::seconds(config.groups_ttl_secs as i64),
      invitations_ttl: Duration::seconds(config.invitations_ttl_secs as i64),
      subscription_ttl: Duration::seconds(config.subscription_ttl_secs as i64),
      max_cache_age: Duration::seconds(config.max_cache_age_secs as i64),
      refresh_min_interval: Duration::milliseconds(config.refresh_min_interval_ms as i64),
      fetch_timeout: std::time::Duration::from_secs(config.fetch_timeout_secs),
    }
  }
}

impl SyncPolicy {
  pub fn should_refresh_groups(&self, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    should_refresh(last_success, self.groups_ttl, now)
  }

  pub fn should_refresh_invitations(
    &self,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) -> bool {
    should_refresh(last_success, self.invitations_ttl, now)
  }

  pub fn should_refresh_subscription(
    &self,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) -> bool {
    should_refresh(last_success, self.subscription_ttl, now)
  }

  /// Whether a persisted entry is recent enough to show on a cold start.
  pub fn is_persisted_usable(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    !clock::is_older_than(stored_at, self.max_cache_age, now)
  }

  /// Decide what a screen-focus event should refresh.
  pub fn on_focus(
    &self,
    groups_synced_at: Option<DateTime<Utc>>,
    invitations_synced_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) -> RefreshPlan {
    RefreshPlan {
      groups: self.should_refresh_groups(groups_synced_at, now),
      invitations: self.should_refresh_invitations(invitations_synced_at, now),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_never_fetched_needs_refresh() {
    let policy = SyncPolicy::default();
    assert!(policy.should_refresh_groups(None, Utc::now()));
    assert!(policy.should_refresh_subscription(None, Utc::now()));
  }

  #[test]
  fn test_invitations_go_stale_first() {
    let policy = SyncPolicy::default();
    let now = Utc::now();
    let synced = Some(now - Duration::minutes(4));

    let plan = policy.on_focus(synced, synced, now);
    assert_eq!(
      plan,
      RefreshPlan {
        groups: false,
        invitations: true
      }
    );

    let plan = policy.on_focus(Some(now), Some(now), now);
    assert!(plan.is_empty());
  }

  #[test]
  fn test_exactly_ttl_old_is_fresh() {
    let now = Utc::now();
    let ttl = Duration::minutes(3);
    assert!(!should_refresh(Some(now - ttl), ttl, now));
    assert!(should_refresh(Some(now - ttl - Duration::seconds(1)), ttl, now));
  }

  #[test]
  fn test_persisted_age_limit() {
    let policy = SyncPolicy::default();
    let now = Utc::now();
    assert!(policy.is_persisted_usable(now - Duration::minutes(29), now));
    assert!(!policy.is_persisted_usable(now - Duration::minutes(31), now));
  }

  #[test]
  fn test_cache_stats() {
    let now = Utc::now();
    assert!(cache_stats(None, Duration::minutes(5), now).is_none());
    let stats = cache_stats(Some(now - Duration::minutes(6)), Duration::minutes(5), now).unwrap();
    assert!(stats.is_stale);
    assert_eq!(stats.age, Duration::minutes(6));
  }

  #[test]
  fn test_defaults_match_config() {
    let policy = SyncPolicy::default();
    assert_eq!(policy.groups_ttl, Duration::minutes(5));
    assert_eq!(policy.invitations_ttl, Duration::minutes(3));
    assert_eq!(policy.subscription_ttl, Duration::minutes(5));
    assert_eq!(policy.refresh_min_interval, Duration::seconds(1));
  }
}
