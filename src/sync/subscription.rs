//! Per-user entitlement snapshots.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{Clock, KeyedAsyncCache, Lookup, Peek, ThrottledRefresher};
use crate::error::{SyncError, SyncResult};

use super::backend::{bounded, SubscriptionBackend};
use super::policy::SyncPolicy;
use super::types::{LimitUsage, SubscriptionInfo, SubscriptionStatus, Validate};

/// Changes a user can make to their own subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
  ActivateTrial,
  UpgradeToPro { expires_at: DateTime<Utc> },
}

/// What the UI sees for one user.
///
/// Derived flags are computed from the snapshot on every call and fall back
/// to the free tier when there is no snapshot yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionView {
  pub info: Option<SubscriptionInfo>,
  /// A fetch is in flight
  pub loading: bool,
  pub error: Option<SyncError>,
}

impl SubscriptionView {
  fn from_lookup(lookup: Lookup<SubscriptionInfo>) -> Self {
    Self {
      info: lookup.value,
      loading: false,
      error: lookup.error,
    }
  }

  fn from_peek(peek: Peek<SubscriptionInfo>) -> Self {
    Self {
      info: peek.value,
      loading: peek.in_flight,
      error: peek.error,
    }
  }

  /// The snapshot, or free-tier defaults.
  pub fn effective(&self) -> SubscriptionInfo {
    self
      .info
      .clone()
      .unwrap_or_else(SubscriptionInfo::free_defaults)
  }

  pub fn status(&self) -> SubscriptionStatus {
    self.effective().status
  }

  pub fn is_free(&self) -> bool {
    self.effective().is_free()
  }

  pub fn is_trial(&self) -> bool {
    self.effective().is_trial()
  }

  pub fn is_pro(&self) -> bool {
    self.effective().is_pro()
  }

  pub fn is_expired(&self) -> bool {
    self.effective().is_expired()
  }

  pub fn can_create_group(&self) -> bool {
    self.effective().can_create_group
  }

  pub fn can_create_item(&self) -> bool {
    self.effective().can_create_item
  }

  pub fn can_use_ai(&self) -> bool {
    self.effective().can_use_ai
  }

  pub fn groups_percentage(&self) -> f64 {
    self.effective().groups_percentage()
  }

  pub fn items_percentage(&self) -> f64 {
    self.effective().items_percentage()
  }

  pub fn approaching_limits(&self) -> Option<LimitUsage> {
    self.effective().approaching_limits()
  }
}

/// Subscription snapshots keyed by user id.
pub struct SubscriptionSnapshotCache<B> {
  backend: Arc<B>,
  cache: KeyedAsyncCache<String, SubscriptionInfo>,
  clock: Arc<dyn Clock>,
  ttl: Duration,
  min_refresh_interval: Duration,
  fetch_timeout: std::time::Duration,
  refreshers: Mutex<HashMap<String, Arc<ThrottledRefresher>>>,
}

impl<B: SubscriptionBackend> SubscriptionSnapshotCache<B> {
  pub fn new(backend: Arc<B>, policy: &SyncPolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      backend,
      cache: KeyedAsyncCache::new(clock.clone()).with_fetch_timeout(policy.fetch_timeout),
      clock,
      ttl: policy.subscription_ttl,
      min_refresh_interval: policy.refresh_min_interval,
      fetch_timeout: policy.fetch_timeout,
      refreshers: Mutex::new(HashMap::new()),
    }
  }

  /// Snapshot for `user_id`, fetched if missing or older than the TTL.
  pub async fn get(&self, user_id: &str) -> SubscriptionView {
    let lookup = self
      .cache
      .get(user_id.to_string(), self.fetcher(), self.ttl, false)
      .await;
    SubscriptionView::from_lookup(lookup)
  }

  /// Current view without any I/O.
  pub fn peek(&self, user_id: &str) -> SubscriptionView {
    SubscriptionView::from_peek(self.cache.peek(&user_id.to_string()))
  }

  /// Refetch `user_id`'s snapshot, at most once per refresh interval. A
  /// throttled call returns the current view.
  pub async fn refresh(&self, user_id: &str) -> SubscriptionView {
    let refresher = self.refresher(user_id);
    let refreshed = refresher
      .attempt(|| async {
        self.cache.invalidate(&user_id.to_string());
        self.get(user_id).await
      })
      .await;
    match refreshed {
      Some(view) => view,
      None => {
        debug!(user_id, "subscription refresh throttled");
        self.peek(user_id)
      }
    }
  }

  /// Apply `action` on the backend, then return a snapshot fetched after it
  /// took effect.
  pub async fn mutate(&self, user_id: &str, action: SubscriptionAction) -> SyncResult<SubscriptionView> {
    let call = async {
      match action {
        SubscriptionAction::ActivateTrial => self.backend.activate_trial(user_id).await,
        SubscriptionAction::UpgradeToPro { expires_at } => {
          self.backend.upgrade_to_pro(user_id, expires_at).await
        }
      }
    };
    bounded(self.fetch_timeout, call)
      .await
      .inspect_err(|e| warn!(user_id, ?action, error = %e, "subscription change failed"))?;
    info!(user_id, ?action, "subscription changed");

    let key = user_id.to_string();
    self.cache.invalidate(&key);
    let lookup = self.cache.refetch(key, self.fetcher()).await;
    Ok(SubscriptionView::from_lookup(lookup))
  }

  /// Drop `user_id`'s snapshot so the next read fetches.
  pub fn invalidate(&self, user_id: &str) {
    self.cache.invalidate(&user_id.to_string());
  }

  /// Whether `user_id`'s snapshot is missing or past the TTL.
  pub fn is_stale(&self, user_id: &str) -> bool {
    self
      .cache
      .stats(&user_id.to_string(), self.ttl)
      .map(|stats| stats.is_stale)
      .unwrap_or(true)
  }

  pub fn clear(&self) {
    self.cache.clear();
    self
      .refreshers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }

  fn refresher(&self, user_id: &str) -> Arc<ThrottledRefresher> {
    let mut refreshers = self.refreshers.lock().unwrap_or_else(PoisonError::into_inner);
    refreshers
      .entry(user_id.to_string())
      .or_insert_with(|| {
        Arc::new(ThrottledRefresher::new(
          self.min_refresh_interval,
          self.clock.clone(),
        ))
      })
      .clone()
  }

  fn fetcher(&self) -> impl FnOnce(String) -> BoxFuture<'static, SyncResult<SubscriptionInfo>> {
    let backend = Arc::clone(&self.backend);
    move |user_id| {
      async move {
        let info = backend.fetch_subscription_info(&user_id).await?;
        info.validate().map(|()| info)
      }
      .boxed()
    }
  }
}
