//! Everything cached for one signed-in user.

use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStorage, Clock};
use crate::error::SyncResult;

use super::backend::{GroupBackend, SubscriptionBackend};
use super::policy::SyncPolicy;
use super::store::EntityStore;
use super::subscription::{SubscriptionSnapshotCache, SubscriptionView};

/// Owns the group store and subscription cache for a single user.
///
/// Switching accounts means closing the session and starting a new one,
/// so no cached state can leak from one user to the next.
pub struct Session<B, S> {
  user_id: String,
  groups: EntityStore<B, S>,
  subscriptions: SubscriptionSnapshotCache<B>,
}

impl<B, S> Session<B, S>
where
  B: GroupBackend + SubscriptionBackend,
  S: CacheStorage + 'static,
{
  pub fn start(
    user_id: impl Into<String>,
    backend: Arc<B>,
    storage: Arc<S>,
    policy: SyncPolicy,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let user_id = user_id.into();
    info!(user_id = %user_id, "session started");
    Self {
      groups: EntityStore::new(
        user_id.clone(),
        backend.clone(),
        storage,
        policy,
        clock.clone(),
      ),
      subscriptions: SubscriptionSnapshotCache::new(backend, &policy, clock),
      user_id,
    }
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  pub fn groups(&self) -> &EntityStore<B, S> {
    &self.groups
  }

  pub fn subscriptions(&self) -> &SubscriptionSnapshotCache<B> {
    &self.subscriptions
  }

  /// The signed-in user's subscription view.
  pub async fn subscription(&self) -> SubscriptionView {
    self.subscriptions.get(&self.user_id).await
  }

  /// Load groups, invitations and the subscription snapshot together.
  /// Returns the group load result; a subscription failure is reported on
  /// its view.
  pub async fn warm_up(&self) -> SyncResult<SubscriptionView> {
    let (groups, subscription) = tokio::join!(self.groups.load(false), self.subscription());
    groups.map(|()| subscription)
  }

  /// End the session. With `purge_persisted` the user's persisted entry is
  /// removed too (sign-out); otherwise it stays to speed up the next start.
  pub fn close(self, purge_persisted: bool) {
    if purge_persisted {
      self.groups.clear();
    } else {
      self.groups.forget();
    }
    self.subscriptions.clear();
    info!(user_id = %self.user_id, purge_persisted, "session closed");
  }
}
