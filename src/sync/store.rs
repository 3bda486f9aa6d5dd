//! Groups and pending invitations for one user.
//!
//! Reads go through two [`KeyedAsyncCache`]s (one per collection). Local
//! mutations are applied optimistically and journaled, so a fetch that was
//! already in flight when they happened cannot roll them back.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheStats, CacheStorage, Clock, KeyedAsyncCache, Lookup, Stored, ThrottledRefresher,
};
use crate::error::{SyncError, SyncResult};

use super::backend::{bounded, GroupBackend};
use super::diff::{has_changed, Entity, Journal, Mutation};
use super::policy::{self, RefreshPlan, SyncPolicy};
use super::types::{CreateGroup, Group, GroupInvitation, InvitationResponse, Validate};

/// Persisted-cache key for a user's groups and invitations.
pub fn persist_key(user_id: &str) -> String {
  format!("groups:{}", user_id)
}

/// What is written to the persisted cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedLists {
  pub groups: Vec<Group>,
  pub invitations: Vec<GroupInvitation>,
}

/// Snapshot handed to the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
  pub groups: Vec<Group>,
  pub invitations: Vec<GroupInvitation>,
  /// A load is in progress
  pub loading: bool,
  /// Last fetch error, groups first
  pub error: Option<SyncError>,
  /// Bumped on every change to the lists
  pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
  /// Dropped by the refresh throttle
  Throttled,
  /// Nothing was stale
  UpToDate,
  Refreshed(RefreshPlan),
}

/// Where the store stood when a fetch began.
#[derive(Debug, Clone, Copy)]
struct FetchTag {
  /// Journal mark of the fetched collection
  mark: u64,
  epoch: u64,
  /// Increases with every fetch started, across both collections
  id: u64,
}

/// A fetched list, tagged with where the store stood when the fetch began.
#[derive(Debug, Clone)]
struct Fetched<T> {
  items: Vec<T>,
  tag: FetchTag,
}

impl<T: Validate> Fetched<T> {
  fn checked(items: Vec<T>, tag: FetchTag) -> SyncResult<Self> {
    items.validate()?;
    Ok(Self { items, tag })
  }
}

#[derive(Debug)]
struct Collection<T> {
  items: Vec<T>,
  journal: Journal<T>,
  error: Option<SyncError>,
  /// Last successful fetch
  synced_at: Option<DateTime<Utc>>,
  /// Id of the fetch `items` were last rebased onto
  committed: Option<u64>,
}

impl<T> Default for Collection<T> {
  fn default() -> Self {
    Self {
      items: Vec::new(),
      journal: Journal::default(),
      error: None,
      synced_at: None,
      committed: None,
    }
  }
}

impl<T: Entity> Collection<T> {
  fn record(&mut self, mutation: Mutation<T>) {
    self.journal.record(mutation, &mut self.items);
  }
}

#[derive(Debug, Default)]
struct Inner {
  groups: Collection<Group>,
  invitations: Collection<GroupInvitation>,
  loads_in_flight: usize,
  revision: u64,
  /// Bumped by `clear`; fetches started under an older epoch are dropped
  epoch: u64,
  fetches: u64,
}

impl Inner {
  fn groups(&mut self) -> &mut Collection<Group> {
    &mut self.groups
  }

  fn invitations(&mut self) -> &mut Collection<GroupInvitation> {
    &mut self.invitations
  }

  fn snapshot(&self) -> StoreState {
    StoreState {
      groups: self.groups.items.clone(),
      invitations: self.invitations.items.clone(),
      loading: self.loads_in_flight > 0,
      error: self
        .groups
        .error
        .clone()
        .or_else(|| self.invitations.error.clone()),
      revision: self.revision,
    }
  }

  fn persisted(&self) -> PersistedLists {
    PersistedLists {
      groups: self.groups.items.clone(),
      invitations: self.invitations.items.clone(),
    }
  }

  fn begin_fetch(&mut self, mark: u64) -> FetchTag {
    self.fetches += 1;
    FetchTag {
      mark,
      epoch: self.epoch,
      id: self.fetches,
    }
  }
}

type Select<T> = fn(&mut Inner) -> &mut Collection<T>;

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
  inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct EntityStore<B, S> {
  user_id: String,
  backend: Arc<B>,
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  policy: SyncPolicy,
  groups_cache: KeyedAsyncCache<String, Fetched<Group>>,
  invitations_cache: KeyedAsyncCache<String, Fetched<GroupInvitation>>,
  refresher: ThrottledRefresher,
  inner: Arc<Mutex<Inner>>,
  /// Revision of the last snapshot written to storage
  persisted_revision: Arc<Mutex<u64>>,
  state_tx: watch::Sender<StoreState>,
}

impl<B: GroupBackend, S: CacheStorage + 'static> EntityStore<B, S> {
  pub fn new(
    user_id: impl Into<String>,
    backend: Arc<B>,
    storage: Arc<S>,
    policy: SyncPolicy,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (state_tx, _) = watch::channel(StoreState::default());
    Self {
      user_id: user_id.into(),
      backend,
      storage,
      groups_cache: KeyedAsyncCache::new(clock.clone()).with_fetch_timeout(policy.fetch_timeout),
      invitations_cache: KeyedAsyncCache::new(clock.clone())
        .with_fetch_timeout(policy.fetch_timeout),
      refresher: ThrottledRefresher::new(policy.refresh_min_interval, clock.clone()),
      clock,
      policy,
      inner: Arc::new(Mutex::new(Inner::default())),
      persisted_revision: Arc::new(Mutex::new(0)),
      state_tx,
    }
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// Current snapshot.
  pub fn state(&self) -> StoreState {
    self.state_tx.borrow().clone()
  }

  /// Receive a new snapshot on every state change.
  pub fn subscribe(&self) -> watch::Receiver<StoreState> {
    self.state_tx.subscribe()
  }

  /// Load both collections.
  ///
  /// Unless forced, an empty store is first hydrated from the persisted
  /// cache so something can be shown while the fetches run.
  pub async fn load(&self, force: bool) -> SyncResult<()> {
    if !force {
      self.hydrate();
    }
    let (groups, invitations) = tokio::join!(self.load_groups(force), self.load_invitations(force));
    groups.and(invitations)
  }

  pub async fn load_groups(&self, force: bool) -> SyncResult<()> {
    let _loading = self.begin_load();
    let lookup = self
      .groups_cache
      .get(
        self.user_id.clone(),
        self.groups_fetcher(),
        self.policy.groups_ttl,
        force,
      )
      .await;
    self.settle(Inner::groups, lookup).await
  }

  pub async fn load_invitations(&self, force: bool) -> SyncResult<()> {
    let _loading = self.begin_load();
    let lookup = self
      .invitations_cache
      .get(
        self.user_id.clone(),
        self.invitations_fetcher(),
        self.policy.invitations_ttl,
        force,
      )
      .await;
    self.settle(Inner::invitations, lookup).await
  }

  /// Create a group and prepend it.
  pub async fn create(&self, data: CreateGroup) -> SyncResult<Group> {
    data.validate()?;
    let group = bounded(self.policy.fetch_timeout, self.backend.create_group(&data))
      .await
      .inspect_err(|e| warn!(user_id = %self.user_id, error = %e, "create group failed"))?;
    group.validate()?;

    self
      .apply(|inner| inner.groups.record(Mutation::Prepend(group.clone())))
      .await;
    info!(user_id = %self.user_id, group_id = %group.id, "group created");
    Ok(group)
  }

  /// Delete a group and drop it from the list.
  pub async fn delete(&self, group_id: &str) -> SyncResult<()> {
    bounded(self.policy.fetch_timeout, self.backend.delete_group(group_id))
      .await
      .inspect_err(|e| {
        warn!(user_id = %self.user_id, group_id, error = %e, "delete group failed")
      })?;

    self
      .apply(|inner| inner.groups.record(Mutation::Remove(group_id.to_string())))
      .await;
    info!(user_id = %self.user_id, group_id, "group deleted");
    Ok(())
  }

  /// Answer an invitation. The invitation leaves the list and, when
  /// accepted, the joined group is prepended in the same transition.
  ///
  /// Returns the joined group, if the backend sent one.
  pub async fn respond_to_invitation(
    &self,
    invitation_id: &str,
    response: InvitationResponse,
  ) -> SyncResult<Option<Group>> {
    let outcome = bounded(
      self.policy.fetch_timeout,
      self.backend.respond_invitation(invitation_id, response),
    )
    .await
    .inspect_err(|e| {
      warn!(user_id = %self.user_id, invitation_id, error = %e, "invitation response failed")
    })?;

    let mut rejected = None;
    let joined = match (response, outcome.group) {
      (InvitationResponse::Accept, Some(group)) => match group.validate() {
        Ok(()) => Some(group),
        Err(e) => {
          warn!(invitation_id, error = %e, "accepted invitation returned an invalid group");
          rejected = Some(e);
          None
        }
      },
      (InvitationResponse::Accept, None) => {
        warn!(invitation_id, "accepted invitation returned no group");
        None
      }
      (InvitationResponse::Decline, _) => None,
    };

    self.apply(|inner| {
      inner
        .invitations
        .record(Mutation::Remove(invitation_id.to_string()));
      if let Some(group) = &joined {
        inner.groups.record(Mutation::Prepend(group.clone()));
      }
    })
    .await;
    info!(user_id = %self.user_id, invitation_id, ?response, "invitation answered");

    match rejected {
      Some(e) => Err(e),
      None => Ok(joined),
    }
  }

  /// No successful groups fetch yet, or the last one is past the groups TTL.
  pub fn should_refresh(&self) -> bool {
    let synced_at = lock(&self.inner).groups.synced_at;
    self.policy.should_refresh_groups(synced_at, self.clock.now())
  }

  pub fn should_refresh_invitations(&self) -> bool {
    let synced_at = lock(&self.inner).invitations.synced_at;
    self
      .policy
      .should_refresh_invitations(synced_at, self.clock.now())
  }

  /// Refresh whichever collections are stale, at most once per refresh
  /// interval.
  pub async fn refresh(&self) -> SyncResult<RefreshOutcome> {
    let outcome = self
      .refresher
      .attempt(|| async {
        let plan = {
          let inner = lock(&self.inner);
          self.policy.on_focus(
            inner.groups.synced_at,
            inner.invitations.synced_at,
            self.clock.now(),
          )
        };
        if plan.is_empty() {
          debug!(user_id = %self.user_id, "refresh skipped, everything fresh");
          return Ok(RefreshOutcome::UpToDate);
        }

        let groups = async {
          if plan.groups {
            self.load_groups(false).await
          } else {
            Ok(())
          }
        };
        let invitations = async {
          if plan.invitations {
            self.load_invitations(false).await
          } else {
            Ok(())
          }
        };
        let (groups, invitations) = tokio::join!(groups, invitations);
        groups
          .and(invitations)
          .map(|()| RefreshOutcome::Refreshed(plan))
      })
      .await;

    outcome.unwrap_or(Ok(RefreshOutcome::Throttled))
  }

  /// Drop the persisted copy and refetch everything.
  pub async fn force_refresh(&self) -> SyncResult<()> {
    self.remove_persisted(0);
    self.load(true).await
  }

  /// Age and staleness of the groups list.
  pub fn cache_stats(&self) -> Option<CacheStats> {
    let synced_at = lock(&self.inner).groups.synced_at;
    policy::cache_stats(synced_at, self.policy.groups_ttl, self.clock.now())
  }

  /// Forget everything for this user, in memory and on disk.
  pub fn clear(&self) {
    let revision = self.reset();
    self.remove_persisted(revision);
  }

  /// Drop in-memory state and cache entries, keeping the persisted copy.
  /// Fetches still in flight are discarded when they land.
  pub fn forget(&self) {
    self.reset();
  }

  fn reset(&self) -> u64 {
    self.groups_cache.clear();
    self.invitations_cache.clear();
    let revision = {
      let mut inner = lock(&self.inner);
      *inner = Inner {
        loads_in_flight: inner.loads_in_flight,
        revision: inner.revision + 1,
        epoch: inner.epoch + 1,
        fetches: inner.fetches,
        ..Inner::default()
      };
      self.state_tx.send_replace(inner.snapshot());
      inner.revision
    };
    debug!(user_id = %self.user_id, "group store cleared");
    revision
  }

  /// Remove the persisted copy. Snapshots taken at or before `revision`
  /// are not written afterwards.
  fn remove_persisted(&self, revision: u64) {
    let mut persisted = self
      .persisted_revision
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *persisted = (*persisted).max(revision);
    if let Err(e) = self.storage.clear(&persist_key(&self.user_id)) {
      warn!(user_id = %self.user_id, error = %e, "failed to clear persisted groups");
    }
  }

  fn hydrate(&self) {
    if !lock(&self.inner).groups.items.is_empty() {
      return;
    }
    let key = persist_key(&self.user_id);
    let stored = match self.storage.read::<PersistedLists>(&key) {
      Ok(Some(stored)) => stored,
      Ok(None) => return,
      Err(e) => {
        warn!(key = %key, error = %e, "failed to read persisted groups");
        return;
      }
    };
    if !self
      .policy
      .is_persisted_usable(stored.stored_at, self.clock.now())
    {
      debug!(key = %key, stored_at = %stored.stored_at, "persisted groups too old, ignoring");
      return;
    }
    if stored.value.groups.is_empty() {
      return;
    }

    let mut inner = lock(&self.inner);
    // A fetch may have landed while the entry was being read.
    if !inner.groups.items.is_empty() {
      return;
    }
    inner.groups.items = stored.value.groups;
    inner.invitations.items = stored.value.invitations;
    inner.revision += 1;
    debug!(
      key = %key,
      groups = inner.groups.items.len(),
      invitations = inner.invitations.items.len(),
      "hydrated from persisted cache"
    );
    self.state_tx.send_replace(inner.snapshot());
  }

  fn groups_fetcher(&self) -> impl FnOnce(String) -> BoxFuture<'static, SyncResult<Fetched<Group>>> {
    let backend = Arc::clone(&self.backend);
    let inner = Arc::clone(&self.inner);
    move |user_id| {
      let tag = {
        let mut inner = lock(&inner);
        let mark = inner.groups.journal.mark();
        inner.begin_fetch(mark)
      };
      async move {
        let items = backend.fetch_groups_for_user(&user_id).await?;
        Fetched::checked(items, tag)
      }
      .boxed()
    }
  }

  fn invitations_fetcher(
    &self,
  ) -> impl FnOnce(String) -> BoxFuture<'static, SyncResult<Fetched<GroupInvitation>>> {
    let backend = Arc::clone(&self.backend);
    let inner = Arc::clone(&self.inner);
    move |user_id| {
      let tag = {
        let mut inner = lock(&inner);
        let mark = inner.invitations.journal.mark();
        inner.begin_fetch(mark)
      };
      async move {
        let items = backend.fetch_pending_invitations(&user_id).await?;
        Fetched::checked(items, tag)
      }
      .boxed()
    }
  }

  /// Fold a lookup into state. A fetch not yet committed is rebased onto
  /// the mutations it has not seen and committed only if it differs from
  /// what is shown. That includes a cached result whose original caller
  /// stopped waiting before it landed.
  async fn settle<T: Entity>(&self, select: Select<T>, lookup: Lookup<Fetched<T>>) -> SyncResult<()> {
    let snapshot = {
      let mut inner = lock(&self.inner);
      if let Some(error) = lookup.error {
        select(&mut *inner).error = Some(error.clone());
        self.state_tx.send_replace(inner.snapshot());
        return Err(error);
      }
      let Some(fetched) = lookup.value else {
        return Ok(());
      };
      if fetched.tag.epoch != inner.epoch {
        debug!(user_id = %self.user_id, "fetch predates clear, discarding");
        return Ok(());
      }

      let collection = select(&mut *inner);
      if collection.committed.is_some_and(|id| fetched.tag.id <= id) {
        return Ok(());
      }
      let rebased = collection.journal.replay(fetched.tag.mark, fetched.items);
      collection.journal.prune(fetched.tag.mark);
      collection.error = None;
      collection.synced_at = lookup.fetched_at;
      collection.committed = Some(fetched.tag.id);

      let changed = has_changed(&collection.items, &rebased);
      if changed {
        collection.items = rebased;
        inner.revision += 1;
        debug!(user_id = %self.user_id, revision = inner.revision, "fetched data changed");
      } else {
        debug!(user_id = %self.user_id, "fetched data unchanged");
      }
      self.state_tx.send_replace(inner.snapshot());
      changed.then(|| (inner.revision, inner.persisted()))
    };

    if let Some((revision, lists)) = snapshot {
      self.persist(revision, lists).await;
    }
    Ok(())
  }

  /// Apply an optimistic mutation and persist the result.
  async fn apply(&self, mutate: impl FnOnce(&mut Inner)) {
    let (revision, lists) = {
      let mut inner = lock(&self.inner);
      mutate(&mut *inner);
      inner.revision += 1;
      self.state_tx.send_replace(inner.snapshot());
      (inner.revision, inner.persisted())
    };
    self.persist(revision, lists).await;
  }

  /// Write a snapshot to the persisted cache on the blocking pool. A snapshot
  /// older than the last one written is skipped. Failures are logged; the
  /// persisted copy only matters on the next cold start.
  async fn persist(&self, revision: u64, lists: PersistedLists) {
    let storage = Arc::clone(&self.storage);
    let persisted = Arc::clone(&self.persisted_revision);
    let key = persist_key(&self.user_id);
    let task_key = key.clone();
    let stored_at = self.clock.now();

    let written = tokio::task::spawn_blocking(move || -> SyncResult<bool> {
      let mut last = persisted.lock().unwrap_or_else(PoisonError::into_inner);
      if *last >= revision {
        return Ok(false);
      }
      let entry = Stored::new(lists, stored_at)?;
      storage.write(&task_key, &entry)?;
      *last = revision;
      Ok(true)
    })
    .await;

    match written {
      Ok(Ok(true)) => {}
      Ok(Ok(false)) => debug!(key = %key, revision, "newer snapshot already persisted"),
      Ok(Err(e)) => warn!(key = %key, error = %e, "failed to persist groups"),
      Err(e) => warn!(key = %key, error = %e, "persist task failed"),
    }
  }

  fn begin_load(&self) -> LoadingGuard<'_> {
    let mut inner = lock(&self.inner);
    inner.loads_in_flight += 1;
    self.state_tx.send_replace(inner.snapshot());
    LoadingGuard {
      inner: &self.inner,
      state_tx: &self.state_tx,
    }
  }
}

/// Keeps `loading` set for as long as a load is awaiting.
struct LoadingGuard<'a> {
  inner: &'a Mutex<Inner>,
  state_tx: &'a watch::Sender<StoreState>,
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    let mut inner = lock(self.inner);
    inner.loads_in_flight = inner.loads_in_flight.saturating_sub(1);
    self.state_tx.send_replace(inner.snapshot());
  }
}
