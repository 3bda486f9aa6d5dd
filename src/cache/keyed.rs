//! Single-flight, TTL-aware cache keyed by an arbitrary key.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

use super::clock::{self, Clock};
use super::traits::{CacheSource, CacheStats};

type SharedFetch<V> = Shared<BoxFuture<'static, SyncResult<V>>>;
type Entries<K, V> = Arc<Mutex<HashMap<K, CacheEntry<V>>>>;

struct InFlight<V> {
  generation: u64,
  future: SharedFetch<V>,
}

/// A slot registered under the entry lock whose fetch is started once the
/// lock is released.
struct Reserved<K, V> {
  key: K,
  generation: u64,
  done: oneshot::Sender<SyncResult<V>>,
}

struct CacheEntry<V> {
  /// Last known-good value
  value: Option<V>,
  /// Error from the most recent fetch, cleared on success
  error: Option<SyncError>,
  /// When the most recent fetch settled
  fetched_at: Option<DateTime<Utc>>,
  in_flight: Option<InFlight<V>>,
}

impl<V> Default for CacheEntry<V> {
  fn default() -> Self {
    Self {
      value: None,
      error: None,
      fetched_at: None,
      in_flight: None,
    }
  }
}

impl<V: Clone> CacheEntry<V> {
  fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
    self
      .fetched_at
      .map(|at| !clock::is_older_than(at, ttl, now))
      .unwrap_or(false)
  }

  fn lookup(&self, source: CacheSource) -> Lookup<V> {
    Lookup {
      value: self.value.clone(),
      error: self.error.clone(),
      fetched_at: self.fetched_at,
      source,
    }
  }
}

/// Result of [`KeyedAsyncCache::get`].
#[derive(Debug, Clone)]
pub struct Lookup<V> {
  /// The fetched value, or the last known-good value when the fetch failed
  pub value: Option<V>,
  pub error: Option<SyncError>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub source: CacheSource,
}

impl<V> Lookup<V> {
  /// Whether this lookup reflects a successful fetch (fresh or cached).
  pub fn is_ok(&self) -> bool {
    self.error.is_none() && self.value.is_some()
  }
}

/// Snapshot of an entry without triggering any I/O.
#[derive(Debug, Clone)]
pub struct Peek<V> {
  pub value: Option<V>,
  pub error: Option<SyncError>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub in_flight: bool,
}

impl<V> Default for Peek<V> {
  fn default() -> Self {
    Self {
      value: None,
      error: None,
      fetched_at: None,
      in_flight: false,
    }
  }
}

/// Generic single-flight cache.
///
/// Concurrent `get` calls for the same key share one underlying fetch. Each
/// fetch runs as its own task, so a caller that stops waiting does not leave
/// the in-flight slot behind. Entries are only touched while the lock is
/// held, and the lock is never held across an await. Fetchers are invoked
/// after the lock is released, so they may read the cache themselves.
pub struct KeyedAsyncCache<K, V> {
  entries: Entries<K, V>,
  clock: Arc<dyn Clock>,
  /// Upper bound on a single fetch
  fetch_timeout: Option<std::time::Duration>,
  generation: Arc<AtomicU64>,
}

impl<K, V> KeyedAsyncCache<K, V>
where
  K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
      clock,
      fetch_timeout: None,
      generation: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Bound every fetch by `timeout`; a fetch that exceeds it settles with
  /// [`SyncError::Timeout`].
  pub fn with_fetch_timeout(mut self, timeout: std::time::Duration) -> Self {
    self.fetch_timeout = Some(timeout);
    self
  }

  /// Get the value for `key`.
  ///
  /// 1. A fetch already in flight is joined, whatever the TTL or `force`
  /// 2. A fresh entry is returned without I/O unless `force` is set
  /// 3. Otherwise `fetcher` is invoked once and its result stored
  ///
  /// A failed fetch keeps the last known-good value and still stamps
  /// `fetched_at`, so repeated failures are throttled by the TTL as well.
  pub async fn get<F, Fut>(&self, key: K, fetcher: F, ttl: Duration, force: bool) -> Lookup<V>
  where
    F: FnOnce(K) -> Fut,
    Fut: Future<Output = SyncResult<V>> + Send + 'static,
  {
    let (future, reserved) = {
      let mut entries = self.lock();
      let now = self.clock.now();
      let entry = entries.entry(key.clone()).or_default();

      if let Some(in_flight) = &entry.in_flight {
        debug!(?key, "joining in-flight fetch");
        (in_flight.future.clone(), None)
      } else if !force && entry.is_fresh(ttl, now) {
        debug!(?key, "cache hit");
        let source = if entry.error.is_some() {
          CacheSource::Offline
        } else {
          CacheSource::CacheFresh
        };
        return entry.lookup(source);
      } else {
        debug!(?key, force, "cache miss, fetching");
        let (future, reserved) = self.reserve(entry, key.clone());
        (future, Some(reserved))
      }
    };
    if let Some(reserved) = reserved {
      self.launch(reserved, fetcher);
    }

    let outcome = future.await;
    self.finish(&key, outcome)
  }

  /// Fetch a value that reflects everything that happened before this call.
  ///
  /// A fetch already in flight may have started before a write the caller
  /// just made, so it is waited out rather than joined. A fetch started by
  /// another caller after this one began is joined.
  pub async fn refetch<F, Fut>(&self, key: K, fetcher: F) -> Lookup<V>
  where
    F: FnOnce(K) -> Fut,
    Fut: Future<Output = SyncResult<V>> + Send + 'static,
  {
    let floor = self.generation.load(Ordering::SeqCst);
    let (future, reserved) = loop {
      let predating = self
        .lock()
        .get(&key)
        .and_then(|entry| entry.in_flight.as_ref())
        .filter(|in_flight| in_flight.generation < floor)
        .map(|in_flight| in_flight.future.clone());

      if let Some(stale) = predating {
        debug!(?key, "waiting out fetch that predates refetch");
        let _ = stale.await;
        continue;
      }

      // Anything in flight now started after this call, so it is joined.
      let mut entries = self.lock();
      let entry = entries.entry(key.clone()).or_default();
      break match &entry.in_flight {
        Some(in_flight) => (in_flight.future.clone(), None),
        None => {
          debug!(?key, "refetching");
          let (future, reserved) = self.reserve(entry, key.clone());
          (future, Some(reserved))
        }
      };
    };
    if let Some(reserved) = reserved {
      self.launch(reserved, fetcher);
    }

    let outcome = future.await;
    self.finish(&key, outcome)
  }

  /// Drop the stored value for `key`. A fetch in flight is left running and
  /// repopulates the entry when it completes.
  pub fn invalidate(&self, key: &K) {
    let mut entries = self.lock();
    let remove = match entries.get_mut(key) {
      Some(entry) => {
        entry.value = None;
        entry.error = None;
        entry.fetched_at = None;
        entry.in_flight.is_none()
      }
      None => false,
    };
    if remove {
      entries.remove(key);
    }
    debug!(?key, "cache entry invalidated");
  }

  /// Current state of `key` without any I/O.
  pub fn peek(&self, key: &K) -> Peek<V> {
    self
      .lock()
      .get(key)
      .map(|entry| Peek {
        value: entry.value.clone(),
        error: entry.error.clone(),
        fetched_at: entry.fetched_at,
        in_flight: entry.in_flight.is_some(),
      })
      .unwrap_or_default()
  }

  /// Age and staleness of `key` under `ttl`, if it was ever fetched.
  pub fn stats(&self, key: &K, ttl: Duration) -> Option<CacheStats> {
    let fetched_at = self.lock().get(key).and_then(|e| e.fetched_at)?;
    Some(CacheStats::compute(fetched_at, ttl, self.clock.now()))
  }

  /// Drop every entry. Fetches still in flight finish but their results are
  /// discarded.
  pub fn clear(&self) {
    self.lock().clear();
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a new in-flight slot on `entry`. Called with the entry lock
  /// held, so callers arriving before the fetch starts join this slot.
  fn reserve(&self, entry: &mut CacheEntry<V>, key: K) -> (SharedFetch<V>, Reserved<K, V>) {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
    let (done, settled) = oneshot::channel();
    let future = async move {
      settled
        .await
        .unwrap_or_else(|_| Err(SyncError::network("fetch task dropped")))
    }
    .boxed()
    .shared();
    entry.in_flight = Some(InFlight {
      generation,
      future: future.clone(),
    });
    let reserved = Reserved {
      key,
      generation,
      done,
    };
    (future, reserved)
  }

  /// Turn a settled fetch into a lookup, falling back to the last
  /// known-good value on failure.
  fn finish(&self, key: &K, outcome: SyncResult<V>) -> Lookup<V> {
    let entries = self.lock();
    let entry = entries.get(key);
    let fetched_at = entry.and_then(|e| e.fetched_at);
    match outcome {
      Ok(value) => Lookup {
        value: Some(value),
        error: None,
        fetched_at,
        source: CacheSource::Network,
      },
      Err(error) => {
        let value = entry.and_then(|e| e.value.clone());
        let source = if value.is_some() {
          CacheSource::Offline
        } else {
          CacheSource::Empty
        };
        Lookup {
          value,
          error: Some(error),
          fetched_at,
          source,
        }
      }
    }
  }

  /// Invoke `fetcher` for a reserved slot and run the fetch on its own task.
  /// Must be called without the entry lock held.
  fn launch<F, Fut>(&self, reserved: Reserved<K, V>, fetcher: F)
  where
    F: FnOnce(K) -> Fut,
    Fut: Future<Output = SyncResult<V>> + Send + 'static,
  {
    let Reserved {
      key,
      generation,
      done,
    } = reserved;
    let fetch = fetcher(key.clone());
    let entries = Arc::clone(&self.entries);
    let clock = Arc::clone(&self.clock);
    let timeout = self.fetch_timeout;

    tokio::spawn(async move {
      // A panicking fetch must still release its slot.
      let task = tokio::spawn(async move {
        match timeout {
          Some(limit) => tokio::time::timeout(limit, fetch)
            .await
            .unwrap_or(Err(SyncError::Timeout(limit))),
          None => fetch.await,
        }
      });
      let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => Err(SyncError::network(format!("fetch task failed: {}", e))),
      };
      settle(&entries, &key, generation, &outcome, clock.now());
      let _ = done.send(outcome);
    });
  }
}

/// Record a settled fetch, if its slot is still the current one.
fn settle<K, V>(
  entries: &Mutex<HashMap<K, CacheEntry<V>>>,
  key: &K,
  generation: u64,
  outcome: &SyncResult<V>,
  now: DateTime<Utc>,
) where
  K: Eq + Hash + Debug,
  V: Clone,
{
  let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
  let Some(entry) = entries.get_mut(key) else {
    debug!(?key, "fetch settled after cache was cleared, discarding");
    return;
  };
  match &entry.in_flight {
    Some(in_flight) if in_flight.generation == generation => entry.in_flight = None,
    _ => {
      debug!(?key, "fetch settled for a superseded slot, discarding");
      return;
    }
  }

  match outcome {
    Ok(value) => {
      entry.value = Some(value.clone());
      entry.error = None;
    }
    Err(error) => {
      warn!(?key, %error, "fetch failed, keeping last known value");
      entry.error = Some(error.clone());
    }
  }
  entry.fetched_at = Some(now);
}

impl<K, V> Clone for KeyedAsyncCache<K, V> {
  fn clone(&self) -> Self {
    Self {
      entries: Arc::clone(&self.entries),
      clock: Arc::clone(&self.clock),
      fetch_timeout: self.fetch_timeout,
      generation: Arc::clone(&self.generation),
    }
  }
}
