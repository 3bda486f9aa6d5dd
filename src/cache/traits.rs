//! Core types shared by the in-memory and persisted caches.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

use super::clock;

/// Format version of persisted entries. Entries written under another
/// version are treated as absent.
pub const CACHE_VERSION: &str = "1.0.0";

/// Values that can round-trip through the persisted cache.
pub trait Persistable: Clone + Send + Sync + Serialize + DeserializeOwned {}

impl<T> Persistable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned {}

/// A value as it sits in the persisted cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stored<T> {
  pub value: T,
  /// When the value was written
  pub stored_at: DateTime<Utc>,
  /// SHA-256 of the serialized value, hex encoded
  pub hash: String,
  pub version: String,
}

impl<T: Serialize> Stored<T> {
  /// Wrap a value for persisting, computing its content hash.
  pub fn new(value: T, stored_at: DateTime<Utc>) -> Result<Self, SyncError> {
    let hash = content_hash(&value)?;
    Ok(Self {
      value,
      stored_at,
      hash,
      version: CACHE_VERSION.to_string(),
    })
  }
}

/// Content hash of a serializable value.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, SyncError> {
  let bytes = serde_json::to_vec(value)
    .map_err(|e| SyncError::Storage(format!("Failed to serialize value for hashing: {}", e)))?;
  let mut hasher = Sha256::new();
  hasher.update(&bytes);
  Ok(hex::encode(hasher.finalize()))
}

/// Age and staleness of a cached value under a given TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub age: Duration,
  pub is_stale: bool,
}

impl CacheStats {
  pub fn compute(fetched_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> Self {
    Self {
      age: clock::age(fetched_at, now),
      is_stale: clock::is_older_than(fetched_at, ttl, now),
    }
  }
}

/// Indicates where a value handed out by a cache came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the backend
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Backend failed, serving the last known-good value
  Offline,
  /// Nothing cached and nothing fetched
  Empty,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hash_is_stable_for_equal_values() {
    let a = content_hash(&vec!["x", "y"]).unwrap();
    let b = content_hash(&vec!["x", "y"]).unwrap();
    let c = content_hash(&vec!["y", "x"]).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64);
  }

  #[test]
  fn test_stats_mark_stale_after_ttl() {
    let now = Utc::now();
    let fresh = CacheStats::compute(now - Duration::minutes(2), Duration::minutes(5), now);
    assert!(!fresh.is_stale);
    assert_eq!(fresh.age, Duration::minutes(2));

    let stale = CacheStats::compute(now - Duration::minutes(7), Duration::minutes(5), now);
    assert!(stale.is_stale);
  }
}
