//! Persisted cache: key-value trait with SQLite, in-memory and no-op backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{Persistable, Stored, CACHE_VERSION};

/// Metadata about one persisted entry, for inspection tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
  pub key: String,
  pub stored_at: DateTime<Utc>,
  pub hash: String,
  pub version: String,
  pub size_bytes: usize,
}

/// Trait for persisted cache backends.
///
/// The persisted copy only bridges cold starts; it is never more
/// authoritative than a value fetched during the session.
pub trait CacheStorage: Send + Sync {
  /// Read the entry under `key`. Entries written under another format
  /// version, or that no longer decode, read as absent.
  fn read<T: Persistable>(&self, key: &str) -> Result<Option<Stored<T>>>;

  /// Write (replace) the entry under `key`.
  fn write<T: Persistable>(&self, key: &str, entry: &Stored<T>) -> Result<()>;

  /// Remove the entry under `key`.
  fn clear(&self, key: &str) -> Result<()>;

  /// Remove every entry.
  fn clear_all(&self) -> Result<()>;

  /// List stored entries, ordered by key.
  fn entries(&self) -> Result<Vec<EntryInfo>>;
}

/// Serialized form shared by the concrete backends.
#[derive(Debug, Clone)]
struct RawEntry {
  data: Vec<u8>,
  hash: String,
  version: String,
  stored_at: DateTime<Utc>,
}

impl RawEntry {
  fn encode<T: Persistable>(entry: &Stored<T>) -> Result<Self> {
    let data =
      serde_json::to_vec(&entry.value).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    Ok(Self {
      data,
      hash: entry.hash.clone(),
      version: entry.version.clone(),
      stored_at: entry.stored_at,
    })
  }

  fn decode<T: Persistable>(self, key: &str) -> Option<Stored<T>> {
    if self.version != CACHE_VERSION {
      debug!(key, version = %self.version, "ignoring cache entry with old format version");
      return None;
    }
    match serde_json::from_slice(&self.data) {
      Ok(value) => Some(Stored {
        value,
        stored_at: self.stored_at,
        hash: self.hash,
        version: self.version,
      }),
      Err(e) => {
        warn!(key, error = %e, "ignoring undecodable cache entry");
        None
      }
    }
  }

  fn info(&self, key: &str) -> EntryInfo {
    EntryInfo {
      key: key.to_string(),
      stored_at: self.stored_at,
      hash: self.hash.clone(),
      version: self.version.clone(),
      size_bytes: self.data.len(),
    }
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn read<T: Persistable>(&self, _key: &str) -> Result<Option<Stored<T>>> {
    Ok(None) // Always miss
  }

  fn write<T: Persistable>(&self, _key: &str, _entry: &Stored<T>) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    Ok(())
  }

  fn entries(&self) -> Result<Vec<EntryInfo>> {
    Ok(Vec::new())
  }
}

/// In-memory map storage. Keeps a count of writes so callers can tell
/// whether a sync actually touched the persisted copy.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, RawEntry>>,
  writes: AtomicUsize,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of successful writes since creation.
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, RawEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn read<T: Persistable>(&self, key: &str) -> Result<Option<Stored<T>>> {
    let raw = self.lock()?.get(key).cloned();
    Ok(raw.and_then(|raw| raw.decode(key)))
  }

  fn write<T: Persistable>(&self, key: &str, entry: &Stored<T>) -> Result<()> {
    let raw = RawEntry::encode(entry)?;
    self.lock()?.insert(key.to_string(), raw);
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn clear(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }

  fn entries(&self) -> Result<Vec<EntryInfo>> {
    let mut infos: Vec<EntryInfo> = self
      .lock()?
      .iter()
      .map(|(key, raw)| raw.info(key))
      .collect();
    infos.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(infos)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    cache_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    hash TEXT NOT NULL,
    version TEXT NOT NULL,
    stored_at TEXT NOT NULL
);
"#;

impl SqliteStorage {
  /// Open (or create) the cache database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("groupsync").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for SqliteStorage {
  fn read<T: Persistable>(&self, key: &str) -> Result<Option<Stored<T>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String, String, String)> = conn
      .query_row(
        "SELECT data, hash, version, stored_at FROM kv_cache WHERE cache_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let Some((data, hash, version, stored_at)) = row else {
      return Ok(None);
    };

    let raw = RawEntry {
      data,
      hash,
      version,
      stored_at: parse_datetime(&stored_at)?,
    };
    Ok(raw.decode(key))
  }

  fn write<T: Persistable>(&self, key: &str, entry: &Stored<T>) -> Result<()> {
    let raw = RawEntry::encode(entry)?;
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (cache_key, data, hash, version, stored_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key,
          raw.data,
          raw.hash,
          raw.version,
          raw.stored_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn clear(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_cache WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to clear cache entry {}: {}", key, e))?;
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn entries(&self) -> Result<Vec<EntryInfo>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT cache_key, hash, version, stored_at, length(data) FROM kv_cache
         ORDER BY cache_key",
      )
      .map_err(|e| eyre!("Failed to prepare entry listing: {}", e))?;

    let rows: Vec<(String, String, String, String, i64)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache entry row: {}", e))?;

    rows
      .into_iter()
      .map(|(key, hash, version, stored_at, size)| {
        Ok(EntryInfo {
          key,
          stored_at: parse_datetime(&stored_at)?,
          hash,
          version,
          size_bytes: usize::try_from(size).unwrap_or(0),
        })
      })
      .collect()
  }
}

/// Storage chosen at runtime from configuration.
pub enum AnyStorage {
  Sqlite(SqliteStorage),
  Memory(MemoryStorage),
  Noop(NoopStorage),
}

impl CacheStorage for AnyStorage {
  fn read<T: Persistable>(&self, key: &str) -> Result<Option<Stored<T>>> {
    match self {
      Self::Sqlite(s) => s.read(key),
      Self::Memory(s) => s.read(key),
      Self::Noop(s) => s.read(key),
    }
  }

  fn write<T: Persistable>(&self, key: &str, entry: &Stored<T>) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.write(key, entry),
      Self::Memory(s) => s.write(key, entry),
      Self::Noop(s) => s.write(key, entry),
    }
  }

  fn clear(&self, key: &str) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.clear(key),
      Self::Memory(s) => s.clear(key),
      Self::Noop(s) => s.clear(key),
    }
  }

  fn clear_all(&self) -> Result<()> {
    match self {
      Self::Sqlite(s) => s.clear_all(),
      Self::Memory(s) => s.clear_all(),
      Self::Noop(s) => s.clear_all(),
    }
  }

  fn entries(&self) -> Result<Vec<EntryInfo>> {
    match self {
      Self::Sqlite(s) => s.entries(),
      Self::Memory(s) => s.entries(),
      Self::Noop(s) => s.entries(),
    }
  }
}

/// Parse an RFC 3339 timestamp as written by [`SqliteStorage::write`].
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Snapshot {
    names: Vec<String>,
  }

  fn snapshot(names: &[&str]) -> Stored<Snapshot> {
    Stored::new(
      Snapshot {
        names: names.iter().map(|n| n.to_string()).collect(),
      },
      Utc::now(),
    )
    .unwrap()
  }

  fn exercise<S: CacheStorage>(storage: &S) {
    assert!(storage.read::<Snapshot>("groups:u1").unwrap().is_none());

    let entry = snapshot(&["a", "b"]);
    storage.write("groups:u1", &entry).unwrap();
    storage.write("groups:u2", &snapshot(&["c"])).unwrap();

    let read = storage.read::<Snapshot>("groups:u1").unwrap().unwrap();
    assert_eq!(read.value, entry.value);
    assert_eq!(read.hash, entry.hash);
    assert_eq!(read.stored_at.timestamp(), entry.stored_at.timestamp());

    let keys: Vec<String> = storage.entries().unwrap().into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["groups:u1", "groups:u2"]);

    storage.clear("groups:u1").unwrap();
    assert!(storage.read::<Snapshot>("groups:u1").unwrap().is_none());
    assert!(storage.read::<Snapshot>("groups:u2").unwrap().is_some());

    storage.clear_all().unwrap();
    assert!(storage.entries().unwrap().is_empty());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_memory_storage_counts_writes() {
    let storage = MemoryStorage::new();
    exercise(&storage);
    assert_eq!(storage.writes(), 2);
  }

  #[test]
  fn test_old_version_reads_as_absent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut entry = snapshot(&["a"]);
    entry.version = "0.9.0".to_string();
    storage.write("groups:u1", &entry).unwrap();

    assert!(storage.read::<Snapshot>("groups:u1").unwrap().is_none());
    // Still listed, so the inspection tool can show and clear it.
    assert_eq!(storage.entries().unwrap()[0].version, "0.9.0");
  }

  #[test]
  fn test_undecodable_entry_reads_as_absent() {
    let storage = MemoryStorage::new();
    storage.write("groups:u1", &snapshot(&["a"])).unwrap();
    assert!(storage.read::<Vec<u32>>("groups:u1").unwrap().is_none());
  }

  #[test]
  fn test_noop_storage_never_hits() {
    let storage = AnyStorage::Noop(NoopStorage);
    storage.write("k", &snapshot(&["a"])).unwrap();
    assert!(storage.read::<Snapshot>("k").unwrap().is_none());
    assert!(storage.entries().unwrap().is_empty());
  }
}
