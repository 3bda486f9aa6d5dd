use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{AnyStorage, MemoryStorage, NoopStorage, SqliteStorage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Directory for log files (defaults to the data directory)
  pub log_dir: Option<PathBuf>,
}

/// Freshness and timeout settings, in whole units to keep the file readable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub groups_ttl_secs: u64,
  /// Invitations are refreshed more eagerly than groups
  pub invitations_ttl_secs: u64,
  pub subscription_ttl_secs: u64,
  /// Persisted entries older than this are ignored on cold start
  pub max_cache_age_secs: u64,
  pub refresh_min_interval_ms: u64,
  pub fetch_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      groups_ttl_secs: 5 * 60,
      invitations_ttl_secs: 3 * 60,
      subscription_ttl_secs: 5 * 60,
      max_cache_age_secs: 30 * 60,
      refresh_min_interval_ms: 1000,
      fetch_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  /// On-device SQLite database
  #[default]
  Sqlite,
  /// Process-local map, lost on exit
  Memory,
  /// Persisting disabled
  None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageKind,
  /// SQLite database path (defaults to $XDG_DATA_HOME/groupsync/cache.db)
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  /// Open the configured persisted cache.
  pub fn open(&self) -> Result<AnyStorage> {
    Ok(match self.backend {
      StorageKind::Sqlite => match &self.path {
        Some(path) => AnyStorage::Sqlite(SqliteStorage::open(path)?),
        None => AnyStorage::Sqlite(SqliteStorage::open_default()?),
      },
      StorageKind::Memory => AnyStorage::Memory(MemoryStorage::new()),
      StorageKind::None => AnyStorage::Noop(NoopStorage),
    })
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./groupsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/groupsync/config.yaml
  ///
  /// Every setting has a default, so running without a file is fine.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("groupsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("groupsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache.fetch_timeout_secs == 0 {
      return Err(eyre!("cache.fetch_timeout_secs must be positive"));
    }
    Ok(config)
  }

  /// Directory for rolling log files.
  pub fn log_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("groupsync").join("logs"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.storage.backend, StorageKind::Sqlite);
    assert_eq!(config.cache.groups_ttl_secs, 300);
  }

  #[test]
  fn test_partial_override() {
    let config = Config::parse(
      r#"
cache:
  invitations_ttl_secs: 60
storage:
  backend: memory
"#,
    )
    .unwrap();
    assert_eq!(config.cache.invitations_ttl_secs, 60);
    assert_eq!(config.cache.groups_ttl_secs, 300);
    assert_eq!(config.storage.backend, StorageKind::Memory);
    assert!(matches!(config.storage.open().unwrap(), AnyStorage::Memory(_)));
  }

  #[test]
  fn test_zero_timeout_rejected() {
    assert!(Config::parse("cache:\n  fetch_timeout_secs: 0\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/groupsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
