//! Error taxonomy for the sync engine.

use std::time::Duration;

/// Errors surfaced by the sync engine to its callers.
///
/// None of these are fatal: the worst outcome is a stale value on screen
/// alongside one of these errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// The backend call failed.
  #[error("network error: {0}")]
  Network(String),
  /// The backend call did not settle within the configured fetch timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// The backend returned an entity that failed validation.
  #[error("invalid {entity} from backend: {reason}")]
  Validation {
    entity: &'static str,
    reason: String,
  },
  /// Reading or writing the persisted cache failed.
  #[error("cache storage error: {0}")]
  Storage(String),
}

impl SyncError {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network(message.into())
  }

  pub fn validation(entity: &'static str, reason: impl Into<String>) -> Self {
    Self::Validation {
      entity,
      reason: reason.into(),
    }
  }

  /// Whether a stale cached value is an acceptable substitute for this failure.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Network(_) | Self::Timeout(_))
  }
}

impl From<color_eyre::Report> for SyncError {
  fn from(report: color_eyre::Report) -> Self {
    Self::Storage(report.to_string())
  }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
