//! Error types for the mirror.

use std::time::Duration;

use thiserror::Error;

use crate::resource::{CacheKey, ResourceType};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the cache, the sync coordinator, and webhook ingest.
#[derive(Error, Debug)]
pub enum SyncError {
  /// Webhook signature missing or not matching the payload.
  #[error("webhook signature is invalid")]
  SignatureInvalid,

  /// The external source failed to produce a resource.
  #[error("failed to fetch {resource_type} {resource_id}: {message}")]
  AdapterFetchFailed {
    resource_type: ResourceType,
    resource_id: String,
    message: String,
  },

  /// `perform_initial_sync` was called while a pass was running.
  #[error("sync already running")]
  SyncAlreadyInProgress,

  /// The initial sync deadline fired before all resources were processed.
  #[error("sync exceeded its timeout after {elapsed:?}")]
  SyncTimeoutExceeded { elapsed: Duration },

  /// Sync metadata could not be durably recorded or loaded.
  #[error("sync metadata persistence failed: {0}")]
  MetadataPersistenceFailed(String),

  /// An update carried an older version than the one already stored.
  #[error("rejected stale update for {key}: stored version {current}, incoming {incoming}")]
  VersionRegression {
    key: CacheKey,
    current: i64,
    incoming: i64,
  },

  /// The pattern given to `invalidate_by_pattern` does not compile.
  #[error("invalid pattern: {0}")]
  InvalidPattern(#[from] regex::Error),

  /// Bad or missing configuration.
  #[error("configuration error: {0}")]
  Config(String),

  /// JSON parsing error.
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for SyncError {
  fn from(err: rusqlite::Error) -> Self {
    SyncError::MetadataPersistenceFailed(err.to_string())
  }
}
