use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_TTL_SECS;
use crate::sync::{
  ReconcileSchedule, SqliteMetadataStore, DEFAULT_CONCURRENCY, DEFAULT_STALE_AFTER_SECS,
};

/// Environment variable holding the webhook signing secret.
pub const WEBHOOK_SECRET_ENV: &str = "PM_MIRROR_WEBHOOK_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub storage: StorageConfig,
  pub source: SourceConfig,
  pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
  /// Periodic expired-entry sweep; 0 leaves expiry lazy
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: DEFAULT_TTL_SECS as u64,
      sweep_interval_secs: 0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub stale_after_secs: u64,
  pub initial_timeout_secs: u64,
  /// Max in-flight per-resource fetches
  pub concurrency: usize,
  pub reconcile_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: DEFAULT_STALE_AFTER_SECS as u64,
      initial_timeout_secs: 30,
      concurrency: DEFAULT_CONCURRENCY,
      reconcile_interval_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite metadata file (defaults to the platform data dir)
  pub metadata_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
  /// JSON array of resources read by the snapshot source
  pub snapshot_path: PathBuf,
}

impl Default for SourceConfig {
  fn default() -> Self {
    Self {
      snapshot_path: PathBuf::from("resources.json"),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
  /// Accept deliveries without verification when no secret is set
  pub allow_unsigned: bool,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pm-mirror.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pm-mirror/config.yaml
  ///
  /// Defaults apply when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pm-mirror.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pm-mirror").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to unit, not to an empty map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.sync.concurrency == 0 {
      return Err(eyre!("sync.concurrency must be at least 1"));
    }
    if self.sync.reconcile_interval_secs == 0 {
      return Err(eyre!("sync.reconcile_interval_secs must be at least 1"));
    }
    if self.cache.default_ttl_secs == 0 {
      return Err(eyre!("cache.default_ttl_secs must be at least 1"));
    }
    Ok(())
  }

  /// Get the webhook signing secret from the environment.
  ///
  /// Checks PM_MIRROR_WEBHOOK_SECRET. An empty value counts as unset.
  pub fn webhook_secret() -> Option<String> {
    std::env::var(WEBHOOK_SECRET_ENV)
      .ok()
      .filter(|secret| !secret.is_empty())
  }

  pub fn default_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.cache.default_ttl_secs as i64)
  }

  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.sync.stale_after_secs as i64)
  }

  pub fn initial_timeout(&self) -> Duration {
    Duration::from_secs(self.sync.initial_timeout_secs)
  }

  pub fn metadata_path(&self) -> Result<PathBuf> {
    match &self.storage.metadata_path {
      Some(path) => Ok(path.clone()),
      None => SqliteMetadataStore::default_path().map_err(|e| eyre!("{}", e)),
    }
  }

  pub fn reconcile_schedule(&self) -> ReconcileSchedule {
    ReconcileSchedule {
      interval: Duration::from_secs(self.sync.reconcile_interval_secs),
      timeout: self.initial_timeout(),
      sweep_interval: match self.cache.sweep_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.cache.default_ttl_secs, 3600);
    assert_eq!(config.sync.stale_after_secs, 300);
    assert_eq!(config.sync.concurrency, 4);
    assert!(!config.webhook.allow_unsigned);
    assert!(config.reconcile_schedule().sweep_interval.is_none());
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::from_yaml(
      "sync:\n  stale_after_secs: 60\n\
       cache:\n  sweep_interval_secs: 30\n\
       webhook:\n  allow_unsigned: true\n",
    )
    .unwrap();

    assert_eq!(config.stale_after(), chrono::Duration::minutes(1));
    assert_eq!(config.sync.initial_timeout_secs, 30);
    assert_eq!(
      config.reconcile_schedule().sweep_interval,
      Some(Duration::from_secs(30))
    );
    assert!(config.webhook.allow_unsigned);
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.yaml");
    std::fs::write(
      &path,
      "storage:\n  metadata_path: /tmp/meta.db\nsource:\n  snapshot_path: snap.json\n",
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.metadata_path().unwrap(), PathBuf::from("/tmp/meta.db"));
    assert_eq!(config.source.snapshot_path, PathBuf::from("snap.json"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.yaml"))).is_err());
  }

  #[test]
  fn test_invalid_values_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.yaml");
    std::fs::write(&path, "sync:\n  concurrency: 0\n").unwrap();
    assert!(Config::load(Some(&path)).is_err());

    std::fs::write(&path, "sync: [not, a, map]\n").unwrap();
    assert!(Config::load(Some(&path)).is_err());
  }
}
