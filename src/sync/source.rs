//! External source adapter contract.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::resource::{Resource, ResourceType};

/// Read access to the system of record.
///
/// Implementations own transport, authentication and retries. Every resource
/// they return must carry a version that only grows over time.
#[async_trait]
pub trait ExternalSource: Send + Sync {
  async fn find_by_id(&self, resource_type: ResourceType, id: &str) -> Result<Option<Resource>>;

  async fn find_all(&self, resource_type: ResourceType) -> Result<Vec<Resource>>;
}

/// Source backed by a JSON export: an array of resources in one file.
///
/// The file is re-read on every call so an external exporter can replace it
/// between reconciliation passes.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
  path: PathBuf,
}

impl SnapshotSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  async fn load(&self, resource_type: ResourceType, id: &str) -> Result<Vec<Resource>> {
    let data = tokio::fs::read(&self.path)
      .await
      .map_err(|e| SyncError::AdapterFetchFailed {
        resource_type,
        resource_id: id.to_string(),
        message: format!("Failed to read snapshot {}: {}", self.path.display(), e),
      })?;
    serde_json::from_slice(&data).map_err(|e| SyncError::AdapterFetchFailed {
      resource_type,
      resource_id: id.to_string(),
      message: format!("Failed to parse snapshot {}: {}", self.path.display(), e),
    })
  }
}

#[async_trait]
impl ExternalSource for SnapshotSource {
  async fn find_by_id(&self, resource_type: ResourceType, id: &str) -> Result<Option<Resource>> {
    Ok(
      self
        .load(resource_type, id)
        .await?
        .into_iter()
        .find(|r| r.resource_type() == resource_type && r.id == id),
    )
  }

  async fn find_all(&self, resource_type: ResourceType) -> Result<Vec<Resource>> {
    Ok(
      self
        .load(resource_type, "*")
        .await?
        .into_iter()
        .filter(|r| r.resource_type() == resource_type)
        .collect(),
    )
  }
}
