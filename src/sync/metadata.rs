//! Sync metadata records and the storage contract for them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resource::{CacheKey, Resource, ResourceType};

/// What the mirror last saw of one upstream resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
  pub resource_id: String,
  pub resource_type: ResourceType,
  /// Upstream modification time of the synced value
  pub last_modified: DateTime<Utc>,
  pub version: i64,
  /// None until the resource has been synced at least once
  pub synced_at: Option<DateTime<Utc>>,
}

impl SyncMetadata {
  pub fn from_resource(resource: &Resource, synced_at: DateTime<Utc>) -> Self {
    Self {
      resource_id: resource.id.clone(),
      resource_type: resource.resource_type(),
      last_modified: resource.updated_at,
      version: resource.version,
      synced_at: Some(synced_at),
    }
  }

  pub fn key(&self) -> CacheKey {
    CacheKey::new(self.resource_type, self.resource_id.clone())
  }
}

/// Durable record of sync metadata, one row per mirrored resource.
///
/// Implementations must survive process restarts. No transactionality across
/// rows is required.
pub trait SyncMetadataStore: Send + Sync {
  /// Load every row.
  fn load_metadata(&self) -> Result<Vec<SyncMetadata>>;

  /// Insert or replace the row for `metadata.key()`.
  fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()>;

  /// Fetch a single row.
  fn get_metadata(
    &self,
    resource_type: ResourceType,
    resource_id: &str,
  ) -> Result<Option<SyncMetadata>> {
    Ok(
      self
        .load_metadata()?
        .into_iter()
        .find(|m| m.resource_type == resource_type && m.resource_id == resource_id),
    )
  }

  /// Remove a row. Returns true if it existed.
  fn delete_metadata(&self, resource_type: ResourceType, resource_id: &str) -> Result<bool>;
}

/// Metadata store kept in process memory. Not durable; used in tests and
/// when no database path is configured.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
  rows: RwLock<BTreeMap<CacheKey, SyncMetadata>>,
}

impl MemoryMetadataStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed the store with existing rows.
  pub fn with_rows(rows: impl IntoIterator<Item = SyncMetadata>) -> Self {
    let store = Self::new();
    {
      let mut map = store.rows.write();
      for row in rows {
        map.insert(row.key(), row);
      }
    }
    store
  }
}

impl SyncMetadataStore for MemoryMetadataStore {
  fn load_metadata(&self) -> Result<Vec<SyncMetadata>> {
    Ok(self.rows.read().values().cloned().collect())
  }

  fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
    self.rows.write().insert(metadata.key(), metadata.clone());
    Ok(())
  }

  fn get_metadata(
    &self,
    resource_type: ResourceType,
    resource_id: &str,
  ) -> Result<Option<SyncMetadata>> {
    let key = CacheKey::new(resource_type, resource_id);
    Ok(self.rows.read().get(&key).cloned())
  }

  fn delete_metadata(&self, resource_type: ResourceType, resource_id: &str) -> Result<bool> {
    let key = CacheKey::new(resource_type, resource_id);
    Ok(self.rows.write().remove(&key).is_some())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resource::{ProjectFields, ResourceFields};

  #[test]
  fn test_memory_store_upserts_by_key() {
    let store = MemoryMetadataStore::new();
    let project = Resource::new(
      "P-1",
      ResourceFields::Project(ProjectFields {
        title: "Apollo".to_string(),
        ..Default::default()
      }),
    );
    store
      .save_metadata(&SyncMetadata::from_resource(&project, Utc::now()))
      .unwrap();
    store
      .save_metadata(&SyncMetadata::from_resource(&project.clone().with_version(2), Utc::now()))
      .unwrap();

    let rows = store.load_metadata().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 2);

    assert!(store.delete_metadata(ResourceType::Project, "P-1").unwrap());
    assert!(store
      .get_metadata(ResourceType::Project, "P-1")
      .unwrap()
      .is_none());
  }
}
