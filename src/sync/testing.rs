//! Test doubles for the sync collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, SyncError};
use crate::resource::{CacheKey, IssueFields, Resource, ResourceFields, ResourceType};

use super::metadata::{SyncMetadata, SyncMetadataStore};
use super::source::ExternalSource;

pub fn issue(id: &str) -> Resource {
  Resource::new(
    id,
    ResourceFields::Issue(IssueFields {
      title: format!("Issue {}", id),
      project_id: Some("P-1".to_string()),
      ..Default::default()
    }),
  )
}

/// In-memory source with per-id failure injection and optional latency.
/// Failing on `"*"` makes `find_all` fail.
#[derive(Debug, Default)]
pub struct StubSource {
  resources: Mutex<HashMap<CacheKey, Resource>>,
  failing: Mutex<HashSet<String>>,
  latency: Option<Duration>,
  find_by_id_calls: AtomicUsize,
  find_all_calls: AtomicUsize,
}

impl StubSource {
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  pub fn insert(&self, resource: Resource) {
    self.resources.lock().insert(resource.key(), resource);
  }

  pub fn fail_on(&self, id: &str) {
    self.failing.lock().insert(id.to_string());
  }

  pub fn find_by_id_calls(&self) -> usize {
    self.find_by_id_calls.load(Ordering::SeqCst)
  }

  pub fn find_all_calls(&self) -> usize {
    self.find_all_calls.load(Ordering::SeqCst)
  }

  fn failure(&self, resource_type: ResourceType, id: &str) -> SyncError {
    SyncError::AdapterFetchFailed {
      resource_type,
      resource_id: id.to_string(),
      message: "stub source failure".to_string(),
    }
  }
}

#[async_trait]
impl ExternalSource for StubSource {
  async fn find_by_id(&self, resource_type: ResourceType, id: &str) -> Result<Option<Resource>> {
    self.find_by_id_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(latency) = self.latency {
      tokio::time::sleep(latency).await;
    }
    if self.failing.lock().contains(id) {
      return Err(self.failure(resource_type, id));
    }
    let key = CacheKey::new(resource_type, id);
    Ok(self.resources.lock().get(&key).cloned())
  }

  async fn find_all(&self, resource_type: ResourceType) -> Result<Vec<Resource>> {
    self.find_all_calls.fetch_add(1, Ordering::SeqCst);
    if self.failing.lock().contains("*") {
      return Err(self.failure(resource_type, "*"));
    }
    let mut all: Vec<Resource> = self
      .resources
      .lock()
      .values()
      .filter(|r| r.resource_type() == resource_type)
      .cloned()
      .collect();
    all.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(all)
  }
}

/// Metadata store whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingMetadataStore;

impl SyncMetadataStore for FailingMetadataStore {
  fn load_metadata(&self) -> Result<Vec<SyncMetadata>> {
    Ok(Vec::new())
  }

  fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
    Err(SyncError::MetadataPersistenceFailed(format!(
      "disk full writing {}",
      metadata.key()
    )))
  }

  fn delete_metadata(&self, _resource_type: ResourceType, _resource_id: &str) -> Result<bool> {
    Err(SyncError::MetadataPersistenceFailed(
      "disk full".to_string(),
    ))
  }
}
