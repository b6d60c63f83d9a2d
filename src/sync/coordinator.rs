//! Reconciliation between the cache and the system of record.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{ResourceCache, SetOptions};
use crate::error::{Result, SyncError};
use crate::resource::{
  CacheKey, ChangeKind, EventOrigin, Resource, ResourceEvent, ResourceStatus, ResourceType,
};

use super::metadata::{SyncMetadata, SyncMetadataStore};
use super::source::ExternalSource;

/// Resources synced longer ago than this are refetched: five minutes.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 5 * 60;

/// Max per-resource fetches in flight during a sync pass.
pub const DEFAULT_CONCURRENCY: usize = 4;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of the initial sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  Idle,
  InProgress,
  Completed,
  Failed,
}

/// One resource (or batch) that failed during a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
  pub resource_type: Option<ResourceType>,
  pub resource_id: Option<String>,
  pub message: String,
}

impl SyncFailure {
  fn new(
    resource_type: Option<ResourceType>,
    resource_id: Option<&str>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      resource_type,
      resource_id: resource_id.map(String::from),
      message: message.into(),
    }
  }
}

/// Outcome of a sync pass.
///
/// `success` is a batch-level flag: individual fetch failures land in
/// `errors` without clearing it. Only a timeout does.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
  pub success: bool,
  pub total_resources: usize,
  pub synced_resources: usize,
  pub skipped_resources: usize,
  pub errors: Vec<SyncFailure>,
  pub timed_out: bool,
  pub duration_ms: u64,
}

/// What happened when a resource or event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
  /// The value was written to the cache and metadata
  Applied,
  /// A newer version is already mirrored
  Stale,
  /// The resource was evicted and its metadata dropped
  Removed,
}

enum FetchOutcome {
  NotStarted,
  TimedOut,
  Fetched(Result<Option<Resource>>),
}

/// Decides what is stale, fetches it, and writes it into the cache.
///
/// This is the only writer of sync metadata. Webhook ingest goes through
/// `apply_event`, which funnels into the same version-checked
/// `apply_resource` used by sync passes.
pub struct SyncCoordinator {
  cache: Arc<ResourceCache>,
  metadata: Arc<dyn SyncMetadataStore>,
  source: Arc<dyn ExternalSource>,
  stale_after: Duration,
  concurrency: usize,
  state: Mutex<SyncState>,
  apply_lock: Mutex<()>,
  events: broadcast::Sender<ResourceEvent>,
  event_seq: AtomicU64,
}

impl SyncCoordinator {
  pub fn new(
    cache: Arc<ResourceCache>,
    metadata: Arc<dyn SyncMetadataStore>,
    source: Arc<dyn ExternalSource>,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    Self {
      cache,
      metadata,
      source,
      stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
      concurrency: DEFAULT_CONCURRENCY,
      state: Mutex::new(SyncState::Idle),
      apply_lock: Mutex::new(()),
      events,
      event_seq: AtomicU64::new(0),
    }
  }

  /// Set the staleness threshold.
  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  /// Set the number of concurrent fetches during a sync pass.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  pub fn cache(&self) -> &Arc<ResourceCache> {
    &self.cache
  }

  pub fn state(&self) -> SyncState {
    *self.state.lock()
  }

  /// Receive every mutation applied from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
    self.events.subscribe()
  }

  /// Whether a resource should be refetched.
  ///
  /// True when there is no metadata, it was never synced, the cache no
  /// longer holds it, or the last sync is older than the stale threshold.
  pub fn needs_sync(&self, metadata: Option<&SyncMetadata>) -> bool {
    let Some(metadata) = metadata else {
      return true;
    };
    let Some(synced_at) = metadata.synced_at else {
      return true;
    };
    if !self.cache.contains(&metadata.key()) {
      return true;
    }
    Utc::now() - synced_at > self.stale_after
  }

  /// `needs_sync` for a key, reading its metadata first.
  pub fn needs_sync_for(&self, resource_type: ResourceType, id: &str) -> Result<bool> {
    let metadata = self.metadata.get_metadata(resource_type, id)?;
    Ok(self.needs_sync(metadata.as_ref()))
  }

  pub fn get_all_metadata(&self) -> Result<Vec<SyncMetadata>> {
    self.metadata.load_metadata()
  }

  pub fn get_metadata(
    &self,
    resource_type: ResourceType,
    id: &str,
  ) -> Result<Option<SyncMetadata>> {
    self.metadata.get_metadata(resource_type, id)
  }

  /// Preload resources of one type without touching sync metadata.
  pub fn warm_cache(&self, resource_type: ResourceType, resources: Vec<Resource>) -> usize {
    let resources: Vec<Resource> = resources
      .into_iter()
      .filter(|r| r.resource_type() == resource_type)
      .collect();
    let warmed = self.cache.warm(resources, &SetOptions::default());
    debug!(resource_type = %resource_type, warmed, "warmed cache");
    warmed
  }

  /// Reconcile every known resource against the source.
  ///
  /// Only one pass may run at a time. Types with no metadata at all are
  /// bootstrapped with a bulk fetch. When `timeout` elapses no new fetches
  /// start, in-flight ones are abandoned, and the partial report comes back
  /// with `success = false`. Writes already applied stay applied.
  pub async fn perform_initial_sync(&self, timeout: StdDuration) -> Result<SyncReport> {
    let guard = self.begin()?;
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;
    info!(timeout_ms = timeout.as_millis() as u64, "starting initial sync");

    let mut by_type: BTreeMap<ResourceType, Vec<SyncMetadata>> = BTreeMap::new();
    for row in self.metadata.load_metadata()? {
      by_type.entry(row.resource_type).or_default().push(row);
    }

    let mut report = SyncReport::default();
    let mut candidates = Vec::new();
    let mut bootstrap = Vec::new();
    for resource_type in ResourceType::ALL {
      match by_type.remove(&resource_type) {
        Some(rows) => {
          report.total_resources += rows.len();
          let (stale, fresh): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|m| self.needs_sync(Some(m)));
          debug!(
            resource_type = %resource_type,
            stale = stale.len(),
            fresh = fresh.len(),
            "planned sync"
          );
          report.skipped_resources += fresh.len();
          candidates.extend(stale);
        }
        None => bootstrap.push(resource_type),
      }
    }

    let mut timed_out = false;
    for resource_type in bootstrap {
      if tokio::time::Instant::now() >= deadline {
        timed_out = true;
        break;
      }
      match tokio::time::timeout_at(deadline, self.source.find_all(resource_type)).await {
        Err(_) => {
          timed_out = true;
          break;
        }
        Ok(Err(err)) => {
          warn!(resource_type = %resource_type, error = %err, "bootstrap fetch failed");
          report
            .errors
            .push(SyncFailure::new(Some(resource_type), None, err.to_string()));
        }
        Ok(Ok(resources)) => {
          report.total_resources += resources.len();
          for resource in resources {
            self.record_apply(&mut report, resource)?;
          }
        }
      }
    }

    if !timed_out {
      let mut fetches = stream::iter(candidates)
        .map(|meta| {
          let source = Arc::clone(&self.source);
          async move {
            if tokio::time::Instant::now() >= deadline {
              return (meta, FetchOutcome::NotStarted);
            }
            let outcome = match tokio::time::timeout_at(
              deadline,
              source.find_by_id(meta.resource_type, &meta.resource_id),
            )
            .await
            {
              Ok(result) => FetchOutcome::Fetched(result),
              Err(_) => FetchOutcome::TimedOut,
            };
            (meta, outcome)
          }
        })
        .buffer_unordered(self.concurrency);

      while let Some((meta, outcome)) = fetches.next().await {
        match outcome {
          FetchOutcome::NotStarted | FetchOutcome::TimedOut => timed_out = true,
          FetchOutcome::Fetched(Ok(Some(resource))) => self.record_apply(&mut report, resource)?,
          FetchOutcome::Fetched(Ok(None)) => {
            warn!(
              resource_type = %meta.resource_type,
              resource_id = %meta.resource_id,
              "resource no longer exists upstream"
            );
            self.remove_resource(&meta.key(), EventOrigin::Pull)?;
            report.errors.push(SyncFailure::new(
              Some(meta.resource_type),
              Some(meta.resource_id.as_str()),
              "not found upstream",
            ));
          }
          FetchOutcome::Fetched(Err(err)) => {
            warn!(
              resource_type = %meta.resource_type,
              resource_id = %meta.resource_id,
              error = %err,
              "fetch failed"
            );
            report.errors.push(SyncFailure::new(
              Some(meta.resource_type),
              Some(meta.resource_id.as_str()),
              err.to_string(),
            ));
          }
        }
      }
    }

    report.timed_out = timed_out;
    report.success = !timed_out;
    report.duration_ms = started.elapsed().as_millis() as u64;
    if timed_out {
      let err = SyncError::SyncTimeoutExceeded {
        elapsed: started.elapsed(),
      };
      warn!(synced = report.synced_resources, "{}", err);
      report.errors.push(SyncFailure::new(None, None, err.to_string()));
    }

    info!(
      success = report.success,
      total = report.total_resources,
      synced = report.synced_resources,
      skipped = report.skipped_resources,
      errors = report.errors.len(),
      "initial sync finished"
    );
    guard.finish(if report.success {
      SyncState::Completed
    } else {
      SyncState::Failed
    });
    Ok(report)
  }

  /// Refetch every resource of one type through the bulk lookup.
  ///
  /// With `force_sync` every fetched resource is re-applied. Without it,
  /// resources whose mirrored version already matches are skipped. Not
  /// guarded against concurrent passes; correctness relies on the
  /// version-checked apply.
  pub async fn sync_resource_type(
    &self,
    resource_type: ResourceType,
    force_sync: bool,
  ) -> Result<SyncReport> {
    let started = Instant::now();
    let resources = self
      .source
      .find_all(resource_type)
      .await
      .map_err(|err| match err {
        err @ SyncError::AdapterFetchFailed { .. } => err,
        other => SyncError::AdapterFetchFailed {
          resource_type,
          resource_id: "*".to_string(),
          message: other.to_string(),
        },
      })?;

    let mut report = SyncReport {
      total_resources: resources.len(),
      ..Default::default()
    };
    for resource in resources {
      if !force_sync && self.is_current(&resource)? {
        report.skipped_resources += 1;
        continue;
      }
      self.record_apply(&mut report, resource)?;
    }

    report.success = true;
    report.duration_ms = started.elapsed().as_millis() as u64;
    info!(
      resource_type = %resource_type,
      force_sync,
      synced = report.synced_resources,
      skipped = report.skipped_resources,
      "resource type sync finished"
    );
    Ok(report)
  }

  /// Apply a pushed or pulled change event.
  pub async fn apply_event(&self, event: &ResourceEvent) -> Result<ApplyOutcome> {
    match event.change_kind {
      ChangeKind::Deleted => self.remove_resource(&event.key(), event.origin),
      _ => {
        self
          .refresh_resource(event.resource_type, &event.resource_id, event.origin)
          .await
      }
    }
  }

  /// Fetch one resource and apply it. A resource gone upstream is removed.
  pub async fn refresh_resource(
    &self,
    resource_type: ResourceType,
    id: &str,
    origin: EventOrigin,
  ) -> Result<ApplyOutcome> {
    let fetched = self
      .source
      .find_by_id(resource_type, id)
      .await
      .map_err(|err| match err {
        err @ SyncError::AdapterFetchFailed { .. } => err,
        other => SyncError::AdapterFetchFailed {
          resource_type,
          resource_id: id.to_string(),
          message: other.to_string(),
        },
      })?;

    match fetched {
      Some(resource) => self.apply_resource(resource, origin),
      None => self.remove_resource(&CacheKey::new(resource_type, id), origin),
    }
  }

  /// Write a fetched resource into the cache and record its metadata.
  ///
  /// Updates older than the mirrored version are rejected (last write wins
  /// on version) and reported as `Stale`. A metadata write failure is
  /// returned as an error.
  pub fn apply_resource(&self, resource: Resource, origin: EventOrigin) -> Result<ApplyOutcome> {
    let _serial = self.apply_lock.lock();
    let key = resource.key();

    if let Some(previous) = self.metadata.get_metadata(key.resource_type, &key.id)? {
      if resource.version < previous.version {
        debug!(
          key = %key,
          current = previous.version,
          incoming = resource.version,
          "rejecting stale update"
        );
        return Ok(ApplyOutcome::Stale);
      }
    }

    let previous_status = self.cache.entry(&key).map(|entry| entry.value.status);
    let change_kind = change_kind_for(previous_status, &resource);
    let metadata = SyncMetadata::from_resource(&resource, Utc::now());

    match self.cache.set(resource, SetOptions::default()) {
      Ok(()) => {}
      Err(SyncError::VersionRegression { .. }) => return Ok(ApplyOutcome::Stale),
      Err(err) => return Err(err),
    }
    self.metadata.save_metadata(&metadata)?;

    self.publish(change_kind, &key, origin);
    Ok(ApplyOutcome::Applied)
  }

  /// Evict a resource from the cache without forgetting it was synced.
  ///
  /// The next pass sees it absent and refetches it.
  pub fn invalidate(&self, key: &CacheKey) -> bool {
    self.cache.delete(key)
  }

  /// Evict a resource and drop its metadata.
  pub fn remove_resource(&self, key: &CacheKey, origin: EventOrigin) -> Result<ApplyOutcome> {
    let _serial = self.apply_lock.lock();
    let evicted = self.cache.delete(key);
    let forgotten = self.metadata.delete_metadata(key.resource_type, &key.id)?;
    if evicted || forgotten {
      self.publish(ChangeKind::Deleted, key, origin);
    }
    Ok(ApplyOutcome::Removed)
  }

  fn begin(&self) -> Result<InProgressGuard<'_>> {
    let mut state = self.state.lock();
    if *state == SyncState::InProgress {
      return Err(SyncError::SyncAlreadyInProgress);
    }
    *state = SyncState::InProgress;
    Ok(InProgressGuard {
      state: &self.state,
      finished: false,
    })
  }

  fn record_apply(&self, report: &mut SyncReport, resource: Resource) -> Result<()> {
    match self.apply_resource(resource, EventOrigin::Pull)? {
      ApplyOutcome::Applied => report.synced_resources += 1,
      ApplyOutcome::Stale | ApplyOutcome::Removed => report.skipped_resources += 1,
    }
    Ok(())
  }

  fn is_current(&self, resource: &Resource) -> Result<bool> {
    let key = resource.key();
    let metadata = self.metadata.get_metadata(key.resource_type, &key.id)?;
    Ok(metadata.is_some_and(|m| m.version == resource.version) && self.cache.contains(&key))
  }

  fn publish(&self, change_kind: ChangeKind, key: &CacheKey, origin: EventOrigin) {
    let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
    let event = ResourceEvent {
      id: format!("local-{}", seq),
      change_kind,
      resource_type: key.resource_type,
      resource_id: key.id.clone(),
      timestamp: Utc::now(),
      payload: serde_json::Value::Null,
      origin,
    };
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

/// Marks the sync failed if the pass is dropped or errors out early.
struct InProgressGuard<'a> {
  state: &'a Mutex<SyncState>,
  finished: bool,
}

impl InProgressGuard<'_> {
  fn finish(mut self, outcome: SyncState) {
    *self.state.lock() = outcome;
    self.finished = true;
  }
}

impl Drop for InProgressGuard<'_> {
  fn drop(&mut self) {
    if !self.finished {
      *self.state.lock() = SyncState::Failed;
    }
  }
}

fn change_kind_for(previous: Option<ResourceStatus>, resource: &Resource) -> ChangeKind {
  if resource.is_deleted() {
    return ChangeKind::Deleted;
  }
  let Some(previous) = previous else {
    return ChangeKind::Created;
  };
  let is_done = |s: ResourceStatus| matches!(s, ResourceStatus::Closed | ResourceStatus::Completed);
  match (is_done(previous), is_done(resource.status)) {
    (false, true) => ChangeKind::Closed,
    (true, false) => ChangeKind::Reopened,
    _ => ChangeKind::Updated,
  }
}
