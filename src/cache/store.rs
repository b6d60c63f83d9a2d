//! Resource store with lazily evaluated expiry.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, trace};

use crate::error::{Result, SyncError};
use crate::resource::{CacheKey, Resource, ResourceType};

use super::entry::{CacheEntry, CacheStats, Expiry, GetOptions, SetOptions};
use super::index::IndexManager;
use super::relations::RelationshipTable;

/// Default time-to-live for entries: one hour.
pub const DEFAULT_TTL_SECS: i64 = 60 * 60;

/// Entry map and indexes. Only ever touched under the cache lock.
#[derive(Debug, Default)]
struct CacheState {
  entries: HashMap<CacheKey, CacheEntry>,
  indexes: IndexManager,
}

impl CacheState {
  /// Store first, indexes second.
  fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
    if let Some(old) = self.entries.remove(&key) {
      self.indexes.remove_from_indexes(&key, &old);
    }
    self.entries.insert(key.clone(), entry);
    if let Some(stored) = self.entries.get(&key) {
      self
        .indexes
        .add_to_indexes(&key, &stored.tags, &stored.namespaces);
    }
  }

  /// Indexes first, store second.
  fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
    let entry = self.entries.get(key)?;
    self.indexes.remove_from_indexes(key, entry);
    self.entries.remove(key)
  }
}

/// In-process mirror of external resources.
///
/// Every mutation of the entry map and the secondary indexes happens under a
/// single write lock, so readers never observe an index entry without its
/// store entry or the other way round. Constructed once and shared by
/// `Arc` with the sync coordinator and webhook ingest.
#[derive(Debug)]
pub struct ResourceCache {
  state: RwLock<CacheState>,
  relations: RelationshipTable,
  default_ttl: Duration,
  hits: AtomicU64,
  misses: AtomicU64,
  expired: AtomicU64,
}

impl Default for ResourceCache {
  fn default() -> Self {
    Self::new(Duration::seconds(DEFAULT_TTL_SECS))
  }
}

impl ResourceCache {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      state: RwLock::new(CacheState::default()),
      relations: RelationshipTable::new(),
      default_ttl,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      expired: AtomicU64::new(0),
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Insert or overwrite an entry and re-index it.
  ///
  /// Rejects the write with `VersionRegression` when a live entry with a
  /// higher version is already stored. Equal versions overwrite.
  pub fn set(&self, resource: Resource, options: SetOptions) -> Result<()> {
    let key = resource.key();
    let now = Utc::now();
    let mut state = self.state.write();

    let existing = state
      .entries
      .get(&key)
      .map(|e| (e.is_expired_at(now), e.version));
    match existing {
      Some((true, _)) => {
        state.remove(&key);
        self.expired.fetch_add(1, Ordering::Relaxed);
      }
      Some((false, current)) if current > resource.version => {
        debug!(
          key = %key,
          current,
          incoming = resource.version,
          "rejecting stale update"
        );
        return Err(SyncError::VersionRegression {
          key,
          current,
          incoming: resource.version,
        });
      }
      _ => {}
    }

    let mut tags = options.tags;
    tags.extend(resource.derived_tags());
    let mut namespaces = options.namespaces;
    namespaces.extend(resource.derived_namespaces());

    let entry = CacheEntry {
      expires_at: self.expires_at(now, options.expiry),
      tags,
      namespaces,
      last_modified: resource.updated_at,
      version: resource.version,
      cached_at: now,
      value: resource,
    };
    state.insert(key, entry);
    Ok(())
  }

  /// Look up a resource. Expired entries are evicted and reported absent.
  pub fn get(
    &self,
    resource_type: ResourceType,
    id: &str,
    options: &GetOptions,
  ) -> Option<Resource> {
    let key = CacheKey::new(resource_type, id);
    let now = Utc::now();
    {
      let state = self.state.read();
      match state.entries.get(&key) {
        None => {
          self.misses.fetch_add(1, Ordering::Relaxed);
          return None;
        }
        Some(entry) if !entry.is_expired_at(now) => {
          if !is_visible(entry, options) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
          }
          self.hits.fetch_add(1, Ordering::Relaxed);
          return Some(entry.value.clone());
        }
        Some(_) => {}
      }
    }

    self.evict_if_expired(&key, now);
    self.misses.fetch_add(1, Ordering::Relaxed);
    None
  }

  /// Full entry for a key, including bookkeeping. Expired entries are evicted.
  pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
    let now = Utc::now();
    {
      let state = self.state.read();
      match state.entries.get(key) {
        None => return None,
        Some(entry) if !entry.is_expired_at(now) => return Some(entry.clone()),
        Some(_) => {}
      }
    }
    self.evict_if_expired(key, now);
    None
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.entry(key).is_some()
  }

  /// Remove an entry from the store and every index.
  pub fn delete(&self, key: &CacheKey) -> bool {
    self.state.write().remove(key).is_some()
  }

  /// Drop every entry. Relationship edges are kept.
  pub fn clear(&self) {
    let mut state = self.state.write();
    state.indexes.clear();
    state.entries.clear();
  }

  pub fn clear_by_type(&self, resource_type: ResourceType) -> usize {
    let mut state = self.state.write();
    let keys = state.indexes.by_type(resource_type);
    keys.iter().filter(|key| state.remove(key).is_some()).count()
  }

  pub fn get_by_type(&self, resource_type: ResourceType) -> Vec<Resource> {
    self.collect_live(|indexes| indexes.by_type(resource_type))
  }

  pub fn get_by_tag(&self, tag: &str) -> Vec<Resource> {
    self.collect_live(|indexes| indexes.by_tag(tag))
  }

  pub fn get_by_namespace(&self, namespace: &str) -> Vec<Resource> {
    self.collect_live(|indexes| indexes.by_namespace(namespace))
  }

  /// Extend an entry's expiry without touching its value.
  ///
  /// Returns false if the key is absent or already expired.
  pub fn refresh(&self, key: &CacheKey, ttl: Option<Duration>) -> bool {
    let now = Utc::now();
    let mut state = self.state.write();
    let expired = match state.entries.get(key) {
      None => return false,
      Some(entry) => entry.is_expired_at(now),
    };
    if expired {
      state.remove(key);
      self.expired.fetch_add(1, Ordering::Relaxed);
      return false;
    }
    let expires_at = now + ttl.unwrap_or(self.default_ttl);
    if let Some(entry) = state.entries.get_mut(key) {
      entry.expires_at = Some(expires_at);
    }
    true
  }

  /// Replace the full tag set of an entry.
  pub fn set_tags(&self, key: &CacheKey, tags: BTreeSet<String>) -> bool {
    let mut state = self.state.write();
    let CacheState { entries, indexes } = &mut *state;
    match entries.get_mut(key) {
      Some(entry) => {
        indexes.set_tags(key, &entry.tags, &tags);
        entry.tags = tags;
        true
      }
      None => false,
    }
  }

  /// Delete every entry carrying any of the given tags.
  pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
    let mut state = self.state.write();
    let keys = state.indexes.keys_for_tags(tags);
    let removed = keys.iter().filter(|key| state.remove(key).is_some()).count();
    debug!(removed, "invalidated entries by tag");
    removed
  }

  /// Delete every entry whose `type:id` form matches the regular expression.
  pub fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize> {
    let regex = Regex::new(pattern)?;
    let mut state = self.state.write();
    let keys: Vec<CacheKey> = state
      .entries
      .keys()
      .filter(|key| regex.is_match(&key.to_string()))
      .cloned()
      .collect();
    let removed = keys.iter().filter(|key| state.remove(key).is_some()).count();
    debug!(pattern, removed, "invalidated entries by pattern");
    Ok(removed)
  }

  /// Bulk preload, e.g. before the first sync pass.
  ///
  /// Resources older than what is already stored are skipped.
  pub fn warm(&self, resources: Vec<Resource>, options: &SetOptions) -> usize {
    resources
      .into_iter()
      .filter(|resource| self.set(resource.clone(), options.clone()).is_ok())
      .count()
  }

  /// Evict every expired entry. Expiry is otherwise only applied on read.
  pub fn purge_expired(&self) -> usize {
    let now = Utc::now();
    let mut state = self.state.write();
    let keys: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_expired_at(now))
      .map(|(key, _)| key.clone())
      .collect();
    let removed = keys.iter().filter(|key| state.remove(key).is_some()).count();
    self.expired.fetch_add(removed as u64, Ordering::Relaxed);
    if removed > 0 {
      trace!(removed, "purged expired entries");
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.state.read().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.state.read();
    let mut by_type = std::collections::BTreeMap::new();
    for key in state.entries.keys() {
      *by_type.entry(key.resource_type).or_insert(0) += 1;
    }
    CacheStats {
      entries: state.entries.len(),
      by_type,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      expired_evictions: self.expired.load(Ordering::Relaxed),
      relationships: self.relations.edge_count(),
    }
  }

  pub fn set_relationship(&self, source_id: &str, kind: &str, target_id: &str) -> bool {
    self.relations.set_relationship(source_id, kind, target_id)
  }

  pub fn get_relationships(&self, source_id: &str, kind: &str) -> Vec<String> {
    self.relations.get_relationships(source_id, kind)
  }

  pub fn remove_relationship(&self, source_id: &str, kind: &str, target_id: &str) -> bool {
    self.relations.remove_relationship(source_id, kind, target_id)
  }

  fn expires_at(&self, now: DateTime<Utc>, expiry: Expiry) -> Option<DateTime<Utc>> {
    match expiry {
      Expiry::Default => Some(now + self.default_ttl),
      Expiry::Never => None,
      Expiry::After(ttl) => Some(now + ttl),
    }
  }

  fn evict_if_expired(&self, key: &CacheKey, now: DateTime<Utc>) {
    let mut state = self.state.write();
    // Re-check: another writer may have replaced the entry in between.
    let expired = state
      .entries
      .get(key)
      .is_some_and(|entry| entry.is_expired_at(now));
    if expired {
      state.remove(key);
      self.expired.fetch_add(1, Ordering::Relaxed);
      trace!(key = %key, "evicted expired entry");
    }
  }

  fn collect_live<F>(&self, select: F) -> Vec<Resource>
  where
    F: FnOnce(&IndexManager) -> Vec<CacheKey>,
  {
    let now = Utc::now();
    let mut state = self.state.write();
    let keys = select(&state.indexes);
    let mut live = Vec::with_capacity(keys.len());
    for key in keys {
      let expired = match state.entries.get(&key) {
        Some(entry) => entry.is_expired_at(now),
        None => continue,
      };
      if expired {
        state.remove(&key);
        self.expired.fetch_add(1, Ordering::Relaxed);
        continue;
      }
      if let Some(entry) = state.entries.get(&key) {
        if !entry.value.is_deleted() {
          live.push(entry.value.clone());
        }
      }
    }
    live
  }

  #[cfg(test)]
  pub(crate) fn assert_indexes_consistent(&self) {
    use std::collections::HashSet;

    let state = self.state.read();
    let mut typed: HashMap<ResourceType, HashSet<CacheKey>> = HashMap::new();
    let mut tagged: HashMap<String, HashSet<CacheKey>> = HashMap::new();
    let mut namespaced: HashMap<String, HashSet<CacheKey>> = HashMap::new();
    for (key, entry) in &state.entries {
      typed
        .entry(key.resource_type)
        .or_default()
        .insert(key.clone());
      for tag in &entry.tags {
        tagged.entry(tag.clone()).or_default().insert(key.clone());
      }
      for ns in &entry.namespaces {
        namespaced.entry(ns.clone()).or_default().insert(key.clone());
      }
    }
    assert_eq!(state.indexes.all_typed(), typed);
    assert_eq!(state.indexes.all_tagged(), tagged);
    assert_eq!(state.indexes.all_namespaced(), namespaced);
  }
}

fn is_visible(entry: &CacheEntry, options: &GetOptions) -> bool {
  if entry.value.is_deleted() && !options.include_deleted {
    return false;
  }
  options.tags.iter().all(|tag| entry.tags.contains(tag))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resource::{IssueFields, ResourceFields, ResourceStatus, SprintFields};

  fn issue(id: &str, project: &str) -> Resource {
    Resource::new(
      id,
      ResourceFields::Issue(IssueFields {
        title: format!("Issue {}", id),
        project_id: Some(project.to_string()),
        ..Default::default()
      }),
    )
  }

  fn sprint(id: &str) -> Resource {
    Resource::new(
      id,
      ResourceFields::Sprint(SprintFields {
        title: format!("Sprint {}", id),
        ..Default::default()
      }),
    )
  }

  fn key(id: &str) -> CacheKey {
    CacheKey::new(ResourceType::Issue, id)
  }

  #[test]
  fn test_set_and_get() {
    let cache = ResourceCache::default();
    cache.set(issue("1", "P"), SetOptions::default()).unwrap();

    let got = cache.get(ResourceType::Issue, "1", &GetOptions::default());
    assert_eq!(got.map(|r| r.id), Some("1".to_string()));
    assert!(cache
      .get(ResourceType::Sprint, "1", &GetOptions::default())
      .is_none());
  }

  #[test]
  fn test_expired_entry_is_absent_and_unindexed() {
    let cache = ResourceCache::default();
    cache
      .set(
        issue("1", "P"),
        SetOptions::default().ttl(Duration::zero()).tag("hot"),
      )
      .unwrap();

    assert!(cache
      .get(ResourceType::Issue, "1", &GetOptions::default())
      .is_none());
    assert!(cache.is_empty());
    assert!(cache.get_by_tag("hot").is_empty());
    assert!(cache.get_by_namespace("project:P").is_empty());
    assert!(cache.get_by_type(ResourceType::Issue).is_empty());
    assert_eq!(cache.stats().expired_evictions, 1);
    cache.assert_indexes_consistent();
  }

  #[test]
  fn test_index_reads_evict_expired_entries() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P"), SetOptions::default().ttl(Duration::zero()))
      .unwrap();
    cache.set(issue("2", "P"), SetOptions::default()).unwrap();

    let live = cache.get_by_namespace("project:P");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "2");
    assert_eq!(cache.len(), 1);
    cache.assert_indexes_consistent();
  }

  #[test]
  fn test_overwrite_drops_stale_index_memberships() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P"), SetOptions::default().tag("old").namespace("team:a"))
      .unwrap();
    cache
      .set(
        issue("1", "Q").with_version(2),
        SetOptions::default().tag("new"),
      )
      .unwrap();

    assert!(cache.get_by_tag("old").is_empty());
    assert!(cache.get_by_namespace("team:a").is_empty());
    assert!(cache.get_by_namespace("project:P").is_empty());
    assert_eq!(cache.get_by_tag("new").len(), 1);
    assert_eq!(cache.get_by_namespace("project:Q").len(), 1);
    cache.assert_indexes_consistent();
  }

  #[test]
  fn test_indexes_track_store_through_mixed_operations() {
    let cache = ResourceCache::default();
    for i in 0..20 {
      let options = SetOptions::default().tag(format!("t{}", i % 3));
      cache.set(issue(&i.to_string(), "P"), options).unwrap();
      cache.set(sprint(&i.to_string()), SetOptions::default()).unwrap();
    }
    for i in (0..20).step_by(4) {
      cache.delete(&key(&i.to_string()));
    }
    cache.set_tags(&key("1"), ["x".to_string()].into_iter().collect());
    cache.invalidate_by_tags(&["t2"]);
    cache.clear_by_type(ResourceType::Sprint);
    cache.assert_indexes_consistent();

    let issues = cache.get_by_type(ResourceType::Issue);
    assert_eq!(issues.len(), cache.len());
    assert!(cache.get_by_type(ResourceType::Sprint).is_empty());
  }

  #[test]
  fn test_invalidate_by_tags_removes_any_match() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P"), SetOptions::default().tag("a").tag("b"))
      .unwrap();
    cache
      .set(issue("2", "P"), SetOptions::default().tag("b").tag("c"))
      .unwrap();
    cache
      .set(issue("3", "P"), SetOptions::default().tag("c"))
      .unwrap();

    assert_eq!(cache.invalidate_by_tags(&["b"]), 2);

    assert!(!cache.contains(&key("1")));
    assert!(!cache.contains(&key("2")));
    assert!(cache.contains(&key("3")));
    cache.assert_indexes_consistent();
  }

  #[test]
  fn test_invalidate_by_pattern() {
    let cache = ResourceCache::default();
    cache.set(issue("A-1", "P"), SetOptions::default()).unwrap();
    cache.set(issue("B-1", "P"), SetOptions::default()).unwrap();
    cache.set(sprint("A-1"), SetOptions::default()).unwrap();

    assert_eq!(cache.invalidate_by_pattern("^issue:A-").unwrap(), 1);
    assert!(!cache.contains(&key("A-1")));
    assert!(cache.contains(&CacheKey::new(ResourceType::Sprint, "A-1")));
    assert!(matches!(
      cache.invalidate_by_pattern("("),
      Err(SyncError::InvalidPattern(_))
    ));
  }

  #[test]
  fn test_older_version_is_rejected() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P").with_version(5), SetOptions::default())
      .unwrap();

    let result = cache.set(issue("1", "P").with_version(3), SetOptions::default());

    assert!(matches!(
      result,
      Err(SyncError::VersionRegression {
        current: 5,
        incoming: 3,
        ..
      })
    ));
    let stored = cache.get(ResourceType::Issue, "1", &GetOptions::default());
    assert_eq!(stored.map(|r| r.version), Some(5));
  }

  #[test]
  fn test_deleted_resources_hidden_unless_requested() {
    let cache = ResourceCache::default();
    cache
      .set(
        issue("1", "P").with_status(ResourceStatus::Deleted),
        SetOptions::default(),
      )
      .unwrap();

    assert!(cache
      .get(ResourceType::Issue, "1", &GetOptions::default())
      .is_none());
    assert!(cache
      .get(ResourceType::Issue, "1", &GetOptions::default().include_deleted())
      .is_some());
    assert!(cache.get_by_type(ResourceType::Issue).is_empty());
  }

  #[test]
  fn test_get_with_tag_filter() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P"), SetOptions::default().tag("a"))
      .unwrap();

    let opts = GetOptions::default().with_tag("a");
    assert!(cache.get(ResourceType::Issue, "1", &opts).is_some());
    let opts = GetOptions::default().with_tag("a").with_tag("z");
    assert!(cache.get(ResourceType::Issue, "1", &opts).is_none());
  }

  #[test]
  fn test_refresh_extends_expiry_without_touching_value() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P"), SetOptions::default().ttl(Duration::seconds(5)))
      .unwrap();
    let before = cache.entry(&key("1")).unwrap();

    assert!(cache.refresh(&key("1"), Some(Duration::hours(2))));

    let after = cache.entry(&key("1")).unwrap();
    assert!(after.expires_at > before.expires_at);
    assert_eq!(after.value, before.value);
    assert!(!cache.refresh(&key("missing"), None));
  }

  #[test]
  fn test_purge_expired() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P"), SetOptions::default().ttl(Duration::zero()))
      .unwrap();
    cache
      .set(issue("2", "P"), SetOptions::default().no_expiry())
      .unwrap();

    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.len(), 1);
    cache.assert_indexes_consistent();
  }

  #[test]
  fn test_edges_survive_resource_deletion() {
    let cache = ResourceCache::default();
    cache.set(issue("1", "P"), SetOptions::default()).unwrap();
    cache.set_relationship("1", "depends-on", "2");

    cache.delete(&key("1"));

    assert_eq!(cache.get_relationships("1", "depends-on"), vec!["2"]);
  }

  #[test]
  fn test_warm_skips_regressions() {
    let cache = ResourceCache::default();
    cache
      .set(issue("1", "P").with_version(4), SetOptions::default())
      .unwrap();

    let warmed = cache.warm(
      vec![issue("1", "P").with_version(2), issue("2", "P")],
      &SetOptions::default(),
    );

    assert_eq!(warmed, 1);
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_stats_count_hits_and_misses() {
    let cache = ResourceCache::default();
    cache.set(issue("1", "P"), SetOptions::default()).unwrap();
    cache.get(ResourceType::Issue, "1", &GetOptions::default());
    cache.get(ResourceType::Issue, "2", &GetOptions::default());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.by_type.get(&ResourceType::Issue), Some(&1));
  }
}
