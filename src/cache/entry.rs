//! Cache entry and per-call options.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::resource::{Resource, ResourceType};

/// A stored resource plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Resource,
  /// None means the entry never expires
  pub expires_at: Option<DateTime<Utc>>,
  pub tags: BTreeSet<String>,
  pub namespaces: BTreeSet<String>,
  /// Upstream modification time of the stored value
  pub last_modified: DateTime<Utc>,
  pub version: i64,
  /// When the entry was written locally
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }
}

/// How long an entry lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
  /// Use the cache's configured default TTL
  #[default]
  Default,
  /// Keep until deleted or invalidated
  Never,
  After(Duration),
}

/// Options for `ResourceCache::set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
  pub expiry: Expiry,
  /// Extra tags, merged with the ones derived from the resource
  pub tags: BTreeSet<String>,
  /// Extra namespaces, merged with the ones derived from the resource
  pub namespaces: BTreeSet<String>,
}

impl SetOptions {
  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.expiry = Expiry::After(ttl);
    self
  }

  pub fn no_expiry(mut self) -> Self {
    self.expiry = Expiry::Never;
    self
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespaces.insert(namespace.into());
    self
  }
}

/// Options for `ResourceCache::get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
  /// Only return the value if the entry carries every one of these tags
  pub tags: BTreeSet<String>,
  /// Return resources whose status is `deleted`
  pub include_deleted: bool,
}

impl GetOptions {
  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn include_deleted(mut self) -> Self {
    self.include_deleted = true;
    self
  }
}

/// Point-in-time counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub by_type: BTreeMap<ResourceType, usize>,
  pub hits: u64,
  pub misses: u64,
  pub expired_evictions: u64,
  pub relationships: usize,
}
