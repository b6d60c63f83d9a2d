//! Secondary indexes over cache keys.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::resource::{CacheKey, ResourceType};

use super::entry::CacheEntry;

/// Type, tag and namespace indexes over the keys held by the store.
///
/// The manager holds no locks of its own. It lives inside the same guarded
/// state as the entry map so that every store mutation and its index update
/// commit together.
#[derive(Debug, Default)]
pub struct IndexManager {
  by_type: HashMap<ResourceType, HashSet<CacheKey>>,
  by_tag: HashMap<String, HashSet<CacheKey>>,
  by_namespace: HashMap<String, HashSet<CacheKey>>,
}

impl IndexManager {
  pub fn add_to_indexes(
    &mut self,
    key: &CacheKey,
    tags: &BTreeSet<String>,
    namespaces: &BTreeSet<String>,
  ) {
    self
      .by_type
      .entry(key.resource_type)
      .or_default()
      .insert(key.clone());
    for tag in tags {
      self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
    }
    for ns in namespaces {
      self
        .by_namespace
        .entry(ns.clone())
        .or_default()
        .insert(key.clone());
    }
  }

  pub fn remove_from_indexes(&mut self, key: &CacheKey, entry: &CacheEntry) {
    remove_member(&mut self.by_type, &key.resource_type, key);
    for tag in &entry.tags {
      remove_member(&mut self.by_tag, tag, key);
    }
    for ns in &entry.namespaces {
      remove_member(&mut self.by_namespace, ns, key);
    }
  }

  /// Swap tag membership for a key from `old` to `new`.
  pub fn set_tags(&mut self, key: &CacheKey, old: &BTreeSet<String>, new: &BTreeSet<String>) {
    for tag in old.difference(new) {
      remove_member(&mut self.by_tag, tag, key);
    }
    for tag in new.difference(old) {
      self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
    }
  }

  pub fn by_type(&self, resource_type: ResourceType) -> Vec<CacheKey> {
    sorted(self.by_type.get(&resource_type))
  }

  pub fn by_tag(&self, tag: &str) -> Vec<CacheKey> {
    sorted(self.by_tag.get(tag))
  }

  pub fn by_namespace(&self, namespace: &str) -> Vec<CacheKey> {
    sorted(self.by_namespace.get(namespace))
  }

  /// Every key carrying at least one of the given tags.
  pub fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> BTreeSet<CacheKey> {
    tags
      .iter()
      .filter_map(|tag| self.by_tag.get(tag.as_ref()))
      .flat_map(|keys| keys.iter().cloned())
      .collect()
  }

  pub fn clear(&mut self) {
    self.by_type.clear();
    self.by_tag.clear();
    self.by_namespace.clear();
  }

  #[cfg(test)]
  pub(crate) fn all_tagged(&self) -> HashMap<String, HashSet<CacheKey>> {
    self.by_tag.clone()
  }

  #[cfg(test)]
  pub(crate) fn all_namespaced(&self) -> HashMap<String, HashSet<CacheKey>> {
    self.by_namespace.clone()
  }

  #[cfg(test)]
  pub(crate) fn all_typed(&self) -> HashMap<ResourceType, HashSet<CacheKey>> {
    self.by_type.clone()
  }
}

fn remove_member<K>(index: &mut HashMap<K, HashSet<CacheKey>>, bucket: &K, key: &CacheKey)
where
  K: std::hash::Hash + Eq,
{
  if let Some(keys) = index.get_mut(bucket) {
    keys.remove(key);
    if keys.is_empty() {
      index.remove(bucket);
    }
  }
}

fn sorted(keys: Option<&HashSet<CacheKey>>) -> Vec<CacheKey> {
  let mut keys: Vec<CacheKey> = keys.map(|k| k.iter().cloned().collect()).unwrap_or_default();
  keys.sort();
  keys
}

#[cfg(test)]
mod tests {
  use super::*;

  fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_set_tags_swaps_membership() {
    let mut idx = IndexManager::default();
    let key = CacheKey::new(ResourceType::Issue, "1");
    idx.add_to_indexes(&key, &set(&["a", "b"]), &set(&[]));

    idx.set_tags(&key, &set(&["a", "b"]), &set(&["b", "c"]));

    assert!(idx.by_tag("a").is_empty());
    assert_eq!(idx.by_tag("b"), vec![key.clone()]);
    assert_eq!(idx.by_tag("c"), vec![key]);
    assert!(!idx.all_tagged().contains_key("a"));
  }

  #[test]
  fn test_keys_for_tags_is_a_union() {
    let mut idx = IndexManager::default();
    let one = CacheKey::new(ResourceType::Issue, "1");
    let two = CacheKey::new(ResourceType::Issue, "2");
    idx.add_to_indexes(&one, &set(&["a"]), &set(&[]));
    idx.add_to_indexes(&two, &set(&["b"]), &set(&[]));

    let keys = idx.keys_for_tags(&["a", "b", "missing"]);
    assert_eq!(keys.len(), 2);
  }
}
