//! Directed relationship edges between resources.
//!
//! Edges are independent of the store lifecycle: deleting a resource does not
//! cascade to its edges. Callers that care about orphans filter at read time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

/// Edge table indexed by source id, then relation kind.
#[derive(Debug, Default)]
pub struct RelationshipTable {
  edges: RwLock<HashMap<String, BTreeMap<String, BTreeSet<String>>>>,
}

impl RelationshipTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an edge. Returns false if it already existed.
  pub fn set_relationship(&self, source_id: &str, kind: &str, target_id: &str) -> bool {
    self
      .edges
      .write()
      .entry(source_id.to_string())
      .or_default()
      .entry(kind.to_string())
      .or_default()
      .insert(target_id.to_string())
  }

  pub fn get_relationships(&self, source_id: &str, kind: &str) -> Vec<String> {
    self
      .edges
      .read()
      .get(source_id)
      .and_then(|kinds| kinds.get(kind))
      .map(|targets| targets.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Remove an edge. Returns true if it existed.
  pub fn remove_relationship(&self, source_id: &str, kind: &str, target_id: &str) -> bool {
    let mut edges = self.edges.write();
    let Some(kinds) = edges.get_mut(source_id) else {
      return false;
    };
    let removed = kinds
      .get_mut(kind)
      .map(|targets| targets.remove(target_id))
      .unwrap_or(false);
    if kinds.get(kind).is_some_and(|targets| targets.is_empty()) {
      kinds.remove(kind);
    }
    if kinds.is_empty() {
      edges.remove(source_id);
    }
    removed
  }

  pub fn edge_count(&self) -> usize {
    self
      .edges
      .read()
      .values()
      .flat_map(|kinds| kinds.values())
      .map(|targets| targets.len())
      .sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_many_to_many_edges() {
    let table = RelationshipTable::new();
    assert!(table.set_relationship("I-1", "depends-on", "I-2"));
    assert!(table.set_relationship("I-1", "depends-on", "I-3"));
    assert!(table.set_relationship("I-4", "depends-on", "I-2"));
    assert!(!table.set_relationship("I-1", "depends-on", "I-2"));

    assert_eq!(table.get_relationships("I-1", "depends-on"), vec!["I-2", "I-3"]);
    assert_eq!(table.get_relationships("I-4", "depends-on"), vec!["I-2"]);
    assert!(table.get_relationships("I-1", "blocks").is_empty());
    assert_eq!(table.edge_count(), 3);
  }

  #[test]
  fn test_remove_prunes_empty_buckets() {
    let table = RelationshipTable::new();
    table.set_relationship("I-1", "depends-on", "I-2");

    assert!(table.remove_relationship("I-1", "depends-on", "I-2"));
    assert!(!table.remove_relationship("I-1", "depends-on", "I-2"));
    assert!(!table.edges.read().contains_key("I-1"));
    assert_eq!(table.edge_count(), 0);
  }
}
