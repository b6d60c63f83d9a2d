use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{CacheKey, ResourceType};

/// What happened to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Created,
  Updated,
  Deleted,
  Closed,
  Reopened,
}

impl ChangeKind {
  /// Map an upstream action verb onto the fixed change vocabulary.
  ///
  /// Unknown actions (assigned, labeled, archived, ...) produce no event.
  pub fn from_action(action: &str) -> Option<Self> {
    match action {
      "created" | "opened" => Some(ChangeKind::Created),
      "edited" | "updated" => Some(ChangeKind::Updated),
      "deleted" => Some(ChangeKind::Deleted),
      "closed" => Some(ChangeKind::Closed),
      "reopened" => Some(ChangeKind::Reopened),
      _ => None,
    }
  }
}

/// Which path produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
  /// Pushed by the system of record (webhook)
  Push,
  /// Observed by a reconciliation pass
  Pull,
}

/// A typed change notification for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
  pub id: String,
  pub change_kind: ChangeKind,
  pub resource_type: ResourceType,
  pub resource_id: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub payload: serde_json::Value,
  pub origin: EventOrigin,
}

impl ResourceEvent {
  pub fn key(&self) -> CacheKey {
    CacheKey::new(self.resource_type, self.resource_id.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_action_vocabulary() {
    assert_eq!(ChangeKind::from_action("opened"), Some(ChangeKind::Created));
    assert_eq!(ChangeKind::from_action("created"), Some(ChangeKind::Created));
    assert_eq!(ChangeKind::from_action("edited"), Some(ChangeKind::Updated));
    assert_eq!(ChangeKind::from_action("updated"), Some(ChangeKind::Updated));
    assert_eq!(ChangeKind::from_action("deleted"), Some(ChangeKind::Deleted));
    assert_eq!(ChangeKind::from_action("closed"), Some(ChangeKind::Closed));
    assert_eq!(ChangeKind::from_action("reopened"), Some(ChangeKind::Reopened));
  }

  #[test]
  fn test_unknown_actions_are_filtered() {
    assert_eq!(ChangeKind::from_action("labeled"), None);
    assert_eq!(ChangeKind::from_action("archived"), None);
    assert_eq!(ChangeKind::from_action(""), None);
  }
}
