//! Webhook payload types and per-kind conversion into resource events.
//!
//! Payload types are kept separate from the resource model so that only the
//! fields needed to identify a change are deserialized.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::resource::{ChangeKind, EventOrigin, ResourceEvent, ResourceType};

/// Declared kind of a delivery (the event-name header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookKind {
  Project,
  ProjectItem,
  Milestone,
  Issue,
  PullRequest,
  Ping,
  /// Classic project boards, superseded upstream
  Legacy(String),
  Unsupported(String),
}

impl WebhookKind {
  pub fn parse(kind: &str) -> Self {
    match kind.trim() {
      "projects_v2" => WebhookKind::Project,
      "projects_v2_item" => WebhookKind::ProjectItem,
      "milestone" => WebhookKind::Milestone,
      "issues" => WebhookKind::Issue,
      "pull_request" => WebhookKind::PullRequest,
      "ping" => WebhookKind::Ping,
      legacy @ ("project" | "project_card" | "project_column") => {
        WebhookKind::Legacy(legacy.to_string())
      }
      other => WebhookKind::Unsupported(other.to_string()),
    }
  }
}

// ============================================================================
// Payload types
// ============================================================================

/// Identity fields shared by every upstream object.
#[derive(Debug, Deserialize)]
pub struct ApiObject {
  #[serde(default)]
  pub id: Option<serde_json::Value>,
  #[serde(default)]
  pub node_id: Option<String>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl ApiObject {
  /// Global node id when present, numeric id otherwise.
  fn resource_id(&self) -> Option<String> {
    if let Some(node_id) = self.node_id.as_ref().filter(|n| !n.is_empty()) {
      return Some(node_id.clone());
    }
    match self.id.as_ref()? {
      serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
      serde_json::Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }
}

#[derive(Debug, Deserialize)]
struct IssuesPayload {
  action: String,
  issue: ApiObject,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
  action: String,
  pull_request: ApiObject,
}

#[derive(Debug, Deserialize)]
struct MilestonePayload {
  action: String,
  milestone: ApiObject,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
  action: String,
  projects_v2: ApiObject,
}

#[derive(Debug, Deserialize)]
struct ApiProjectItem {
  #[serde(default)]
  project_node_id: Option<String>,
  #[serde(default)]
  content_node_id: Option<String>,
  #[serde(default)]
  content_type: Option<String>,
  #[serde(default)]
  updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ProjectItemPayload {
  action: String,
  projects_v2_item: ApiProjectItem,
}

// ============================================================================
// Conversion
// ============================================================================

/// Builds events for one delivery, numbering them within it.
struct EventBuilder<'a> {
  delivery_id: &'a str,
  events: Vec<ResourceEvent>,
}

impl<'a> EventBuilder<'a> {
  fn new(delivery_id: &'a str) -> Self {
    Self {
      delivery_id,
      events: Vec::new(),
    }
  }

  fn push(
    &mut self,
    change_kind: ChangeKind,
    resource_type: ResourceType,
    resource_id: String,
    timestamp: Option<DateTime<Utc>>,
    payload: &serde_json::Value,
  ) {
    let id = format!("{}:{}", self.delivery_id, self.events.len());
    self.events.push(ResourceEvent {
      id,
      change_kind,
      resource_type,
      resource_id,
      timestamp: timestamp.unwrap_or_else(Utc::now),
      payload: payload.clone(),
      origin: EventOrigin::Push,
    });
  }
}

/// Convert a delivery of a supported kind into events.
///
/// Actions outside the change vocabulary yield no events. Malformed payloads
/// yield an error message.
pub fn convert(
  kind: &WebhookKind,
  delivery_id: &str,
  payload: &serde_json::Value,
) -> Result<Vec<ResourceEvent>, String> {
  let mut builder = EventBuilder::new(delivery_id);
  match kind {
    WebhookKind::Issue => {
      let p: IssuesPayload = parse(payload, "issues")?;
      simple(&mut builder, &p.action, ResourceType::Issue, &p.issue, payload, "issue")?;
    }
    // Pull requests share the issue id space upstream
    WebhookKind::PullRequest => {
      let p: PullRequestPayload = parse(payload, "pull_request")?;
      simple(
        &mut builder,
        &p.action,
        ResourceType::Issue,
        &p.pull_request,
        payload,
        "pull_request",
      )?;
    }
    WebhookKind::Milestone => {
      let p: MilestonePayload = parse(payload, "milestone")?;
      simple(
        &mut builder,
        &p.action,
        ResourceType::Milestone,
        &p.milestone,
        payload,
        "milestone",
      )?;
    }
    WebhookKind::Project => {
      let p: ProjectPayload = parse(payload, "projects_v2")?;
      simple(
        &mut builder,
        &p.action,
        ResourceType::Project,
        &p.projects_v2,
        payload,
        "projects_v2",
      )?;
    }
    WebhookKind::ProjectItem => {
      let p: ProjectItemPayload = parse(payload, "projects_v2_item")?;
      project_item(&mut builder, &p, payload)?;
    }
    WebhookKind::Ping | WebhookKind::Legacy(_) | WebhookKind::Unsupported(_) => {}
  }
  Ok(builder.events)
}

fn parse<T: DeserializeOwned>(payload: &serde_json::Value, what: &str) -> Result<T, String> {
  T::deserialize(payload).map_err(|e| format!("malformed {} payload: {}", what, e))
}

fn simple(
  builder: &mut EventBuilder<'_>,
  action: &str,
  resource_type: ResourceType,
  object: &ApiObject,
  payload: &serde_json::Value,
  what: &str,
) -> Result<(), String> {
  let Some(change_kind) = ChangeKind::from_action(action) else {
    return Ok(());
  };
  let resource_id = object
    .resource_id()
    .ok_or_else(|| format!("{} payload has no id", what))?;
  builder.push(change_kind, resource_type, resource_id, object.updated_at, payload);
  Ok(())
}

/// An item change touches the item's content and its owning project.
///
/// Both are refreshed for every tracked action. Removing an item from a
/// board leaves its content alive upstream, so the source decides whether
/// the issue still exists.
fn project_item(
  builder: &mut EventBuilder<'_>,
  p: &ProjectItemPayload,
  payload: &serde_json::Value,
) -> Result<(), String> {
  if ChangeKind::from_action(&p.action).is_none() {
    return Ok(());
  }
  let item = &p.projects_v2_item;

  let is_issue_like = matches!(
    item.content_type.as_deref(),
    Some("Issue") | Some("PullRequest")
  );
  if is_issue_like {
    let content_id = item
      .content_node_id
      .clone()
      .filter(|id| !id.is_empty())
      .ok_or_else(|| "projects_v2_item payload has no content_node_id".to_string())?;
    builder.push(
      ChangeKind::Updated,
      ResourceType::Issue,
      content_id,
      item.updated_at,
      payload,
    );
  }

  let project_id = item
    .project_node_id
    .clone()
    .filter(|id| !id.is_empty())
    .ok_or_else(|| "projects_v2_item payload has no project_node_id".to_string())?;
  builder.push(
    ChangeKind::Updated,
    ResourceType::Project,
    project_id,
    item.updated_at,
    payload,
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_kinds() {
    assert_eq!(WebhookKind::parse("issues"), WebhookKind::Issue);
    assert_eq!(WebhookKind::parse("projects_v2_item"), WebhookKind::ProjectItem);
    assert_eq!(
      WebhookKind::parse("project_card"),
      WebhookKind::Legacy("project_card".to_string())
    );
    assert_eq!(
      WebhookKind::parse("star"),
      WebhookKind::Unsupported("star".to_string())
    );
  }

  #[test]
  fn test_issue_opened() {
    let payload = json!({
      "action": "opened",
      "issue": { "id": 1, "node_id": "I_kw1", "updated_at": "2024-03-01T10:00:00Z" }
    });

    let events = convert(&WebhookKind::Issue, "d-1", &payload).unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "d-1:0");
    assert_eq!(events[0].change_kind, ChangeKind::Created);
    assert_eq!(events[0].resource_type, ResourceType::Issue);
    assert_eq!(events[0].resource_id, "I_kw1");
    assert_eq!(events[0].origin, EventOrigin::Push);
    assert_eq!(events[0].timestamp.to_rfc3339(), "2024-03-01T10:00:00+00:00");
  }

  #[test]
  fn test_numeric_id_fallback() {
    let payload = json!({ "action": "closed", "milestone": { "id": 42 } });

    let events = convert(&WebhookKind::Milestone, "d-2", &payload).unwrap();

    assert_eq!(events[0].resource_id, "42");
    assert_eq!(events[0].change_kind, ChangeKind::Closed);
  }

  #[test]
  fn test_pull_request_maps_to_issue() {
    let payload = json!({ "action": "reopened", "pull_request": { "node_id": "PR_1" } });

    let events = convert(&WebhookKind::PullRequest, "d-3", &payload).unwrap();

    assert_eq!(events[0].resource_type, ResourceType::Issue);
    assert_eq!(events[0].change_kind, ChangeKind::Reopened);
  }

  #[test]
  fn test_unmapped_action_yields_nothing() {
    let payload = json!({ "action": "labeled", "issue": { "node_id": "I_1" } });
    assert!(convert(&WebhookKind::Issue, "d-4", &payload)
      .unwrap()
      .is_empty());
  }

  #[test]
  fn test_project_item_refreshes_content_and_project() {
    let payload = json!({
      "action": "deleted",
      "projects_v2_item": {
        "project_node_id": "PVT_1",
        "content_node_id": "I_9",
        "content_type": "Issue"
      }
    });

    let events = convert(&WebhookKind::ProjectItem, "d-5", &payload).unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].resource_id, "I_9");
    assert_eq!(events[0].change_kind, ChangeKind::Updated);
    assert_eq!(events[1].resource_type, ResourceType::Project);
    assert_eq!(events[1].change_kind, ChangeKind::Updated);
    assert_eq!(events[1].id, "d-5:1");
  }

  #[test]
  fn test_draft_item_only_touches_project() {
    let payload = json!({
      "action": "created",
      "projects_v2_item": { "project_node_id": "PVT_1", "content_type": "DraftIssue" }
    });

    let events = convert(&WebhookKind::ProjectItem, "d-6", &payload).unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource_id, "PVT_1");
  }

  #[test]
  fn test_malformed_payloads_are_errors() {
    let missing_object = json!({ "action": "opened" });
    assert!(convert(&WebhookKind::Issue, "d-7", &missing_object).is_err());

    let missing_id = json!({ "action": "opened", "issue": {} });
    let err = convert(&WebhookKind::Issue, "d-8", &missing_id).unwrap_err();
    assert_eq!(err, "issue payload has no id");
  }
}
