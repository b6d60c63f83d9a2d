use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of mirrored resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Project,
  Milestone,
  Issue,
  Sprint,
}

impl ResourceType {
  pub const ALL: [ResourceType; 4] = [
    ResourceType::Project,
    ResourceType::Milestone,
    ResourceType::Issue,
    ResourceType::Sprint,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Project => "project",
      ResourceType::Milestone => "milestone",
      ResourceType::Issue => "issue",
      ResourceType::Sprint => "sprint",
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "project" | "projects" => Ok(ResourceType::Project),
      "milestone" | "milestones" => Ok(ResourceType::Milestone),
      "issue" | "issues" => Ok(ResourceType::Issue),
      "sprint" | "sprints" => Ok(ResourceType::Sprint),
      other => Err(format!("unknown resource type '{}'", other)),
    }
  }
}

/// Lifecycle status shared by every resource kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
  #[default]
  Active,
  Closed,
  Completed,
  Planned,
  Deleted,
}

impl ResourceStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceStatus::Active => "active",
      ResourceStatus::Closed => "closed",
      ResourceStatus::Completed => "completed",
      ResourceStatus::Planned => "planned",
      ResourceStatus::Deleted => "deleted",
    }
  }
}

/// Composite cache key. Unique across all resource types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
  pub resource_type: ResourceType,
  pub id: String,
}

impl CacheKey {
  pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
    Self {
      resource_type,
      id: id.into(),
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.resource_type, self.id)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectFields {
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MilestoneFields {
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueFields {
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub milestone_id: Option<String>,
  #[serde(default)]
  pub sprint_id: Option<String>,
  #[serde(default)]
  pub labels: Vec<String>,
  #[serde(default)]
  pub assignees: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SprintFields {
  pub title: String,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub start_date: Option<DateTime<Utc>>,
  #[serde(default)]
  pub end_date: Option<DateTime<Utc>>,
}

/// Type-specific data, one variant per resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResourceFields {
  Project(ProjectFields),
  Milestone(MilestoneFields),
  Issue(IssueFields),
  Sprint(SprintFields),
}

impl ResourceFields {
  pub fn resource_type(&self) -> ResourceType {
    match self {
      ResourceFields::Project(_) => ResourceType::Project,
      ResourceFields::Milestone(_) => ResourceType::Milestone,
      ResourceFields::Issue(_) => ResourceType::Issue,
      ResourceFields::Sprint(_) => ResourceType::Sprint,
    }
  }

  pub fn title(&self) -> &str {
    match self {
      ResourceFields::Project(f) => &f.title,
      ResourceFields::Milestone(f) => &f.title,
      ResourceFields::Issue(f) => &f.title,
      ResourceFields::Sprint(f) => &f.title,
    }
  }

  /// Owning project, if the resource belongs to one
  pub fn project_id(&self) -> Option<&str> {
    match self {
      ResourceFields::Project(_) => None,
      ResourceFields::Milestone(f) => f.project_id.as_deref(),
      ResourceFields::Issue(f) => f.project_id.as_deref(),
      ResourceFields::Sprint(f) => f.project_id.as_deref(),
    }
  }
}

/// A mirrored business object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
  pub id: String,
  pub version: i64,
  #[serde(default)]
  pub status: ResourceStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub deleted_at: Option<DateTime<Utc>>,
  pub fields: ResourceFields,
}

impl Resource {
  /// Create an active resource at version 1, stamped now.
  pub fn new(id: impl Into<String>, fields: ResourceFields) -> Self {
    let now = Utc::now();
    Self {
      id: id.into(),
      version: 1,
      status: ResourceStatus::Active,
      created_at: now,
      updated_at: now,
      deleted_at: None,
      fields,
    }
  }

  pub fn with_version(mut self, version: i64) -> Self {
    self.version = version;
    self
  }

  pub fn with_status(mut self, status: ResourceStatus) -> Self {
    self.status = status;
    if status == ResourceStatus::Deleted && self.deleted_at.is_none() {
      self.deleted_at = Some(self.updated_at);
    }
    self
  }

  pub fn resource_type(&self) -> ResourceType {
    self.fields.resource_type()
  }

  pub fn key(&self) -> CacheKey {
    CacheKey::new(self.resource_type(), self.id.clone())
  }

  pub fn is_deleted(&self) -> bool {
    self.status == ResourceStatus::Deleted || self.deleted_at.is_some()
  }

  /// Tags implied by the resource itself: its status and, for issues, labels.
  pub fn derived_tags(&self) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    tags.insert(format!("status:{}", self.status.as_str()));
    if let ResourceFields::Issue(issue) = &self.fields {
      for label in &issue.labels {
        tags.insert(format!("label:{}", label.to_lowercase()));
      }
    }
    tags
  }

  /// Namespaces implied by the resource: the project it belongs to.
  pub fn derived_namespaces(&self) -> BTreeSet<String> {
    let mut namespaces = BTreeSet::new();
    match &self.fields {
      ResourceFields::Project(_) => {
        namespaces.insert(format!("project:{}", self.id));
      }
      fields => {
        if let Some(project) = fields.project_id() {
          namespaces.insert(format!("project:{}", project));
        }
      }
    }
    namespaces
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn issue(labels: &[&str]) -> Resource {
    Resource::new(
      "I-1",
      ResourceFields::Issue(IssueFields {
        title: "Fix login".to_string(),
        project_id: Some("P-1".to_string()),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        ..Default::default()
      }),
    )
  }

  #[test]
  fn test_type_follows_fields() {
    let r = issue(&[]);
    assert_eq!(r.resource_type(), ResourceType::Issue);
    assert_eq!(r.key().to_string(), "issue:I-1");
  }

  #[test]
  fn test_derived_tags_include_status_and_labels() {
    let tags = issue(&["Bug", "ui"]).derived_tags();
    assert!(tags.contains("status:active"));
    assert!(tags.contains("label:bug"));
    assert!(tags.contains("label:ui"));
  }

  #[test]
  fn test_project_is_its_own_namespace() {
    let p = Resource::new(
      "P-1",
      ResourceFields::Project(ProjectFields {
        title: "Apollo".to_string(),
        ..Default::default()
      }),
    );
    assert!(p.derived_namespaces().contains("project:P-1"));
    assert!(issue(&[]).derived_namespaces().contains("project:P-1"));
  }

  #[test]
  fn test_parse_resource_type() {
    assert_eq!("Issues".parse::<ResourceType>(), Ok(ResourceType::Issue));
    assert!("epic".parse::<ResourceType>().is_err());
  }

  #[test]
  fn test_snapshot_json_shape() {
    let json = r#"{
      "id": "S-1",
      "version": 4,
      "status": "planned",
      "created_at": "2024-01-01T00:00:00Z",
      "updated_at": "2024-01-02T00:00:00Z",
      "fields": { "type": "sprint", "title": "Sprint 1", "project_id": "P-1" }
    }"#;
    let r: Resource = serde_json::from_str(json).unwrap();
    assert_eq!(r.resource_type(), ResourceType::Sprint);
    assert_eq!(r.status, ResourceStatus::Planned);
    assert_eq!(r.fields.project_id(), Some("P-1"));
  }

  #[test]
  fn test_deleted_status_stamps_deleted_at() {
    let r = issue(&[]).with_status(ResourceStatus::Deleted);
    assert!(r.is_deleted());
    assert!(r.deleted_at.is_some());
  }
}
