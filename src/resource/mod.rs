//! Mirrored resource model.
//!
//! Resources are owned by an external system of record (projects,
//! milestones, issues, sprints). The mirror only relies on their identity,
//! version and status; everything else lives in typed per-kind fields.

mod event;
mod types;

pub use event::{ChangeKind, EventOrigin, ResourceEvent};
pub use types::{
  CacheKey, IssueFields, MilestoneFields, ProjectFields, Resource, ResourceFields, ResourceStatus,
  ResourceType, SprintFields,
};
