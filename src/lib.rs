//! In-process mirror of project-management resources.
//!
//! A `ResourceCache` holds projects, milestones, issues and sprints with
//! type, tag and namespace indexes. A `SyncCoordinator` keeps it consistent
//! with the system of record through reconciliation passes, and
//! `WebhookIngest` applies pushed changes through the same write path.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod resource;
pub mod sync;
pub mod webhook;

pub use cache::{GetOptions, ResourceCache, SetOptions};
pub use error::{Result, SyncError};
pub use resource::{CacheKey, Resource, ResourceEvent, ResourceType};
pub use sync::{SyncCoordinator, SyncReport};
pub use webhook::WebhookIngest;
