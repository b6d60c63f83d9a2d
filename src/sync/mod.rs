//! State synchronization with the system of record.
//!
//! - `SyncCoordinator` decides what is stale, fetches it through an
//!   `ExternalSource`, and applies it to the cache with last-write-wins on
//!   version
//! - `SyncMetadataStore` keeps what was synced when, durably, so a restart
//!   does not need a full remirror
//! - `Reconciler` runs passes on a schedule

mod coordinator;
mod metadata;
mod reconciler;
mod source;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{
  ApplyOutcome, SyncCoordinator, SyncFailure, SyncReport, SyncState, DEFAULT_CONCURRENCY,
  DEFAULT_STALE_AFTER_SECS,
};
pub use metadata::{MemoryMetadataStore, SyncMetadata, SyncMetadataStore};
pub use reconciler::{ReconcileSchedule, Reconciler};
pub use source::{ExternalSource, SnapshotSource};
pub use sqlite::SqliteMetadataStore;
