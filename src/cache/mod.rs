//! In-memory resource store with secondary indexes.
//!
//! This module provides the mirror's storage layer:
//! - A keyed store of resources with per-entry TTL evaluated lazily on read
//! - Type, tag and namespace indexes kept consistent with the store
//! - A relationship edge table independent of the store lifecycle

mod entry;
mod index;
mod relations;
mod store;

pub use entry::{CacheEntry, CacheStats, Expiry, GetOptions, SetOptions};
pub use index::IndexManager;
pub use relations::RelationshipTable;
pub use store::{ResourceCache, DEFAULT_TTL_SECS};
