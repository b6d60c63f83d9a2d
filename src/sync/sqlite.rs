//! SQLite-backed sync metadata store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, SyncError};
use crate::resource::ResourceType;

use super::metadata::{SyncMetadata, SyncMetadataStore};

/// Schema for the metadata table.
const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_metadata (
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    version INTEGER NOT NULL,
    synced_at TEXT,
    PRIMARY KEY (resource_type, resource_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_metadata_synced
    ON sync_metadata(resource_type, synced_at);
"#;

const SELECT_COLUMNS: &str =
  "SELECT resource_type, resource_id, last_modified, version, synced_at FROM sync_metadata";

/// Durable metadata store in a single SQLite file.
pub struct SqliteMetadataStore {
  conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::MetadataPersistenceFailed(format!(
          "Failed to create metadata directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::MetadataPersistenceFailed(format!(
        "Failed to open metadata database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::with_connection(conn)
  }

  /// Store backed by a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("pm-mirror").join("metadata.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(METADATA_SCHEMA).map_err(|e| {
      SyncError::MetadataPersistenceFailed(format!("Failed to run metadata migrations: {}", e))
    })?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::MetadataPersistenceFailed(format!("Lock poisoned: {}", e)))
  }
}

impl SyncMetadataStore for SqliteMetadataStore {
  fn load_metadata(&self) -> Result<Vec<SyncMetadata>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "{} ORDER BY resource_type, resource_id",
      SELECT_COLUMNS
    ))?;

    let raw: Vec<RawRow> = stmt
      .query_map([], RawRow::read)?
      .collect::<std::result::Result<_, _>>()?;

    raw.into_iter().map(RawRow::into_metadata).collect()
  }

  fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO sync_metadata (resource_type, resource_id, last_modified, version, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(resource_type, resource_id) DO UPDATE SET
           last_modified = excluded.last_modified,
           version = excluded.version,
           synced_at = excluded.synced_at",
        params![
          metadata.resource_type.as_str(),
          metadata.resource_id,
          metadata.last_modified.to_rfc3339(),
          metadata.version,
          metadata.synced_at.map(|t| t.to_rfc3339()),
        ],
      )
      .map_err(|e| {
        SyncError::MetadataPersistenceFailed(format!(
          "Failed to save metadata for {}: {}",
          metadata.key(),
          e
        ))
      })?;
    Ok(())
  }

  fn get_metadata(
    &self,
    resource_type: ResourceType,
    resource_id: &str,
  ) -> Result<Option<SyncMetadata>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "{} WHERE resource_type = ?1 AND resource_id = ?2",
      SELECT_COLUMNS
    ))?;

    let raw = stmt
      .query_row(params![resource_type.as_str(), resource_id], RawRow::read)
      .optional()?;

    raw.map(RawRow::into_metadata).transpose()
  }

  fn delete_metadata(&self, resource_type: ResourceType, resource_id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn.execute(
      "DELETE FROM sync_metadata WHERE resource_type = ?1 AND resource_id = ?2",
      params![resource_type.as_str(), resource_id],
    )?;
    Ok(deleted > 0)
  }
}

/// Row as stored, before parsing text columns.
struct RawRow {
  resource_type: String,
  resource_id: String,
  last_modified: String,
  version: i64,
  synced_at: Option<String>,
}

impl RawRow {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      resource_type: row.get(0)?,
      resource_id: row.get(1)?,
      last_modified: row.get(2)?,
      version: row.get(3)?,
      synced_at: row.get(4)?,
    })
  }

  fn into_metadata(self) -> Result<SyncMetadata> {
    let resource_type = self
      .resource_type
      .parse::<ResourceType>()
      .map_err(SyncError::MetadataPersistenceFailed)?;
    Ok(SyncMetadata {
      resource_id: self.resource_id,
      resource_type,
      last_modified: parse_datetime(&self.last_modified)?,
      version: self.version,
      synced_at: self.synced_at.as_deref().map(parse_datetime).transpose()?,
    })
  }
}

/// Parse an RFC 3339 timestamp column.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      SyncError::MetadataPersistenceFailed(format!("Failed to parse datetime '{}': {}", s, e))
    })
}
