//! libSQL backend.
//!
//! Each record is stored as a row whose list-valued columns hold JSON
//! arrays. Writes go through a `version` column so a stale writer fails
//! instead of clobbering a newer placement.

mod store;

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};

use crate::error::DatabaseError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS employees (
    id TEXT PRIMARY KEY,
    rows TEXT NOT NULL DEFAULT '[]',
    deal_ids TEXT NOT NULL DEFAULT '[]',
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS deal_groups (
    group_key TEXT PRIMARY KEY,
    member_ids TEXT NOT NULL DEFAULT '[]',
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libSQL database: {}", e)))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Query(format!("migration failed: {}", e)))?;
        Ok(())
    }

    pub(crate) async fn connect(&self) -> Result<Connection, DatabaseError> {
        self.db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to connect: {}", e)))
    }
}

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(crate) fn to_version(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

pub(crate) fn from_version(version: u64) -> Result<i64, DatabaseError> {
    i64::try_from(version)
        .map_err(|_| DatabaseError::Serialization(format!("version {} out of range", version)))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned + Default>(
    raw: &str,
) -> Result<T, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}
