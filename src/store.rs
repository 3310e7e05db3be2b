use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::entity::Entity;
use crate::error::StoreError;

pub const DEFAULT_DB_PATH: &str = "data/entities.sqlite";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entities (
        identifier   TEXT PRIMARY KEY,
        fields       TEXT NOT NULL,
        extracted_at TEXT NOT NULL
    );
";

enum Location {
    File(PathBuf),
    Memory,
}

impl Location {
    fn describe(&self) -> String {
        match self {
            Location::File(path) => path.display().to_string(),
            Location::Memory => ":memory:".to_string(),
        }
    }
}

/// Keyed entity persistence with upsert-by-identifier semantics.
///
/// A `Store` is constructed closed and must be `open`ed once before use.
/// Every write is committed on its own so an interrupted run keeps all
/// entities written before the interruption.
pub struct Store {
    location: Location,
    conn: Mutex<Option<Connection>>,
}

pub struct StoreStats {
    pub total: usize,
    pub last_write: Option<DateTime<Utc>>,
}

impl Store {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::File(path.into()),
            conn: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            conn: Mutex::new(None),
        }
    }

    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::at(path);
        store.open()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self::in_memory();
        store.open()?;
        Ok(store)
    }

    /// Create the backing table if absent. Calling it again is a no-op.
    pub fn open(&self) -> Result<(), StoreError> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }

        let init_err = |reason: String| StoreError::Initialization {
            path: self.location.describe(),
            reason,
        };

        let conn = match &self.location {
            Location::File(path) => {
                ensure_parent(path).map_err(|e| init_err(e.to_string()))?;
                let conn = Connection::open(path).map_err(|e| init_err(e.to_string()))?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")
                    .map_err(|e| init_err(e.to_string()))?;
                conn
            }
            Location::Memory => Connection::open_in_memory().map_err(|e| init_err(e.to_string()))?,
        };
        conn.execute_batch(SCHEMA)
            .map_err(|e| init_err(e.to_string()))?;

        info!(path = %self.location.describe(), "entity store open");
        *guard = Some(conn);
        Ok(())
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Write `entity`, fully replacing any record with the same identifier.
    pub fn upsert(&self, entity: Entity) -> Result<Entity, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;

        let write_err = |reason: String| StoreError::Write {
            identifier: entity.identifier.clone(),
            reason,
        };
        let fields = serde_json::to_string(&entity.fields).map_err(|e| write_err(e.to_string()))?;

        conn.execute(
            "INSERT INTO entities (identifier, fields, extracted_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(identifier) DO UPDATE SET
                fields = excluded.fields,
                extracted_at = excluded.extracted_at",
            rusqlite::params![entity.identifier, fields, entity.extracted_at.to_rfc3339()],
        )
        .map_err(|e| write_err(e.to_string()))?;

        debug!(identifier = %entity.identifier, "entity upserted");
        Ok(entity)
    }

    pub fn list_all(&self) -> Result<Vec<Entity>, StoreError> {
        self.list(None)
    }

    /// Stored entities in first-write order, optionally capped at `limit`.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<Entity>, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;

        let sql = match limit {
            Some(n) => format!(
                "SELECT identifier, fields, extracted_at FROM entities ORDER BY rowid LIMIT {}",
                n
            ),
            None => "SELECT identifier, fields, extracted_at FROM entities ORDER BY rowid".to_string(),
        };
        let mut stmt = conn.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(read_err)?
            .collect::<Result<Vec<(String, String, String)>, _>>()
            .map_err(read_err)?;

        rows.into_iter()
            .map(|(identifier, fields, at)| decode(identifier, &fields, &at))
            .collect()
    }

    pub fn get(&self, identifier: &str) -> Result<Option<Entity>, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT fields, extracted_at FROM entities WHERE identifier = ?1",
                [identifier],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(read_err)?;

        row.map(|(fields, at)| decode(identifier.to_string(), &fields, &at))
            .transpose()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))
            .map_err(read_err)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let total = self.count()?;
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        let last: Option<String> = conn
            .query_row("SELECT MAX(extracted_at) FROM entities", [], |r| r.get(0))
            .map_err(read_err)?;
        let last_write = last.as_deref().map(parse_timestamp).transpose()?;
        Ok(StoreStats { total, last_write })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn decode(identifier: String, fields: &str, extracted_at: &str) -> Result<Entity, StoreError> {
    let fields = serde_json::from_str(fields)
        .map_err(|e| StoreError::Read(format!("fields of '{}': {}", identifier, e)))?;
    Ok(Entity {
        identifier,
        fields,
        extracted_at: parse_timestamp(extracted_at)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Read(format!("timestamp '{}': {}", raw, e)))
}

fn read_err(e: rusqlite::Error) -> StoreError {
    StoreError::Read(e.to_string())
}
