//! SQLite cache storage backend.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{
  key_hash, CacheStorage, CacheVersion, CachedEntry, Registration, RegistrationStore,
};
use crate::error::{WorkerError, WorkerResult};
use crate::http::{RequestKey, Response, ResponseKind};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> WorkerResult<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| WorkerError::storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      WorkerError::storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> WorkerResult<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| WorkerError::storage(format!("Failed to open in-memory cache: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> WorkerResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> WorkerResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| WorkerError::storage("Could not determine data directory"))?;

    Ok(data_dir.join("quickmeal-sw").join("cache.db"))
  }

  fn lock(&self) -> WorkerResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| WorkerError::storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> WorkerResult<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| WorkerError::storage(format!("Failed to run cache migrations: {}", e)))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation
CREATE TABLE IF NOT EXISTS cache_versions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity hash
CREATE TABLE IF NOT EXISTS cache_entries (
    version TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    kind TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (version, request_hash),
    FOREIGN KEY (version) REFERENCES cache_versions(name) ON DELETE CASCADE
);

-- Active and waiting versions (single row)
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_version TEXT,
    waiting_version TEXT
);
"#;

fn ensure_version(conn: &Connection, version: &CacheVersion) -> WorkerResult<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_versions (name) VALUES (?)",
      params![version.as_str()],
    )
    .map_err(|e| WorkerError::storage(format!("Failed to create cache {}: {}", version, e)))?;
  Ok(())
}

/// Upsert one entry into an existing version. Returns false when the version
/// does not exist, in which case nothing is written.
fn insert_entry(
  conn: &Connection,
  version: &CacheVersion,
  key: &RequestKey,
  response: &Response,
) -> WorkerResult<bool> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| WorkerError::storage(format!("Failed to serialize headers: {}", e)))?;

  let inserted = conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (version, request_hash, method, url, response_url, status, headers, body, kind, cached_at)
       SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now')
       WHERE EXISTS (SELECT 1 FROM cache_versions WHERE name = ?1)",
      params![
        version.as_str(),
        key_hash(key),
        key.method,
        key.url,
        response.url,
        response.status,
        headers,
        response.body,
        response.kind.as_str(),
      ],
    )
    .map_err(|e| WorkerError::storage(format!("Failed to store {}: {}", key, e)))?;

  Ok(inserted > 0)
}

impl CacheStorage for SqliteStorage {
  fn open(&self, version: &CacheVersion) -> WorkerResult<()> {
    let conn = self.lock()?;
    ensure_version(&conn, version)
  }

  fn put(&self, version: &CacheVersion, key: &RequestKey, response: &Response) -> WorkerResult<bool> {
    let conn = self.lock()?;
    insert_entry(&conn, version, key, response)
  }

  fn put_all(&self, version: &CacheVersion, entries: &[(RequestKey, Response)]) -> WorkerResult<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| WorkerError::storage(format!("Failed to begin transaction: {}", e)))?;

    ensure_version(&tx, version)?;
    for (key, response) in entries {
      if !insert_entry(&tx, version, key, response)? {
        return Err(WorkerError::storage(format!("Cache {} vanished during commit", version)));
      }
    }

    // Dropping the transaction on an early return rolls it back
    tx.commit()
      .map_err(|e| WorkerError::storage(format!("Failed to commit transaction: {}", e)))?;
    Ok(())
  }

  fn lookup(&self, version: &CacheVersion, key: &RequestKey) -> WorkerResult<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT response_url, status, headers, body, kind, cached_at FROM cache_entries
         WHERE version = ? AND request_hash = ?",
        params![version.as_str(), key_hash(key)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| WorkerError::storage(format!("Failed to look up {}: {}", key, e)))?;

    let Some((url, status, headers, body, kind, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, Vec<u8>)> = serde_json::from_str(&headers)
      .map_err(|e| WorkerError::storage(format!("Corrupt headers for {}: {}", key, e)))?;
    let kind = ResponseKind::parse(&kind)
      .ok_or_else(|| WorkerError::storage(format!("Unknown response kind '{}' for {}", kind, key)))?;

    Ok(Some(CachedEntry {
      key: key.clone(),
      response: Response {
        url,
        status,
        headers,
        body,
        kind,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn list_versions(&self) -> WorkerResult<Vec<CacheVersion>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_versions ORDER BY name")
      .map_err(|e| WorkerError::storage(format!("Failed to prepare query: {}", e)))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| WorkerError::storage(format!("Failed to list caches: {}", e)))?
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| WorkerError::storage(format!("Failed to read cache name: {}", e)))?;

    Ok(names.into_iter().map(CacheVersion::new).collect())
  }

  fn delete_version(&self, version: &CacheVersion) -> WorkerResult<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| WorkerError::storage(format!("Failed to begin transaction: {}", e)))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE version = ?",
      params![version.as_str()],
    )
    .map_err(|e| WorkerError::storage(format!("Failed to delete entries of {}: {}", version, e)))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_versions WHERE name = ?",
        params![version.as_str()],
      )
      .map_err(|e| WorkerError::storage(format!("Failed to delete cache {}: {}", version, e)))?;

    tx.commit()
      .map_err(|e| WorkerError::storage(format!("Failed to commit transaction: {}", e)))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, version: &CacheVersion) -> WorkerResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE version = ?",
        params![version.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| WorkerError::storage(format!("Failed to count entries: {}", e)))?;
    Ok(count as usize)
  }
}

impl RegistrationStore for SqliteStorage {
  fn registration(&self) -> WorkerResult<Registration> {
    let conn = self.lock()?;
    let row: Option<(Option<String>, Option<String>)> = conn
      .query_row(
        "SELECT active_version, waiting_version FROM registration WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| WorkerError::storage(format!("Failed to read registration: {}", e)))?;

    let (active, waiting) = row.unwrap_or_default();
    Ok(Registration {
      active: active.map(CacheVersion::new),
      waiting: waiting.map(CacheVersion::new),
    })
  }

  fn set_registration(&self, registration: &Registration) -> WorkerResult<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO registration (id, active_version, waiting_version)
         VALUES (1, ?, ?)",
        params![
          registration.active.as_ref().map(|v| v.as_str()),
          registration.waiting.as_ref().map(|v| v.as_str()),
        ],
      )
      .map_err(|e| WorkerError::storage(format!("Failed to write registration: {}", e)))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> WorkerResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| WorkerError::storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
