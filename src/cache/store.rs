//! SQLite-backed implementation of the cache store.

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::http::ResponseSnapshot;

use super::traits::{CacheStore, StorageError};

/// Response cache persisted in SQLite.
///
/// One table of entries keyed by (generation, request_key); headers are
/// stored as JSON, bodies as blobs. Entries are never expired by size -
/// they live until their generation is reconciled away.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self, StorageError> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Open(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Open(format!("failed to open cache at {}: {}", path.display(), e))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used by tests and the `--ephemeral` flag.
  pub fn in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::Open(format!("failed to open in-memory cache: {}", e)))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Default database path.
  fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Open("could not determine data directory".to_string()))?;

    Ok(data_dir.join("shopflow-offline").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StorageError::Open(format!("failed to run cache migrations: {}", e)))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache generations; the version tag lives in the name
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached response snapshots, scoped by generation
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation);
"#;

impl CacheStore for SqliteStore {
  fn ensure(&self, generation: &str) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| StorageError::Query(format!("failed to ensure generation: {}", e)))?;

    Ok(())
  }

  fn put(
    &self,
    generation: &str,
    request_key: &str,
    snapshot: &ResponseSnapshot,
  ) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    let headers = serde_json::to_string(&snapshot.headers)
      .map_err(|e| StorageError::Query(format!("failed to serialize headers: {}", e)))?;

    // Registering the generation alongside the entry keeps put safe to
    // call before ensure on a fresh store.
    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| StorageError::Query(format!("failed to register generation: {}", e)))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (generation, request_key, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![generation, request_key, snapshot.status, headers, snapshot.body],
      )
      .map_err(|e| StorageError::Query(format!("failed to store entry: {}", e)))?;

    Ok(())
  }

  fn lookup(
    &self,
    generation: &str,
    request_key: &str,
  ) -> Result<Option<ResponseSnapshot>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body FROM entries
         WHERE generation = ? AND request_key = ?",
      )
      .map_err(|e| StorageError::Query(format!("failed to prepare lookup: {}", e)))?;

    let row: rusqlite::Result<(u16, String, Vec<u8>)> = stmt
      .query_row(params![generation, request_key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      });

    // Only an absent row is a miss; real query errors surface as errors.
    let (status, headers, body) = match row {
      Ok(row) => row,
      Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
      Err(e) => return Err(StorageError::Query(format!("failed to look up entry: {}", e))),
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| StorageError::Query(format!("failed to parse headers: {}", e)))?;

    Ok(Some(ResponseSnapshot {
      status,
      headers,
      body,
    }))
  }

  fn reconcile_generations(&self, keep: &[String]) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    if keep.is_empty() {
      conn
        .execute("DELETE FROM entries", [])
        .map_err(|e| StorageError::Query(format!("failed to clear entries: {}", e)))?;
      conn
        .execute("DELETE FROM generations", [])
        .map_err(|e| StorageError::Query(format!("failed to clear generations: {}", e)))?;
      return Ok(());
    }

    let placeholders = vec!["?"; keep.len()].join(", ");

    let sql = format!("DELETE FROM entries WHERE generation NOT IN ({})", placeholders);
    conn
      .execute(&sql, rusqlite::params_from_iter(keep.iter()))
      .map_err(|e| StorageError::Query(format!("failed to delete stale entries: {}", e)))?;

    let sql = format!("DELETE FROM generations WHERE name NOT IN ({})", placeholders);
    conn
      .execute(&sql, rusqlite::params_from_iter(keep.iter()))
      .map_err(|e| StorageError::Query(format!("failed to delete stale generations: {}", e)))?;

    Ok(())
  }

  fn generation_names(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY name")
      .map_err(|e| StorageError::Query(format!("failed to prepare query: {}", e)))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| StorageError::Query(format!("failed to list generations: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn snapshot(body: &str) -> ResponseSnapshot {
    ResponseSnapshot {
      status: 200,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_put_then_lookup_roundtrips() {
    let store = SqliteStore::in_memory().unwrap();
    store.ensure("static-v1").unwrap();
    store.put("static-v1", "key-a", &snapshot("hello")).unwrap();

    let found = store.lookup("static-v1", "key-a").unwrap().unwrap();
    assert_eq!(found, snapshot("hello"));
  }

  #[test]
  fn test_lookup_miss_is_none() {
    let store = SqliteStore::in_memory().unwrap();
    store.ensure("static-v1").unwrap();
    assert!(store.lookup("static-v1", "missing").unwrap().is_none());
  }

  #[test]
  fn test_lookup_surfaces_real_query_errors() {
    let path = std::env::temp_dir().join(format!(
      "shopflow-offline-store-test-{}.db",
      std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let store = SqliteStore::open_at(&path).unwrap();
    store.put("static-v1", "key-a", &snapshot("hello")).unwrap();

    // Sabotage the schema through a second connection; the next lookup
    // must fail loudly instead of reporting a miss.
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("DROP TABLE entries").unwrap();

    let result = store.lookup("static-v1", "key-a");
    assert!(matches!(result, Err(StorageError::Query(_))));

    drop(store);
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn test_lookup_is_generation_scoped() {
    let store = SqliteStore::in_memory().unwrap();
    store.put("static-v1", "key-a", &snapshot("hello")).unwrap();
    assert!(store.lookup("dynamic-v1", "key-a").unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let store = SqliteStore::in_memory().unwrap();
    store.put("dynamic-v1", "key-a", &snapshot("old")).unwrap();
    store.put("dynamic-v1", "key-a", &snapshot("new")).unwrap();

    let found = store.lookup("dynamic-v1", "key-a").unwrap().unwrap();
    assert_eq!(found.body, b"new");
  }

  #[test]
  fn test_ensure_is_idempotent() {
    let store = SqliteStore::in_memory().unwrap();
    store.ensure("static-v1").unwrap();
    store.ensure("static-v1").unwrap();
    assert_eq!(store.generation_names().unwrap(), vec!["static-v1"]);
  }

  #[test]
  fn test_reconcile_drops_stale_generations_and_entries() {
    let store = SqliteStore::in_memory().unwrap();
    store.put("static-v1", "key-a", &snapshot("old")).unwrap();
    store.put("dynamic-v1", "key-b", &snapshot("old")).unwrap();
    store.put("static-v2", "key-c", &snapshot("new")).unwrap();
    store.ensure("dynamic-v2").unwrap();

    let keep = vec!["static-v2".to_string(), "dynamic-v2".to_string()];
    store.reconcile_generations(&keep).unwrap();

    assert_eq!(
      store.generation_names().unwrap(),
      vec!["dynamic-v2", "static-v2"]
    );
    assert!(store.lookup("static-v1", "key-a").unwrap().is_none());
    assert!(store.lookup("static-v2", "key-c").unwrap().is_some());
  }

  #[test]
  fn test_reconcile_is_idempotent() {
    let store = SqliteStore::in_memory().unwrap();
    store.put("static-v1", "key-a", &snapshot("old")).unwrap();
    store.ensure("static-v2").unwrap();
    store.ensure("dynamic-v2").unwrap();

    let keep = vec!["static-v2".to_string(), "dynamic-v2".to_string()];
    store.reconcile_generations(&keep).unwrap();
    store.reconcile_generations(&keep).unwrap();

    assert_eq!(
      store.generation_names().unwrap(),
      vec!["dynamic-v2", "static-v2"]
    );
  }
}
