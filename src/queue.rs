//! Deferred sync queue: a durable, ordered log of mutations issued while
//! offline, replayed when a reconnection signal fires.
//!
//! Delivery is at-least-once. An entry is deleted only after its replay
//! comes back with a success status; if the acknowledgment is lost the
//! entry replays again on the next signal, and the upstream API is
//! expected to tolerate the duplicate.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::cache::StorageError;
use crate::http::{FetchRequest, HttpMethod, RequestMode};
use crate::net::NetworkFetch;

/// One deferred write awaiting replay.
#[derive(Debug, Clone)]
pub struct QueuedMutation {
  /// Monotonic rowid; replay order within a class
  pub id: i64,
  /// Resource class namespace ("sales", "inventory")
  pub class: String,
  /// Path and query the write targets
  pub target: String,
  pub method: HttpMethod,
  pub payload: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
}

/// Replay failure for a single queued entry. The entry stays queued and
/// is retried on the next sync signal; never user-visible.
#[derive(Debug, Clone, Error)]
#[error("replay of {class} mutation {id} failed: {reason}")]
pub struct SyncReplayError {
  pub id: i64,
  pub class: String,
  pub reason: String,
}

/// Outcome of draining one resource-class queue.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
  /// Entries confirmed replayed and deleted
  pub replayed: usize,
  /// Entries still queued after the drain
  pub remaining: usize,
}

/// SQLite-backed append-only mutation log.
pub struct SyncQueue {
  conn: Mutex<Connection>,
}

impl SyncQueue {
  /// Open or create the queue at the default location.
  pub fn open() -> Result<Self, StorageError> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the queue at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Open(format!("failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Open(format!("failed to open queue at {}: {}", path.display(), e))
    })?;

    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  /// In-memory queue, used by tests and the `--ephemeral` flag.
  pub fn in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::Open(format!("failed to open in-memory queue: {}", e)))?;

    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Open("could not determine data directory".to_string()))?;

    Ok(data_dir.join("shopflow-offline").join("queue.db"))
  }

  fn run_migrations(&self) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| StorageError::Open(format!("failed to run queue migrations: {}", e)))?;

    Ok(())
  }

  /// Append a mutation to its class queue. Entries are never mutated in
  /// place afterward.
  pub fn enqueue(
    &self,
    class: &str,
    target: &str,
    method: HttpMethod,
    payload: &[u8],
  ) -> Result<i64, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    conn
      .execute(
        "INSERT INTO mutations (class, target, method, payload, enqueued_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![class, target, method.as_str(), payload],
      )
      .map_err(|e| StorageError::Query(format!("failed to enqueue mutation: {}", e)))?;

    Ok(conn.last_insert_rowid())
  }

  /// Pending mutations for a class, in insertion order.
  pub fn pending(&self, class: &str) -> Result<Vec<QueuedMutation>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    let mut stmt = conn
      .prepare(
        "SELECT id, class, target, method, payload, enqueued_at
         FROM mutations WHERE class = ? ORDER BY id",
      )
      .map_err(|e| StorageError::Query(format!("failed to prepare query: {}", e)))?;

    let rows: Vec<(i64, String, String, String, Vec<u8>, String)> = stmt
      .query_map(params![class], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| StorageError::Query(format!("failed to query mutations: {}", e)))?
      .filter_map(|r| r.ok())
      .collect();

    let mut mutations = Vec::with_capacity(rows.len());
    for (id, class, target, method, payload, enqueued_at) in rows {
      let method = method
        .parse()
        .map_err(|e: String| StorageError::Query(e))?;

      mutations.push(QueuedMutation {
        id,
        class,
        target,
        method,
        payload,
        enqueued_at: parse_datetime(&enqueued_at)?,
      });
    }

    Ok(mutations)
  }

  /// Count of pending mutations for a class.
  pub fn len(&self, class: &str) -> Result<usize, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM mutations WHERE class = ?",
        params![class],
        |row| row.get(0),
      )
      .map_err(|e| StorageError::Query(format!("failed to count mutations: {}", e)))?;

    Ok(count as usize)
  }

  fn remove(&self, id: i64) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Lock)?;

    conn
      .execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| StorageError::Query(format!("failed to remove mutation: {}", e)))?;

    Ok(())
  }

  /// Replay one class queue in insertion order.
  ///
  /// Each entry is issued as a network write against `origin`; confirmed
  /// successes are deleted, failures stay queued and do not block the
  /// entries behind them.
  pub async fn drain<N: NetworkFetch>(
    &self,
    class: &str,
    origin: &Url,
    net: &N,
  ) -> Result<SyncReport, StorageError> {
    let mut report = SyncReport::default();

    for mutation in self.pending(class)? {
      let url = match origin.join(&mutation.target) {
        Ok(url) => url,
        Err(e) => {
          warn!(replay_target = %mutation.target, error = %e, "skipping unjoinable replay target");
          report.remaining += 1;
          continue;
        }
      };

      let request = FetchRequest {
        url,
        method: mutation.method,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Some(mutation.payload.clone()),
        mode: RequestMode::Subresource,
      };

      match net.fetch(&request).await {
        Ok(response) if response.is_success() => {
          self.remove(mutation.id)?;
          report.replayed += 1;
          debug!(class, id = mutation.id, "replayed queued mutation");
        }
        Ok(response) => {
          let err = SyncReplayError {
            id: mutation.id,
            class: class.to_string(),
            reason: format!("upstream returned status {}", response.status),
          };
          warn!(error = %err, "mutation left queued");
          report.remaining += 1;
        }
        Err(e) => {
          let err = SyncReplayError {
            id: mutation.id,
            class: class.to_string(),
            reason: e.to_string(),
          };
          warn!(error = %err, "mutation left queued");
          report.remaining += 1;
        }
      }
    }

    Ok(report)
  }
}

/// Schema for the mutation log.
const QUEUE_SCHEMA: &str = r#"
-- Append-only log of deferred writes; rowid is replay order
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    class TEXT NOT NULL,
    target TEXT NOT NULL,
    method TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_mutations_class ON mutations(class, id);
"#;

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StorageError::Query(format!("failed to parse datetime '{}': {}", s, e)))
}
