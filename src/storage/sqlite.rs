//! SQLite-backed key-value storage.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{KvStore, StorageError, StorageResult};

/// SQLite-based storage implementation.
///
/// All access goes through a single connection behind a mutex, which also
/// serializes concurrent writes to the same key.
pub struct SqliteKv {
  conn: Mutex<Connection>,
}

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteKv {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StorageResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> StorageResult<()> {
    let conn = self.lock()?;
    // journal_mode answers with the resulting mode; in-memory databases stay "memory"
    let _mode: String =
      conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.execute_batch(KV_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl KvStore for SqliteKv {
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    let conn = self.lock()?;
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv (key, value, written_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(removed > 0)
  }

  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn remove_prefix(&self, prefix: &str) -> StorageResult<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
      params![prefix],
    )?;
    Ok(removed)
  }
}
