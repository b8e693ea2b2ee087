//! Durable key-value substrate shared by the cache and the outbox.
//!
//! Both consumers keep their records under their own key prefix so each can
//! be enumerated and swept without touching the other:
//! - `cache_*` for read responses
//! - `queue_*` for pending mutations
//!
//! Unreadable queue records are moved under `quarantine_*`, and the outbox
//! keeps its id high-water mark in a single `outbox_next_seq` key.

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

/// Key prefix for cached GET responses.
pub const CACHE_PREFIX: &str = "cache_";

/// Key prefix for queued mutations.
pub const QUEUE_PREFIX: &str = "queue_";

/// Key prefix for queue records that could not be decoded.
pub const QUARANTINE_PREFIX: &str = "quarantine_";

/// Next outbox sequence number, stored as decimal text.
pub const OUTBOX_SEQ_KEY: &str = "outbox_next_seq";

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// SQLite error.
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  /// Filesystem error while preparing the database location.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// A previous holder of the connection panicked.
  #[error("storage lock poisoned")]
  LockPoisoned,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for key-value storage backends.
///
/// Implementations must serialize writes per key and survive process
/// restarts (except the in-memory backend, which exists for tests and
/// ephemeral sessions).
pub trait KvStore: Send + Sync {
  /// Get the value stored under `key`.
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

  /// Insert or overwrite the value stored under `key`.
  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

  /// Remove `key`. Returns whether it existed.
  fn remove(&self, key: &str) -> StorageResult<bool>;

  /// List keys starting with `prefix`, in ascending byte order.
  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

  /// Remove every key starting with `prefix`. Returns how many were removed.
  fn remove_prefix(&self, prefix: &str) -> StorageResult<usize> {
    let keys = self.list_keys(prefix)?;
    let mut removed = 0;
    for key in keys {
      if self.remove(&key)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}
