use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{KvStore, StorageError, StorageResult};

/// In-memory storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKv {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self.entries.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl KvStore for MemoryKv {
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    self.lock()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<bool> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
    Ok(
      self
        .lock()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}
