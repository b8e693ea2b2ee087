//! Cache store over the shared key-value substrate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::key::RequestKey;
use crate::clock::Clock;
use crate::storage::{KvStore, StorageError, CACHE_PREFIX};

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// Storage error.
  #[error("cache storage error: {0}")]
  Storage(#[from] StorageError),

  /// Serialization error.
  #[error("cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// A cached GET response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  /// Normalized endpoint, kept so entries can be swept by endpoint prefix
  pub endpoint: String,
  pub payload: Value,
  pub fetched_at: DateTime<Utc>,
  #[serde(with = "duration_ms")]
  pub ttl: Duration,
}

impl CacheEntry {
  /// Fresh iff `now - fetched_at < ttl`.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    let age = now - self.fetched_at;
    match chrono::Duration::from_std(self.ttl) {
      Ok(ttl) => age < ttl,
      // TTL too large to represent: never goes stale
      Err(_) => true,
    }
  }

  pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
    if self.is_fresh(now) {
      Freshness::Fresh
    } else {
      Freshness::Stale
    }
  }
}

/// Whether a cached entry is still within its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
  Fresh,
  /// Past its TTL but still servable
  Stale,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
  Fresh(CacheEntry),
  Stale(CacheEntry),
  Absent,
}

impl CacheLookup {
  pub fn entry(&self) -> Option<&CacheEntry> {
    match self {
      CacheLookup::Fresh(entry) | CacheLookup::Stale(entry) => Some(entry),
      CacheLookup::Absent => None,
    }
  }

  pub fn into_entry(self) -> Option<(CacheEntry, Freshness)> {
    match self {
      CacheLookup::Fresh(entry) => Some((entry, Freshness::Fresh)),
      CacheLookup::Stale(entry) => Some((entry, Freshness::Stale)),
      CacheLookup::Absent => None,
    }
  }
}

/// Durable store for GET responses, keyed by [`RequestKey`].
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn KvStore>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
    Self { storage, clock }
  }

  /// Look up a cached response and classify its freshness.
  pub fn get(&self, key: &RequestKey) -> Result<CacheLookup, CacheError> {
    let storage_key = key.storage_key();
    let Some(bytes) = self.storage.get(&storage_key)? else {
      debug!(request = %key, "cache miss");
      return Ok(CacheLookup::Absent);
    };

    let entry: CacheEntry = match serde_json::from_slice(&bytes) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(request = %key, error = %e, "discarding unreadable cache entry");
        return Ok(CacheLookup::Absent);
      }
    };

    if entry.is_fresh(self.clock.now()) {
      debug!(request = %key, "cache hit (fresh)");
      Ok(CacheLookup::Fresh(entry))
    } else {
      debug!(request = %key, "cache hit (stale)");
      Ok(CacheLookup::Stale(entry))
    }
  }

  /// Store (or overwrite) the response for `key`, stamped with the current time.
  pub fn put(&self, key: &RequestKey, payload: Value, ttl: Duration) -> Result<CacheEntry, CacheError> {
    let entry = CacheEntry {
      key: key.storage_key(),
      endpoint: key.endpoint().to_string(),
      payload,
      fetched_at: self.clock.now(),
      ttl,
    };

    let bytes = serde_json::to_vec(&entry)?;
    self.storage.set(&entry.key, &bytes)?;
    Ok(entry)
  }

  /// Remove cached entries. With an endpoint prefix (e.g. `/bookings`), only
  /// entries whose endpoint starts with it are removed.
  pub fn clear(&self, endpoint_prefix: Option<&str>) -> Result<usize, CacheError> {
    let Some(prefix) = endpoint_prefix else {
      return Ok(self.storage.remove_prefix(CACHE_PREFIX)?);
    };

    let mut removed = 0;
    for storage_key in self.storage.list_keys(CACHE_PREFIX)? {
      let matches = match self.storage.get(&storage_key)? {
        Some(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
          .map(|entry| entry.endpoint.starts_with(prefix))
          // Unreadable entries are swept along with any targeted clear
          .unwrap_or(true),
        None => false,
      };
      if matches && self.storage.remove(&storage_key)? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  /// Number of cached entries.
  pub fn len(&self) -> Result<usize, CacheError> {
    Ok(self.storage.list_keys(CACHE_PREFIX)?.len())
  }

  pub fn is_empty(&self) -> Result<bool, CacheError> {
    Ok(self.len()? == 0)
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
  }
}
