use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::payload::Payload;
use crate::storage::{KvStore, StorageError, OUTBOX_SEQ_KEY, QUARANTINE_PREFIX, QUEUE_PREFIX};
use crate::transport::Method;

/// Error type for outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
  /// Storage error.
  #[error("outbox storage error: {0}")]
  Storage(#[from] StorageError),

  /// Serialization error.
  #[error("outbox serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Reads are never queued.
  #[error("{0} is not a mutation and cannot be queued")]
  NotAMutation(Method),

  /// The outbox lock was poisoned.
  #[error("outbox lock poisoned")]
  LockPoisoned,
}

/// Result type for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Identifier of a queued operation. Assigned in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
  pub fn sequence(self) -> u64 {
    self.0
  }

  fn storage_key(self) -> String {
    format!("{}{:020}", QUEUE_PREFIX, self.0)
  }

  fn from_storage_key(key: &str) -> Option<Self> {
    key.strip_prefix(QUEUE_PREFIX)?.parse().ok().map(OperationId)
  }
}

impl fmt::Display for OperationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "op-{}", self.0)
  }
}

/// A mutation waiting to be replayed against the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: OperationId,
  pub method: Method,
  pub endpoint: String,
  pub payload: Option<Payload>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

#[derive(Debug)]
struct Cursor {
  next_seq: u64,
  last_enqueued_at: Option<DateTime<Utc>>,
}

/// Durable ordered store of pending mutations.
pub struct Outbox {
  storage: Arc<dyn KvStore>,
  clock: Arc<dyn Clock>,
  /// Serializes id assignment and writes so concurrent enqueues cannot collide
  cursor: Mutex<Cursor>,
}

impl Outbox {
  /// Open the outbox, resuming the id sequence from whatever is persisted.
  pub fn open(storage: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> OutboxResult<Self> {
    let outbox = Self {
      storage,
      clock,
      cursor: Mutex::new(Cursor {
        next_seq: 1,
        last_enqueued_at: None,
      }),
    };

    let pending = outbox.list_pending()?;
    if let Some(last) = pending.last() {
      let mut cursor = outbox.lock()?;
      cursor.next_seq = last.id.sequence() + 1;
      cursor.last_enqueued_at = Some(last.enqueued_at);
      debug!(pending = pending.len(), "outbox resumed");
    }
    // Ids handed out before the outbox drained stay retired
    if let Some(high_water) = outbox.stored_next_seq()? {
      let mut cursor = outbox.lock()?;
      cursor.next_seq = cursor.next_seq.max(high_water);
    }
    if let Some(max) = outbox
      .storage
      .list_keys(QUEUE_PREFIX)?
      .iter()
      .filter_map(|k| OperationId::from_storage_key(k))
      .max()
    {
      let mut cursor = outbox.lock()?;
      cursor.next_seq = cursor.next_seq.max(max.sequence() + 1);
    }

    Ok(outbox)
  }

  fn stored_next_seq(&self) -> OutboxResult<Option<u64>> {
    let Some(bytes) = self.storage.get(OUTBOX_SEQ_KEY)? else {
      return Ok(None);
    };
    let parsed = std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok());
    if parsed.is_none() {
      warn!("ignoring unreadable outbox sequence marker");
    }
    Ok(parsed)
  }

  fn lock(&self) -> OutboxResult<std::sync::MutexGuard<'_, Cursor>> {
    self.cursor.lock().map_err(|_| OutboxError::LockPoisoned)
  }

  /// Persist a new operation with `retry_count = 0`.
  ///
  /// The record is durable when this returns; a failure here means the write
  /// was NOT queued and must be reported to the caller.
  pub fn enqueue(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<Payload>,
  ) -> OutboxResult<QueuedOperation> {
    if !method.is_mutation() {
      return Err(OutboxError::NotAMutation(method));
    }

    if method == Method::Post
      && payload
        .as_ref()
        .is_some_and(|p| p.is_object() && p.idempotency_key().is_none())
    {
      warn!(
        %endpoint,
        "queuing POST without an idempotency key; a replay after a crash may duplicate it"
      );
    }

    let mut cursor = self.lock()?;

    // Keep enqueued_at monotonic even if the wall clock steps backwards
    let now = self.clock.now();
    let enqueued_at = match cursor.last_enqueued_at {
      Some(last) if last > now => last,
      _ => now,
    };

    let op = QueuedOperation {
      id: OperationId(cursor.next_seq),
      method,
      endpoint: endpoint.to_string(),
      payload,
      enqueued_at,
      retry_count: 0,
      last_error: None,
    };

    let bytes = serde_json::to_vec(&op)?;
    let next_seq = cursor.next_seq + 1;
    self
      .storage
      .set(OUTBOX_SEQ_KEY, next_seq.to_string().as_bytes())?;
    self.storage.set(&op.id.storage_key(), &bytes)?;

    cursor.next_seq = next_seq;
    cursor.last_enqueued_at = Some(enqueued_at);
    debug!(id = %op.id, method = %op.method, endpoint = %op.endpoint, "operation queued");

    Ok(op)
  }

  /// Remove an operation. Returns whether it was present.
  pub fn remove(&self, id: OperationId) -> OutboxResult<bool> {
    Ok(self.storage.remove(&id.storage_key())?)
  }

  /// Fetch a single operation.
  pub fn get(&self, id: OperationId) -> OutboxResult<Option<QueuedOperation>> {
    match self.storage.get(&id.storage_key())? {
      Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      None => Ok(None),
    }
  }

  /// All pending operations, oldest first.
  ///
  /// Records that no longer decode are moved under `quarantine_` so they
  /// stop counting towards [`len`](Self::len) and never block the queue.
  pub fn list_pending(&self) -> OutboxResult<Vec<QueuedOperation>> {
    let mut ops = Vec::new();
    for key in self.storage.list_keys(QUEUE_PREFIX)? {
      let Some(bytes) = self.storage.get(&key)? else {
        continue;
      };
      match serde_json::from_slice::<QueuedOperation>(&bytes) {
        Ok(op) => ops.push(op),
        Err(e) => {
          error!(%key, error = %e, "quarantining unreadable queued operation");
          self.quarantine(&key, &bytes)?;
        }
      }
    }
    Ok(ops)
  }

  fn quarantine(&self, key: &str, bytes: &[u8]) -> OutboxResult<()> {
    self.storage.set(&format!("{}{}", QUARANTINE_PREFIX, key), bytes)?;
    self.storage.remove(key)?;
    Ok(())
  }

  /// The oldest pending operation.
  pub fn head(&self) -> OutboxResult<Option<QueuedOperation>> {
    Ok(self.list_pending()?.into_iter().next())
  }

  /// Record a failed attempt. Returns the updated operation, or `None` if it
  /// is no longer queued.
  pub fn update(
    &self,
    id: OperationId,
    retry_count: u32,
    last_error: Option<String>,
  ) -> OutboxResult<Option<QueuedOperation>> {
    // Hold the cursor lock so this read-modify-write cannot interleave with enqueue
    let _guard = self.lock()?;

    let Some(mut op) = self.get(id)? else {
      return Ok(None);
    };
    op.retry_count = retry_count;
    op.last_error = last_error;

    let bytes = serde_json::to_vec(&op)?;
    self.storage.set(&id.storage_key(), &bytes)?;
    Ok(Some(op))
  }

  /// Number of pending operations.
  pub fn len(&self) -> OutboxResult<usize> {
    Ok(self.storage.list_keys(QUEUE_PREFIX)?.len())
  }

  pub fn is_empty(&self) -> OutboxResult<bool> {
    Ok(self.len()? == 0)
  }

  /// Drop every pending operation. Operator action only.
  pub fn purge(&self) -> OutboxResult<usize> {
    let _guard = self.lock()?;
    let removed = self.storage.remove_prefix(QUEUE_PREFIX)?;
    warn!(removed, "outbox purged");
    Ok(removed)
  }
}
