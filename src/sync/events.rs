use std::fmt;
use std::time::Duration;

use crate::outbox::{OperationId, QueuedOperation};

/// Why a queued operation was dropped without being confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
  /// The remote answered with a non-retryable status (4xx).
  Status { status: u16, message: String },
  /// The request could not be formed (e.g. malformed endpoint).
  Invalid(String),
  /// Retryable failures exceeded the retry cap.
  RetriesExhausted { last_error: String },
  /// The operation outlived the maximum queue age.
  Expired { last_error: String },
}

impl fmt::Display for RejectReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RejectReason::Status { status, message } => write!(f, "HTTP {}: {}", status, message),
      RejectReason::Invalid(message) => write!(f, "invalid request: {}", message),
      RejectReason::RetriesExhausted { last_error } => {
        write!(f, "gave up after repeated failures: {}", last_error)
      }
      RejectReason::Expired { last_error } => {
        write!(f, "expired in the queue: {}", last_error)
      }
    }
  }
}

/// A queued operation was rejected and removed after replay.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} {} ({}) rejected: {reason}", .operation.method, .operation.endpoint, .operation.id)]
pub struct SyncReplayError {
  pub operation: QueuedOperation,
  pub reason: RejectReason,
}

/// A queued operation failed in a way worth retrying; it stays queued.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{id} failed (attempt {retry_count}), retrying in {delay:?}: {message}")]
pub struct SyncTransientError {
  pub id: OperationId,
  pub retry_count: u32,
  pub delay: Duration,
  pub message: String,
}

/// Notifications emitted while replaying the outbox.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// The remote confirmed the operation; it has been removed.
  Replayed { id: OperationId, status: u16 },
  /// Retryable failure; the operation stays at the head of the queue.
  Deferred(SyncTransientError),
  /// Terminal failure; the operation has been removed.
  Rejected(SyncReplayError),
}
