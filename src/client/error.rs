use crate::cache::CacheError;
use crate::outbox::OutboxError;

/// Error type for façade requests.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
  /// The remote was reached (or should have been) but the call failed.
  /// `status` is `None` when no response arrived at all.
  #[error("network error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
  Network { status: Option<u16>, message: String },

  /// GET while offline with nothing cached.
  #[error("offline and no cached response for {endpoint}")]
  OfflineNoCache { endpoint: String },

  /// A mutation could not be persisted to the outbox. The write is lost
  /// unless the caller retries.
  #[error("could not queue mutation: {0}")]
  QueueWrite(#[source] OutboxError),

  /// Reading the outbox failed.
  #[error("outbox unavailable: {0}")]
  Outbox(#[source] OutboxError),

  /// Cache storage failed.
  #[error(transparent)]
  Cache(#[from] CacheError),
}

impl RequestError {
  /// Status code of the failed call, if a response arrived.
  pub fn status(&self) -> Option<u16> {
    match self {
      RequestError::Network { status, .. } => *status,
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_network_error_display() {
    let with_status = RequestError::Network {
      status: Some(422),
      message: "Dates overlap".into(),
    };
    assert_eq!(with_status.to_string(), "network error (HTTP 422): Dates overlap");

    let without = RequestError::Network {
      status: None,
      message: "request timed out after 10s".into(),
    };
    assert_eq!(without.to_string(), "network error: request timed out after 10s");
    assert_eq!(without.status(), None);
  }
}
