use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::cache::Freshness;
use crate::outbox::OperationId;

/// Where the data of a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
  /// Fetched from the remote just now
  Network,
  /// Served from cache, within its TTL
  CacheFresh,
  /// Served from cache past its TTL (stale but available)
  CacheStale,
}

impl From<Freshness> for DataSource {
  fn from(freshness: Freshness) -> Self {
    match freshness {
      Freshness::Fresh => DataSource::CacheFresh,
      Freshness::Stale => DataSource::CacheStale,
    }
  }
}

/// Successful result of [`OfflineClient::request`](super::OfflineClient::request).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestOutcome {
  /// Data for a GET.
  Data {
    payload: Value,
    source: DataSource,
    fetched_at: DateTime<Utc>,
  },
  /// The remote accepted a mutation.
  Confirmed { status: u16, body: Value },
  /// The mutation was queued for later replay. This is NOT a server
  /// confirmation: the remote may still reject it.
  Queued {
    id: OperationId,
    enqueued_at: DateTime<Utc>,
  },
}

impl RequestOutcome {
  /// Response data, if any arrived (from network or cache).
  pub fn payload(&self) -> Option<&Value> {
    match self {
      RequestOutcome::Data { payload, .. } => Some(payload),
      RequestOutcome::Confirmed { body, .. } => Some(body),
      RequestOutcome::Queued { .. } => None,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, RequestOutcome::Queued { .. })
  }
}

/// Snapshot of local state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub cache_size: usize,
  pub queue_size: usize,
  pub is_online: bool,
}
