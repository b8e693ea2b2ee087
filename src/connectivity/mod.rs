//! Connectivity monitoring.
//!
//! The monitor turns raw reachability reports from a platform provider into
//! debounced online/offline edges. Indeterminate reachability counts as
//! offline: queuing a write is always safe, sending one over a broken link
//! is not.

mod monitor;
mod probe;

use chrono::{DateTime, Utc};

pub use monitor::{ConnectivityMonitor, Subscription};
pub use probe::{HttpProbe, ReachabilityProvider};

/// Raw reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
  Online,
  Offline,
  /// Status could not be determined
  Unknown,
}

impl Reachability {
  pub fn is_online(self) -> bool {
    matches!(self, Reachability::Online)
  }
}

/// Current connectivity, as seen by the rest of the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: bool,
  /// When the last edge was committed
  pub transitioned_at: DateTime<Utc>,
}
