use std::time::Duration;

use crate::config::SyncConfig;

/// Backoff and give-up rules for replaying queued operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Once `retry_count` would exceed this, the operation is rejected
  pub max_retries: u32,
  /// Operations older than this are rejected on their next retryable failure
  pub max_age: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
      max_retries: config.max_retries,
      max_age: Duration::from_secs(config.max_age_hours.saturating_mul(3600)),
    }
  }

  /// `min(base * 2^retry_count, max_delay)`.
  pub fn delay_for(&self, retry_count: u32) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  pub fn retries_exhausted(&self, retry_count: u32) -> bool {
    retry_count > self.max_retries
  }
}
