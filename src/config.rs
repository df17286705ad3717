//! Tunable configuration for the sync layer.

use serde::Deserialize;

/// Retry behavior for failed reads. Writes are never retried.
///
/// The exponential shape of the backoff is fixed; the base delay and attempt
/// count are configuration, not contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Delay before the first retry; doubles on each further attempt.
  pub base_delay_ms: u64,
  /// Retries after the initial attempt (3 means 4 total attempts).
  pub max_retries: u32,
  /// Add a small random offset to each delay so many keys failing at once
  /// (e.g. a transient outage across every listing page) don't retry in
  /// lockstep.
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: 100,
      max_retries: 3,
      jitter: true,
    }
  }
}

/// Top-level configuration, constructed once per session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// How long a successful fetch stays fresh before a read re-fetches.
  pub stale_after_secs: u64,
  pub retry: RetryConfig,
  /// Per-page item limit used when the URL doesn't carry one.
  pub default_limit: u32,
  /// Quiet period for debounced mutations such as like/unlike toggles.
  pub debounce_quiet_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: 60,
      retry: RetryConfig::default(),
      default_limit: 20,
      debounce_quiet_ms: 250,
    }
  }
}

impl SyncConfig {
  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.stale_after_secs as i64)
  }

  pub fn debounce_quiet(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.debounce_quiet_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = SyncConfig::default();
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.default_limit, 20);
  }

  #[test]
  fn test_partial_deserialization_fills_defaults() {
    let config: SyncConfig =
      serde_json::from_str(r#"{"retry": {"base_delay_ms": 50}, "default_limit": 12}"#).unwrap();
    assert_eq!(config.retry.base_delay_ms, 50);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.default_limit, 12);
    assert_eq!(config.stale_after_secs, 60);
  }
}
