//! Error types for the synchronization layer.

use thiserror::Error;

/// Errors surfaced by reads and writes going through the sync layer.
///
/// Errors are local to their key or intent: a failure on one key never
/// touches entries for unrelated keys.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// The network/protocol level failed (timeout, non-success status,
  /// unparseable body). Reads with this error are retried with backoff;
  /// writes are not.
  #[error("transport error: {0}")]
  Transport(String),

  /// The response arrived but its payload did not have the expected shape.
  /// Never retried - a malformed source stays malformed.
  #[error("invalid response payload: {0}")]
  Validation(String),

  /// A mutation was attempted while an intent-equivalent mutation was
  /// already in flight. Cache state is untouched.
  #[error("mutation already in flight for intent '{0}'")]
  Conflict(String),

  /// Every consumer detached before the request produced a result.
  #[error("request was cancelled")]
  Cancelled,
}

impl SyncError {
  pub fn transport(message: impl Into<String>) -> Self {
    SyncError::Transport(message.into())
  }

  pub fn validation(message: impl Into<String>) -> Self {
    SyncError::Validation(message.into())
  }

  /// Whether the fetcher may schedule another attempt after this error.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::Transport(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_transport_is_retryable() {
    assert!(SyncError::transport("timeout").is_retryable());
    assert!(!SyncError::validation("missing field").is_retryable());
    assert!(!SyncError::Conflict("like:42".into()).is_retryable());
    assert!(!SyncError::Cancelled.is_retryable());
  }
}
