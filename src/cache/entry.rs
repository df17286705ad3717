//! Cache entry state.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SyncError;

/// Identity of an outstanding request, used to de-duplicate concurrent reads
/// and to discard responses that a newer request has superseded.
pub type RequestId = u64;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Never fetched.
  Idle,
  /// A request is in flight. Prior `data` is kept for read-through.
  Pending,
  /// Last fetch succeeded.
  Success,
  /// Last fetch failed. Prior `data`, if any, is kept for display.
  Error,
}

/// Stored state for one query key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub status: EntryStatus,
  /// Last successfully fetched value. Retained across later pending/error
  /// states (stale-while-revalidate).
  pub data: Option<Value>,
  /// Last failure, cleared when a new attempt starts.
  pub error: Option<SyncError>,
  /// When `data` was last written from a successful fetch.
  pub fetched_at: Option<DateTime<Utc>>,
  /// Identity of the outstanding request, if any.
  pub in_flight: Option<RequestId>,
  /// Set by invalidation: the next read must re-fetch even if `fetched_at`
  /// is recent. Data stays visible while the refresh runs.
  pub stale: bool,
}

impl CacheEntry {
  pub fn idle() -> Self {
    Self {
      status: EntryStatus::Idle,
      data: None,
      error: None,
      fetched_at: None,
      in_flight: None,
      stale: false,
    }
  }

  /// Whether a read can be served from this entry without fetching.
  pub fn is_fresh(&self, stale_after: Duration) -> bool {
    if self.status != EntryStatus::Success || self.stale {
      return false;
    }
    match self.fetched_at {
      Some(at) => Utc::now() - at <= stale_after,
      None => false,
    }
  }

  /// Deserialize the cached value, if present.
  pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
    match &self.data {
      Some(value) => serde_json::from_value(value.clone())
        .map(Some)
        .map_err(|e| SyncError::validation(e.to_string())),
      None => Ok(None),
    }
  }
}
