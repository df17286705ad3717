//! Write execution: optimistic patches with exact rollback.
//!
//! A mutation names the keys it affects. If it carries an optimistic patch,
//! affected entries are snapshotted and patched before the network write
//! runs, so the caller gets immediate feedback. On success the affected keys
//! are invalidated (the next read fetches ground truth rather than trusting
//! the patch); on failure every snapshot is restored exactly. Writes are
//! never auto-retried - the write operation is not assumed idempotent.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::SyncError;
use crate::key::QueryKey;

/// Names a logical write and the cache keys it touches.
///
/// The intent name scopes the one-in-flight rule: while a mutation for
/// `"like:user:42"` is pending, a second mutation with the same name is
/// rejected with [`SyncError::Conflict`].
#[derive(Debug, Clone)]
pub struct MutationIntent {
  name: String,
  affects: Vec<QueryKey>,
}

impl MutationIntent {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      affects: Vec::new(),
    }
  }

  /// Add a key this mutation affects (patched optimistically, invalidated
  /// on success, restored on failure).
  pub fn affects(mut self, key: QueryKey) -> Self {
    self.affects.push(key);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn affected_keys(&self) -> &[QueryKey] {
    &self.affects
  }
}

/// Computes the optimistically patched value for one affected key, given the
/// current cached value. Returning `None` clears the value.
pub type PatchFn = Box<dyn Fn(&QueryKey, Option<Value>) -> Option<Value> + Send + Sync>;

/// Executes write operations against the cache store.
pub struct MutationExecutor {
  store: Arc<CacheStore>,
  in_flight: Arc<Mutex<HashSet<String>>>,
}

impl MutationExecutor {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self {
      store,
      in_flight: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Run a write operation, optionally applying `optimistic` to every
  /// affected entry before the network round trip.
  ///
  /// Rejects immediately with [`SyncError::Conflict`] if a mutation with the
  /// same intent name is already in flight; cache state is untouched in that
  /// case.
  pub async fn mutate<F, Fut>(
    &self,
    intent: MutationIntent,
    optimistic: Option<PatchFn>,
    operation: F,
  ) -> Result<Value, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, SyncError>>,
  {
    let _guard = match IntentGuard::acquire(&self.in_flight, intent.name()) {
      Some(guard) => guard,
      None => {
        debug!(intent = intent.name(), "rejecting conflicting mutation");
        return Err(SyncError::Conflict(intent.name().to_string()));
      }
    };

    let snapshots = match &optimistic {
      Some(patch) => {
        let mut snapshots: Vec<(QueryKey, CacheEntry)> = Vec::new();
        for key in intent.affected_keys() {
          let before = self.store.read(key);
          let patched = patch(key, before.data.clone());
          snapshots.push((key.clone(), before));
          self.store.apply_patch(key, patched);
        }
        debug!(intent = intent.name(), keys = snapshots.len(), "applied optimistic patch");
        snapshots
      }
      None => Vec::new(),
    };

    match operation().await {
      Ok(result) => {
        // The optimistic value is a guess; re-fetch ground truth.
        let affected = intent.affects.clone();
        self
          .store
          .invalidate(|key| affected.iter().any(|k| k == key));
        Ok(result)
      }
      Err(err) => {
        for (key, snapshot) in snapshots.into_iter().rev() {
          self.store.restore(&key, snapshot);
        }
        warn!(intent = intent.name(), %err, "mutation failed; rolled back");
        Err(err)
      }
    }
  }
}

/// Holds the intent name in the in-flight set for the duration of a
/// mutation; released on drop so a panic can't wedge the intent.
struct IntentGuard {
  set: Arc<Mutex<HashSet<String>>>,
  name: String,
}

impl IntentGuard {
  fn acquire(set: &Arc<Mutex<HashSet<String>>>, name: &str) -> Option<Self> {
    let mut locked = set.lock().unwrap();
    if !locked.insert(name.to_string()) {
      return None;
    }
    Some(Self {
      set: Arc::clone(set),
      name: name.to_string(),
    })
  }
}

impl Drop for IntentGuard {
  fn drop(&mut self) {
    self.set.lock().unwrap().remove(&self.name);
  }
}
