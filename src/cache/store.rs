//! The cache store: the single shared, mutable home of entry state.
//!
//! All entry mutation goes through the narrow contract below - the fetcher
//! and mutation executor never hold a second copy of entry state. The store
//! performs no network calls; its only side effects are entry mutation and
//! subscriber notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::entry::{CacheEntry, EntryStatus, RequestId};
use crate::error::SyncError;
use crate::key::QueryKey;

/// Notification sent to subscribers when an entry changes.
#[derive(Debug, Clone)]
pub struct EntryChange {
  pub key: QueryKey,
  pub status: EntryStatus,
}

struct Slot {
  key: QueryKey,
  entry: CacheEntry,
}

struct SubscriberSlot {
  id: u64,
  tx: mpsc::UnboundedSender<EntryChange>,
}

type SubscriberRegistry = Arc<Mutex<HashMap<String, Vec<SubscriberSlot>>>>;

/// In-memory cache of server-derived state, one entry per query key.
///
/// Created once per application session and passed around explicitly
/// (usually behind an `Arc`); dropped on session end.
pub struct CacheStore {
  entries: Mutex<HashMap<String, Slot>>,
  subscribers: SubscriberRegistry,
  next_subscriber_id: AtomicU64,
}

impl CacheStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      subscribers: Arc::new(Mutex::new(HashMap::new())),
      next_subscriber_id: AtomicU64::new(1),
    }
  }

  /// Current entry for a key, creating an idle entry if absent. Never blocks
  /// on anything but the store lock.
  pub fn read(&self, key: &QueryKey) -> CacheEntry {
    let mut entries = self.entries.lock().unwrap();
    entries
      .entry(key.cache_hash())
      .or_insert_with(|| Slot {
        key: key.clone(),
        entry: CacheEntry::idle(),
      })
      .entry
      .clone()
  }

  /// Record a successful fetch: status becomes `Success`, `fetched_at` is
  /// set to now, any previous error and stale mark are cleared.
  pub fn write(&self, key: &QueryKey, data: Value) {
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = Self::slot_mut(&mut entries, key);
      slot.entry = CacheEntry {
        status: EntryStatus::Success,
        data: Some(data),
        error: None,
        fetched_at: Some(Utc::now()),
        in_flight: None,
        stale: false,
      };
      EntryChange {
        key: key.clone(),
        status: EntryStatus::Success,
      }
    };
    self.notify(key, change);
  }

  /// Mark a request as outstanding. Prior `data` and `fetched_at` are kept
  /// so readers see the last-known value while the refresh runs.
  pub fn set_pending(&self, key: &QueryKey, request_id: RequestId) {
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = Self::slot_mut(&mut entries, key);
      slot.entry.status = EntryStatus::Pending;
      slot.entry.error = None;
      slot.entry.in_flight = Some(request_id);
      EntryChange {
        key: key.clone(),
        status: EntryStatus::Pending,
      }
    };
    self.notify(key, change);
  }

  /// Record a terminal failure. Prior `data` is kept for display.
  pub fn set_error(&self, key: &QueryKey, error: SyncError) {
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = Self::slot_mut(&mut entries, key);
      slot.entry.status = EntryStatus::Error;
      slot.entry.error = Some(error);
      slot.entry.in_flight = None;
      EntryChange {
        key: key.clone(),
        status: EntryStatus::Error,
      }
    };
    self.notify(key, change);
  }

  /// Like [`write`](Self::write), but only if `request_id` is still the
  /// outstanding request for the key. Returns whether the write was applied.
  ///
  /// This is the last-request-wins gate: a response belonging to a
  /// superseded request is discarded even if it arrives after the newer one.
  pub fn write_if_current(&self, key: &QueryKey, request_id: RequestId, data: Value) -> bool {
    // Check and write under one lock acquisition: a superseding
    // set_pending must not be able to interleave between them.
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = match entries.get_mut(&key.cache_hash()) {
        Some(slot) if slot.entry.in_flight == Some(request_id) => slot,
        _ => {
          debug!(
            key = %key.description(),
            request_id,
            "discarding superseded response"
          );
          return false;
        }
      };
      slot.entry = CacheEntry {
        status: EntryStatus::Success,
        data: Some(data),
        error: None,
        fetched_at: Some(Utc::now()),
        in_flight: None,
        stale: false,
      };
      EntryChange {
        key: key.clone(),
        status: EntryStatus::Success,
      }
    };
    self.notify(key, change);
    true
  }

  /// Error-recording twin of [`write_if_current`](Self::write_if_current).
  pub fn set_error_if_current(&self, key: &QueryKey, request_id: RequestId, error: SyncError) -> bool {
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = match entries.get_mut(&key.cache_hash()) {
        Some(slot) if slot.entry.in_flight == Some(request_id) => slot,
        _ => return false,
      };
      slot.entry.status = EntryStatus::Error;
      slot.entry.error = Some(error);
      slot.entry.in_flight = None;
      EntryChange {
        key: key.clone(),
        status: EntryStatus::Error,
      }
    };
    self.notify(key, change);
    true
  }

  /// Mark every entry whose key matches the predicate as stale, forcing the
  /// next read to re-fetch. Data is not cleared, so the UI keeps showing the
  /// last-known value while refreshing. Returns the number of entries marked.
  pub fn invalidate(&self, pred: impl Fn(&QueryKey) -> bool) -> usize {
    let mut changes = Vec::new();
    {
      let mut entries = self.entries.lock().unwrap();
      for slot in entries.values_mut() {
        if pred(&slot.key) && !slot.entry.stale {
          slot.entry.stale = true;
          changes.push(EntryChange {
            key: slot.key.clone(),
            status: slot.entry.status,
          });
        }
      }
    }
    let count = changes.len();
    for change in changes {
      let key = change.key.clone();
      self.notify(&key, change);
    }
    if count > 0 {
      debug!(count, "invalidated cache entries");
    }
    count
  }

  /// Replace the cached value without touching status or `fetched_at`.
  /// Used by the mutation executor for optimistic patches.
  pub fn apply_patch(&self, key: &QueryKey, data: Option<Value>) {
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = Self::slot_mut(&mut entries, key);
      slot.entry.data = data;
      EntryChange {
        key: key.clone(),
        status: slot.entry.status,
      }
    };
    self.notify(key, change);
  }

  /// Restore an entry to a previously taken snapshot, exactly. Used by the
  /// mutation executor to roll back a failed optimistic patch.
  pub fn restore(&self, key: &QueryKey, snapshot: CacheEntry) {
    let change = {
      let mut entries = self.entries.lock().unwrap();
      let slot = Self::slot_mut(&mut entries, key);
      let status = snapshot.status;
      slot.entry = snapshot;
      EntryChange {
        key: key.clone(),
        status,
      }
    };
    self.notify(key, change);
  }

  /// Register for change notifications on one key. Dropping the returned
  /// subscription (or calling `unsubscribe`) guarantees no further
  /// notifications reach this listener.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    let hash = key.cache_hash();
    self
      .subscribers
      .lock()
      .unwrap()
      .entry(hash.clone())
      .or_default()
      .push(SubscriberSlot { id, tx });
    Subscription {
      id,
      hash,
      rx,
      registry: Arc::clone(&self.subscribers),
    }
  }

  fn notify(&self, key: &QueryKey, change: EntryChange) {
    let mut subscribers = self.subscribers.lock().unwrap();
    if let Some(slots) = subscribers.get_mut(&key.cache_hash()) {
      slots.retain(|slot| slot.tx.send(change.clone()).is_ok());
    }
  }

  fn slot_mut<'a>(entries: &'a mut HashMap<String, Slot>, key: &QueryKey) -> &'a mut Slot {
    entries.entry(key.cache_hash()).or_insert_with(|| Slot {
      key: key.clone(),
      entry: CacheEntry::idle(),
    })
  }
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

/// Handle to a registered listener. Receive changes with [`recv`](Self::recv);
/// drop (or call [`unsubscribe`](Self::unsubscribe)) to stop listening.
pub struct Subscription {
  id: u64,
  hash: String,
  rx: mpsc::UnboundedReceiver<EntryChange>,
  registry: SubscriberRegistry,
}

impl Subscription {
  /// Wait for the next change on the subscribed key.
  pub async fn recv(&mut self) -> Option<EntryChange> {
    self.rx.recv().await
  }

  /// Non-blocking poll for a queued change.
  pub fn try_recv(&mut self) -> Option<EntryChange> {
    self.rx.try_recv().ok()
  }

  /// Deregister. Equivalent to dropping the subscription.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let mut registry = self.registry.lock().unwrap();
    if let Some(slots) = registry.get_mut(&self.hash) {
      slots.retain(|slot| slot.id != self.id);
      if slots.is_empty() {
        registry.remove(&self.hash);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn key(page: u32) -> QueryKey {
    QueryKey::new("properties").push(page).push(20u32)
  }

  #[test]
  fn test_read_creates_idle_entry() {
    let store = CacheStore::new();
    let entry = store.read(&key(0));
    assert_eq!(entry.status, EntryStatus::Idle);
    assert!(entry.data.is_none());
  }

  #[test]
  fn test_entries_for_distinct_keys_are_independent() {
    let store = CacheStore::new();
    store.write(&key(0), json!(["a"]));
    store.set_error(&key(1), SyncError::transport("boom"));

    assert_eq!(store.read(&key(0)).status, EntryStatus::Success);
    assert_eq!(store.read(&key(1)).status, EntryStatus::Error);
    assert!(store.read(&key(1)).data.is_none());
  }

  #[test]
  fn test_pending_preserves_stale_data() {
    let store = CacheStore::new();
    store.write(&key(0), json!(["a", "b"]));
    store.set_pending(&key(0), 7);

    let entry = store.read(&key(0));
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.data, Some(json!(["a", "b"])));
    assert_eq!(entry.in_flight, Some(7));
    assert!(entry.fetched_at.is_some());
  }

  #[test]
  fn test_error_preserves_data() {
    let store = CacheStore::new();
    store.write(&key(0), json!(["a"]));
    store.set_error(&key(0), SyncError::transport("down"));

    let entry = store.read(&key(0));
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.data, Some(json!(["a"])));
  }

  #[test]
  fn test_write_if_current_discards_superseded_response() {
    let store = CacheStore::new();
    store.set_pending(&key(0), 1);
    store.set_pending(&key(0), 2);

    assert!(!store.write_if_current(&key(0), 1, json!(["old"])));
    assert!(store.write_if_current(&key(0), 2, json!(["new"])));
    assert_eq!(store.read(&key(0)).data, Some(json!(["new"])));
  }

  #[test]
  fn test_superseding_request_wins_under_concurrent_writes() {
    use std::sync::Barrier;
    use std::thread;

    let store = Arc::new(CacheStore::new());

    // An old response racing against a superseding request must never end
    // up as the final cached value, whichever thread gets there first.
    for i in 0..200u32 {
      let key = QueryKey::new("properties").push(i).push(20u32);
      store.set_pending(&key, 1);

      let barrier = Arc::new(Barrier::new(2));

      let old_store = Arc::clone(&store);
      let old_barrier = Arc::clone(&barrier);
      let old_key = key.clone();
      let old = thread::spawn(move || {
        old_barrier.wait();
        old_store.write_if_current(&old_key, 1, json!("old"));
      });

      let new_store = Arc::clone(&store);
      let new_barrier = Arc::clone(&barrier);
      let new_key = key.clone();
      let new = thread::spawn(move || {
        new_barrier.wait();
        new_store.set_pending(&new_key, 2);
        assert!(new_store.write_if_current(&new_key, 2, json!("new")));
      });

      old.join().unwrap();
      new.join().unwrap();

      assert_eq!(
        store.read(&key).data,
        Some(json!("new")),
        "iteration {}: superseded response must not win",
        i
      );
    }
  }

  #[test]
  fn test_invalidate_marks_stale_without_clearing_data() {
    let store = CacheStore::new();
    store.write(&key(0), json!(["a"]));
    store.write(&key(1), json!(["b"]));
    store.write(&QueryKey::new("users"), json!(["u"]));

    let marked = store.invalidate(|k| k.resource() == Some("properties"));
    assert_eq!(marked, 2);

    let entry = store.read(&key(0));
    assert!(entry.stale);
    assert_eq!(entry.data, Some(json!(["a"])));
    assert!(!store.read(&QueryKey::new("users")).stale);
  }

  #[tokio::test]
  async fn test_subscribe_sees_transitions() {
    let store = CacheStore::new();
    let mut sub = store.subscribe(&key(0));

    store.set_pending(&key(0), 1);
    store.write(&key(0), json!(["a"]));

    assert_eq!(sub.recv().await.unwrap().status, EntryStatus::Pending);
    assert_eq!(sub.recv().await.unwrap().status, EntryStatus::Success);
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_notifications() {
    let store = CacheStore::new();
    let sub = store.subscribe(&key(0));
    sub.unsubscribe();

    store.write(&key(0), json!(["a"]));

    // A fresh subscription only sees changes made after it registered.
    let mut sub2 = store.subscribe(&key(0));
    store.set_pending(&key(0), 1);
    assert_eq!(sub2.recv().await.unwrap().status, EntryStatus::Pending);
    assert!(sub2.try_recv().is_none());
  }

  #[tokio::test]
  async fn test_notifications_are_per_key() {
    let store = CacheStore::new();
    let mut sub = store.subscribe(&key(0));

    store.write(&key(1), json!(["other page"]));
    assert!(sub.try_recv().is_none());
  }
}
