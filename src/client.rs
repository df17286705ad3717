//! The session-level client handle tying store, fetcher and mutations
//! together.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::{CacheEntry, CacheStore, Subscription};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fetch::Fetcher;
use crate::key::QueryKey;
use crate::mutate::{MutationExecutor, MutationIntent, PatchFn};

/// Client for the data synchronization layer.
///
/// Created once per application session and torn down with it. Clones share
/// the same cache store, in-flight request registry and mutation bookkeeping,
/// so a clone can be handed to each view.
#[derive(Clone)]
pub struct SyncClient {
  store: Arc<CacheStore>,
  fetcher: Arc<Fetcher>,
  mutations: Arc<MutationExecutor>,
  config: SyncConfig,
}

impl SyncClient {
  pub fn new(config: SyncConfig) -> Self {
    let store = Arc::new(CacheStore::new());
    let fetcher = Arc::new(Fetcher::new(Arc::clone(&store), config.retry.clone()));
    let mutations = Arc::new(MutationExecutor::new(Arc::clone(&store)));
    Self {
      store,
      fetcher,
      mutations,
      config,
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.config
  }

  /// Current entry for a key, without fetching. For read-through display of
  /// last-known data while a refresh runs.
  pub fn read(&self, key: &QueryKey) -> CacheEntry {
    self.store.read(key)
  }

  /// Register for change notifications on a key.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    self.store.subscribe(key)
  }

  /// Mark every entry matching the predicate stale; the next read for each
  /// will re-fetch while the old data stays visible.
  pub fn invalidate(&self, pred: impl Fn(&QueryKey) -> bool) -> usize {
    self.store.invalidate(pred)
  }

  /// Typed read with cache-first semantics.
  ///
  /// A fresh entry is served straight from the cache. Otherwise `operation`
  /// is executed through the fetcher: concurrent queries for the same key
  /// share one network call, transport failures are retried with backoff,
  /// and a payload that doesn't deserialize to `T` surfaces as a
  /// [`SyncError::Validation`].
  pub async fn query<T, F, Fut>(&self, key: &QueryKey, operation: F) -> Result<T, SyncError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let entry = self.store.read(key);
    if entry.is_fresh(self.config.stale_after()) {
      if let Some(data) = entry.data_as::<T>()? {
        return Ok(data);
      }
    }

    let value = self.fetcher.fetch(key, to_value_operation(operation)).await?;
    serde_json::from_value(value).map_err(|e| SyncError::validation(e.to_string()))
  }

  /// Typed read that bypasses freshness and supersedes any request already
  /// in flight for the key (last-request-wins).
  pub async fn refresh<T, F, Fut>(&self, key: &QueryKey, operation: F) -> Result<T, SyncError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let value = self
      .fetcher
      .refetch(key, to_value_operation(operation))
      .await?;
    serde_json::from_value(value).map_err(|e| SyncError::validation(e.to_string()))
  }

  /// Run a write operation with optional optimistic patching and rollback.
  /// See [`MutationExecutor::mutate`].
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
    self.mutations.mutate(intent, optimistic, operation).await
  }
}

/// Adapt a typed read operation to the JSON payloads the store keeps.
fn to_value_operation<T, F, Fut>(
  operation: F,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Value, SyncError>> + Send + Sync + 'static
where
  T: Serialize + Send + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
{
  use futures::FutureExt;
  move || {
    let fut = operation();
    async move {
      let data = fut.await?;
      serde_json::to_value(data).map_err(|e| SyncError::validation(e.to_string()))
    }
    .boxed()
  }
}
