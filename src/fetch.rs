//! Read execution: de-duplication, retry with backoff, last-request-wins.
//!
//! The fetcher runs externally supplied async read operations and feeds
//! their results into the cache store. Concurrent reads for the same key
//! attach to the one outstanding request instead of issuing duplicates, and
//! a response belonging to a superseded request never overwrites the entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{CacheStore, RequestId};
use crate::config::RetryConfig;
use crate::error::SyncError;
use crate::key::QueryKey;

type FetchResult = Result<Value, SyncError>;

struct InFlight {
  request_id: RequestId,
  tx: broadcast::Sender<FetchResult>,
}

/// Executes read operations for query keys.
pub struct Fetcher {
  store: Arc<CacheStore>,
  retry: RetryConfig,
  in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
  next_request_id: AtomicU64,
}

impl Fetcher {
  pub fn new(store: Arc<CacheStore>, retry: RetryConfig) -> Self {
    Self {
      store,
      retry,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_request_id: AtomicU64::new(1),
    }
  }

  /// Run `operation` for `key`, de-duplicating against any request already
  /// in flight for the same key.
  ///
  /// Transport failures are retried with exponentially increasing delays,
  /// up to the configured count; validation failures are terminal. The
  /// returned future may be dropped freely: once every attached consumer is
  /// gone the fetcher stops scheduling retries, but the cache entry is left
  /// in place for later reads.
  pub async fn fetch<F, Fut>(&self, key: &QueryKey, operation: F) -> FetchResult
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    let mut rx = self.begin(key, operation, false);
    match rx.recv().await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Cancelled),
    }
  }

  /// Like [`fetch`](Self::fetch), but supersedes any request already in
  /// flight for the key: the newer request takes over the entry and the
  /// older response is discarded when it arrives (last-request-wins).
  pub async fn refetch<F, Fut>(&self, key: &QueryKey, operation: F) -> FetchResult
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    let mut rx = self.begin(key, operation, true);
    match rx.recv().await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Cancelled),
    }
  }

  fn begin<F, Fut>(&self, key: &QueryKey, operation: F, force: bool) -> broadcast::Receiver<FetchResult>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    let hash = key.cache_hash();

    let mut in_flight = self.in_flight.lock().unwrap();
    if !force {
      if let Some(existing) = in_flight.get(&hash) {
        debug!(key = %key.description(), "attaching to in-flight request");
        return existing.tx.subscribe();
      }
    }

    let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
    // One message per request; late subscribers can't exist because the
    // registry entry is removed before the result is sent.
    let (tx, rx) = broadcast::channel(1);
    in_flight.insert(
      hash.clone(),
      InFlight {
        request_id,
        tx: tx.clone(),
      },
    );
    drop(in_flight);

    self.spawn_request(key.clone(), hash, request_id, operation, tx);
    rx
  }

  fn spawn_request<F, Fut>(
    &self,
    key: QueryKey,
    hash: String,
    request_id: RequestId,
    operation: F,
    tx: broadcast::Sender<FetchResult>,
  ) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult> + Send + 'static,
  {
    let store = Arc::clone(&self.store);
    let registry = Arc::clone(&self.in_flight);
    let retry = self.retry.clone();

    store.set_pending(&key, request_id);
    debug!(key = %key.description(), request_id, "fetch started");

    tokio::spawn(async move {
      let result = run_attempts(&store, &key, request_id, &operation, &retry, &tx).await;

      // Deregister before delivering, so a read racing with completion
      // starts a fresh request instead of attaching to a finished one.
      // A superseding refetch may already own the slot; leave it alone.
      {
        let mut in_flight = registry.lock().unwrap();
        if in_flight.get(&hash).map(|f| f.request_id) == Some(request_id) {
          in_flight.remove(&hash);
        }
      }
      let _ = tx.send(result);
    });
  }
}

/// The retry loop for one request. The same request id is reused across
/// every attempt; only transport errors are retried.
async fn run_attempts<F, Fut>(
  store: &CacheStore,
  key: &QueryKey,
  request_id: RequestId,
  operation: &F,
  retry: &RetryConfig,
  tx: &broadcast::Sender<FetchResult>,
) -> FetchResult
where
  F: Fn() -> Fut,
  Fut: Future<Output = FetchResult>,
{
  let mut attempt: u32 = 0;
  loop {
    match operation().await {
      Ok(data) => {
        if !store.write_if_current(key, request_id, data.clone()) {
          // A newer request owns the entry now; consumers of this call
          // still get the value they asked for.
          debug!(key = %key.description(), request_id, "response superseded");
        }
        return Ok(data);
      }
      Err(err) if err.is_retryable() && attempt < retry.max_retries => {
        if tx.receiver_count() == 0 {
          debug!(key = %key.description(), "all consumers detached; stopping retries");
          store.set_error_if_current(key, request_id, err.clone());
          return Err(err);
        }
        let delay = backoff_delay(retry, attempt);
        debug!(
          key = %key.description(),
          attempt,
          delay_ms = delay.as_millis() as u64,
          "read failed; retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(err) => {
        warn!(key = %key.description(), %err, "read failed; giving up");
        store.set_error_if_current(key, request_id, err.clone());
        return Err(err);
      }
    }
  }
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, plus
/// an optional jitter bounded to a quarter of the delay so the sequence
/// stays strictly increasing.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
  let base = Duration::from_millis(retry.base_delay_ms.max(1));
  let delay = base.saturating_mul(2u32.saturating_pow(attempt));
  if retry.jitter {
    let cap = delay / 4;
    if !cap.is_zero() {
      return delay + rand::thread_rng().gen_range(Duration::ZERO..cap);
    }
  }
  delay
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryStatus;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;

  /// Route retry/supersede traces to the test writer; run with RUST_LOG set
  /// to see them.
  fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  fn properties_key(page: u32) -> QueryKey {
    QueryKey::new("properties").push(page).push(20u32)
  }

  fn fast_retry() -> RetryConfig {
    RetryConfig {
      base_delay_ms: 5,
      max_retries: 3,
      jitter: false,
    }
  }

  fn fetcher() -> (Arc<CacheStore>, Fetcher) {
    let store = Arc::new(CacheStore::new());
    let fetcher = Fetcher::new(Arc::clone(&store), fast_retry());
    (store, fetcher)
  }

  #[test]
  fn test_backoff_strictly_increases() {
    for &jitter in &[false, true] {
      let retry = RetryConfig {
        base_delay_ms: 100,
        max_retries: 5,
        jitter,
      };
      let delays: Vec<Duration> = (0..5).map(|a| backoff_delay(&retry, a)).collect();
      for pair in delays.windows(2) {
        assert!(pair[1] > pair[0], "expected {:?} > {:?}", pair[1], pair[0]);
      }
    }
  }

  #[tokio::test]
  async fn test_fetch_writes_entry() {
    let (store, fetcher) = fetcher();
    let key = properties_key(0);

    let result = fetcher
      .fetch(&key, || async { Ok(json!(["house a", "house b"])) })
      .await
      .unwrap();
    assert_eq!(result, json!(["house a", "house b"]));

    let entry = store.read(&key);
    assert_eq!(entry.status, EntryStatus::Success);
    assert_eq!(entry.data, Some(json!(["house a", "house b"])));
    assert!(entry.fetched_at.is_some());
  }

  #[tokio::test]
  async fn test_concurrent_reads_issue_one_network_call() {
    let (_store, fetcher) = fetcher();
    let fetcher = Arc::new(fetcher);
    let key = properties_key(1);
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
      let fetcher = Arc::clone(&fetcher);
      let key = key.clone();
      let calls = Arc::clone(&calls);
      handles.push(tokio::spawn(async move {
        fetcher
          .fetch(&key, move || {
            let calls = Arc::clone(&calls);
            async move {
              calls.fetch_add(1, Ordering::SeqCst);
              tokio::time::sleep(Duration::from_millis(30)).await;
              Ok(json!(["page one"]))
            }
          })
          .await
      }));
    }

    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap(), json!(["page one"]));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_distinct_keys_fetch_independently() {
    let (store, fetcher) = fetcher();

    // Page 0 resolves slowly, page 1 quickly; the late page-0 response must
    // land in the page-0 entry only.
    let key0 = properties_key(0);
    let key1 = properties_key(1);
    let slow = fetcher.fetch(&key0, || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(json!(["page zero"]))
    });
    let fast = fetcher.fetch(&key1, || async { Ok(json!(["page one"])) });

    let (slow, fast) = tokio::join!(slow, fast);
    slow.unwrap();
    fast.unwrap();

    assert_eq!(store.read(&properties_key(0)).data, Some(json!(["page zero"])));
    assert_eq!(store.read(&properties_key(1)).data, Some(json!(["page one"])));
  }

  #[tokio::test]
  async fn test_transport_errors_retried_then_error() {
    init_tracing();
    let (store, fetcher) = fetcher();
    let key = properties_key(2);
    let attempts = Arc::new(AtomicU32::new(0));

    let attempts_in = Arc::clone(&attempts);
    let result = fetcher
      .fetch(&key, move || {
        let attempts = Arc::clone(&attempts_in);
        async move {
          attempts.fetch_add(1, Ordering::SeqCst);
          Err::<Value, _>(SyncError::transport("503"))
        }
      })
      .await;

    assert_eq!(result, Err(SyncError::transport("503")));
    // Initial attempt + 3 retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let entry = store.read(&key);
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.error, Some(SyncError::transport("503")));
  }

  #[tokio::test]
  async fn test_failed_refresh_preserves_previous_data() {
    let (store, fetcher) = fetcher();
    let key = properties_key(3);

    fetcher
      .fetch(&key, || async { Ok(json!(["cached earlier"])) })
      .await
      .unwrap();

    let result = fetcher
      .refetch(&key, || async { Err::<Value, _>(SyncError::transport("down")) })
      .await;
    assert!(result.is_err());

    let entry = store.read(&key);
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.data, Some(json!(["cached earlier"])));
  }

  #[tokio::test]
  async fn test_validation_error_is_not_retried() {
    let (_store, fetcher) = fetcher();
    let attempts = Arc::new(AtomicU32::new(0));

    let attempts_in = Arc::clone(&attempts);
    let result = fetcher
      .fetch(&properties_key(4), move || {
        let attempts = Arc::clone(&attempts_in);
        async move {
          attempts.fetch_add(1, Ordering::SeqCst);
          Err::<Value, _>(SyncError::validation("shape mismatch"))
        }
      })
      .await;

    assert!(matches!(result, Err(SyncError::Validation(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refetch_supersedes_slow_request() {
    init_tracing();
    let (store, fetcher) = fetcher();
    let fetcher = Arc::new(fetcher);
    let key = properties_key(5);

    let slow_fetcher = Arc::clone(&fetcher);
    let slow_key = key.clone();
    let slow = tokio::spawn(async move {
      slow_fetcher
        .fetch(&slow_key, || async {
          tokio::time::sleep(Duration::from_millis(60)).await;
          Ok(json!(["stale"]))
        })
        .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    fetcher
      .refetch(&key, || async { Ok(json!(["current"])) })
      .await
      .unwrap();

    // The slow response arrives later but must not win.
    let _ = slow.await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(store.read(&key).data, Some(json!(["current"])));
    assert_eq!(store.read(&key).status, EntryStatus::Success);
  }
}
