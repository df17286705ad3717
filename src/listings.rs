//! Glue for paginated, filterable collection views and like/unlike toggles.
//!
//! This is the surface the presentation layer talks to for listing pages
//! (properties, communities, users): URL-bound page state in, cached pages
//! out, plus a debounced optimistic toggle for per-item likes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::client::SyncClient;
use crate::debounce::Debouncer;
use crate::error::SyncError;
use crate::key::QueryKey;
use crate::mutate::{MutationIntent, PatchFn};
use crate::url_state::{PageState, UrlSync};

/// One paginated, filterable collection bound to the URL.
pub struct ListingQuery {
  resource: String,
  url: UrlSync,
}

impl ListingQuery {
  pub fn new<I, S>(resource: impl Into<String>, default_limit: u32, filter_names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      resource: resource.into(),
      url: UrlSync::new(default_limit, filter_names),
    }
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  /// The URL binding for this collection.
  pub fn url(&self) -> &UrlSync {
    &self.url
  }

  /// Cache key for one page of this collection.
  pub fn key(&self, state: &PageState) -> QueryKey {
    state.key(&self.resource)
  }

  /// Fetch the page described by `state`, cache-first. The loader receives
  /// the page state and performs the actual read.
  pub async fn fetch_page<T, F, Fut>(
    &self,
    client: &SyncClient,
    state: &PageState,
    loader: F,
  ) -> Result<T, SyncError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(PageState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let page = state.clone();
    client
      .query(&self.key(state), move || loader(page.clone()))
      .await
  }

  /// Mark every cached page of this collection stale, e.g. after a mutation
  /// that changed the underlying set.
  pub fn invalidate_all(&self, client: &SyncClient) -> usize {
    let resource = self.resource.clone();
    client.invalidate(move |key| key.resource() == Some(resource.as_str()))
  }
}

/// A debounced like/unlike action for one target.
///
/// Rapid toggling collapses to a single network write carrying the state of
/// the *last* click, after the quiet period. Each effective write patches
/// the affected entries optimistically through the mutation executor and is
/// rolled back if the server rejects it.
pub struct LikeToggle {
  debouncer: Debouncer<bool>,
}

impl LikeToggle {
  /// `patch_for` builds the optimistic patch for a desired liked-state;
  /// `write` performs the network call. The mutation intent carries the
  /// affected keys and scopes the one-in-flight rule.
  pub fn new<P, F, Fut>(
    client: SyncClient,
    intent: MutationIntent,
    quiet_period: Duration,
    patch_for: P,
    write: F,
  ) -> Self
  where
    P: Fn(bool) -> PatchFn + Send + 'static,
    F: Fn(bool) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
  {
    let debouncer = Debouncer::new(quiet_period, move |liked: bool| {
      let client = client.clone();
      let intent = intent.clone();
      let patch = patch_for(liked);
      let write = write(liked);
      async move {
        if let Err(err) = client.mutate(intent, Some(patch), || write).await {
          // Conflicts and write failures have already been handled by the
          // executor (cache untouched / rolled back); nothing to do here
          // but record it.
          warn!(%err, "debounced like toggle failed");
        }
      }
    });
    Self { debouncer }
  }

  /// A toggle whose optimistic patch sets a boolean "is liked" projection
  /// under `liked_key`.
  pub fn boolean(
    client: SyncClient,
    intent_name: impl Into<String>,
    liked_key: QueryKey,
    quiet_period: Duration,
    write: impl Fn(bool) -> futures::future::BoxFuture<'static, Result<Value, SyncError>>
      + Send
      + 'static,
  ) -> Self {
    let intent = MutationIntent::new(intent_name).affects(liked_key.clone());
    Self::new(
      client,
      intent,
      quiet_period,
      move |liked| -> PatchFn {
        let target = liked_key.clone();
        Box::new(move |key, data| {
          if *key == target {
            Some(Value::Bool(liked))
          } else {
            data
          }
        })
      },
      write,
    )
  }

  /// Record a click. The state passed to the network write is the one from
  /// the most recent call before the quiet period elapses.
  pub fn set(&self, liked: bool) {
    self.debouncer.call(liked);
  }
}

/// Convenience for sharing a toggle between views.
pub type SharedLikeToggle = Arc<LikeToggle>;
