//! Client-side data synchronization for CRUD front ends.
//!
//! Inspired by TanStack Query: a cache of server-derived state keyed by
//! semantic query identity, with de-duplication of concurrent reads, retried
//! reads with exponential backoff, optimistic writes with exact rollback,
//! debounced toggle mutations, and URL-bound pagination/filter state for
//! collection views.
//!
//! The transport is an external collaborator: every read or write is an
//! async closure supplied by the caller. Reads must be idempotent (they are
//! retried); writes are never auto-retried.
//!
//! # Example
//!
//! ```ignore
//! let client = SyncClient::new(SyncConfig::default());
//! let listing = ListingQuery::new("properties", 20, ["address"]);
//!
//! // URL -> state -> key -> cached fetch
//! if let Some(state) = listing.url().apply_navigation("?page=2&address=Main") {
//!     let api = api.clone();
//!     let page: Vec<Property> = listing
//!         .fetch_page(&client, &state, move |page| {
//!             let api = api.clone();
//!             async move { api.list_properties(page).await }
//!         })
//!         .await?;
//! }
//!
//! // Observe entry transitions for re-rendering
//! let mut sub = client.subscribe(&listing.key(&state));
//! while let Some(change) = sub.recv().await {
//!     redraw(change);
//! }
//! ```

mod cache;
mod client;
mod config;
mod debounce;
mod error;
mod fetch;
mod key;
mod listings;
mod mutate;
mod url_state;

pub use cache::{CacheEntry, CacheStore, EntryChange, EntryStatus, RequestId, Subscription};
pub use client::SyncClient;
pub use config::{RetryConfig, SyncConfig};
pub use debounce::Debouncer;
pub use error::SyncError;
pub use fetch::Fetcher;
pub use key::{KeyPart, QueryKey};
pub use listings::{LikeToggle, ListingQuery, SharedLikeToggle};
pub use mutate::{MutationExecutor, MutationIntent, PatchFn};
pub use url_state::{PageState, UrlSync};
