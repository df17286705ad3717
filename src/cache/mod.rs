//! In-memory cache of server-derived state.
//!
//! One entry per query key, holding status/data/error/timestamp, with a
//! subscribe/notify contract for the presentation layer. The store is the
//! single owner of entry state; fetching and mutation live in sibling
//! modules and go through its narrow write surface.

mod entry;
mod store;

pub use entry::{CacheEntry, EntryStatus, RequestId};
pub use store::{CacheStore, EntryChange, Subscription};
