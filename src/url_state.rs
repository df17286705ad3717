//! Bidirectional binding between list state and the URL query string.
//!
//! Pagination and filter state for a collection view lives in the URL so
//! that navigation, reload and link sharing land on the same page of the
//! same filtered list. This module owns that state: it parses recognized
//! query parameters into a [`PageState`], serializes only non-default values
//! back out, and derives cache keys from the result. The cache store is
//! never touched from here.

use std::collections::BTreeMap;
use std::sync::Mutex;

use url::form_urlencoded;

use crate::key::QueryKey;

/// Pagination and filter state for one collection view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageState {
  /// Zero-based page index.
  pub page: u32,
  /// Items per page; always positive.
  pub limit: u32,
  /// Named filter values. Empty values are never stored - an empty filter
  /// is the same as an absent one.
  pub filters: BTreeMap<String, String>,
}

impl PageState {
  pub fn new(limit: u32) -> Self {
    Self {
      page: 0,
      limit: limit.max(1),
      filters: BTreeMap::new(),
    }
  }

  /// Set or clear a filter. Any filter change resets the page to 0: the old
  /// page index is meaningless against a different result set.
  pub fn set_filter(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let value = value.into();
    if value.is_empty() {
      self.filters.remove(&name.into());
    } else {
      self.filters.insert(name.into(), value);
    }
    self.page = 0;
  }

  pub fn set_page(&mut self, page: u32) {
    self.page = page;
  }

  pub fn filter(&self, name: &str) -> Option<&str> {
    self.filters.get(name).map(String::as_str)
  }

  /// Cache key for this state: resource name, page, limit, then each filter
  /// as a name/value pair in name order.
  pub fn key(&self, resource: &str) -> QueryKey {
    let mut key = QueryKey::new(resource).push(self.page).push(self.limit);
    for (name, value) in &self.filters {
      key = key.push(name.as_str()).push(value.as_str());
    }
    key
  }
}

/// Maps [`PageState`] to and from the navigable URL query string for one
/// collection view, without feedback loops.
///
/// Only `page`, `limit` and the filter names given at construction are
/// recognized; anything else in the query string is ignored here and left
/// for the host navigation mechanism to round-trip opaquely.
pub struct UrlSync {
  default_limit: u32,
  filter_names: Vec<String>,
  last_written: Mutex<Option<String>>,
}

impl UrlSync {
  pub fn new<I, S>(default_limit: u32, filter_names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      default_limit: default_limit.max(1),
      filter_names: filter_names.into_iter().map(Into::into).collect(),
      last_written: Mutex::new(None),
    }
  }

  /// Parse a query string (with or without a leading `?`). Malformed or
  /// missing values fall back to defaults: page 0, default limit, no
  /// filters.
  pub fn state_from_url(&self, query: &str) -> PageState {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut state = PageState::new(self.default_limit);

    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
      match name.as_ref() {
        "page" => {
          state.page = value.parse().unwrap_or(0);
        }
        "limit" => {
          if let Ok(limit) = value.parse::<u32>() {
            if limit > 0 {
              state.limit = limit;
            }
          }
        }
        other => {
          if !value.is_empty() && self.filter_names.iter().any(|f| f == other) {
            state.filters.insert(other.to_string(), value.into_owned());
          }
        }
      }
    }
    state
  }

  /// Serialize a state, omitting every parameter that equals its default so
  /// URLs stay minimal. The written string is remembered so the echo of our
  /// own navigation update can be recognized by
  /// [`apply_navigation`](Self::apply_navigation).
  pub fn url_from_state(&self, state: &PageState) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    if state.page != 0 {
      serializer.append_pair("page", &state.page.to_string());
    }
    if state.limit != self.default_limit {
      serializer.append_pair("limit", &state.limit.to_string());
    }
    for (name, value) in &state.filters {
      if !value.is_empty() {
        serializer.append_pair(name, value);
      }
    }
    let query = serializer.finish();
    *self.last_written.lock().unwrap() = Some(query.clone());
    query
  }

  /// Handle an incoming navigation. Returns the parsed state, or `None`
  /// when the navigation is just the echo of the last
  /// [`url_from_state`](Self::url_from_state) write - re-deriving state
  /// from our own write would loop forever.
  pub fn apply_navigation(&self, query: &str) -> Option<PageState> {
    let normalized = query.strip_prefix('?').unwrap_or(query);
    {
      let mut last = self.last_written.lock().unwrap();
      if last.as_deref() == Some(normalized) {
        *last = None;
        return None;
      }
    }
    Some(self.state_from_url(normalized))
  }
}
