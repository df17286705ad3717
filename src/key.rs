//! Query key types: semantic identity for cacheable server state.

use sha2::{Digest, Sha256};

/// One segment of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
  Str(String),
  Int(i64),
  Bool(bool),
}

impl From<&str> for KeyPart {
  fn from(v: &str) -> Self {
    KeyPart::Str(v.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(v: String) -> Self {
    KeyPart::Str(v)
  }
}

impl From<i64> for KeyPart {
  fn from(v: i64) -> Self {
    KeyPart::Int(v)
  }
}

impl From<u32> for KeyPart {
  fn from(v: u32) -> Self {
    KeyPart::Int(v as i64)
  }
}

impl From<bool> for KeyPart {
  fn from(v: bool) -> Self {
    KeyPart::Bool(v)
  }
}

/// Identity of a unit of server-derived state, e.g.
/// `["properties", page, limit, address_filter]`.
///
/// Keys are an ordered sequence of primitive parts: two keys are equal iff
/// their parts are equal element-wise, in order. A key is never mutated after
/// construction - changing any parameter means building a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  parts: Vec<KeyPart>,
}

impl QueryKey {
  /// Start a key with the resource name as its first part.
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      parts: vec![KeyPart::Str(resource.into())],
    }
  }

  /// Append a parameter. Parameter order is part of the identity.
  pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
    self.parts.push(part.into());
    self
  }

  /// The resource name this key was started with.
  pub fn resource(&self) -> Option<&str> {
    match self.parts.first() {
      Some(KeyPart::Str(s)) => Some(s),
      _ => None,
    }
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.parts
  }

  /// Stable, fixed-length identity string for storage and de-duplication.
  ///
  /// Each part is type-tagged and length-prefixed before hashing so that
  /// e.g. `["ab", "c"]` and `["a", "bc"]` never collide.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    for part in &self.parts {
      match part {
        KeyPart::Str(s) => {
          hasher.update(b"s");
          hasher.update((s.len() as u64).to_le_bytes());
          hasher.update(s.as_bytes());
        }
        KeyPart::Int(i) => {
          hasher.update(b"i");
          hasher.update(i.to_le_bytes());
        }
        KeyPart::Bool(b) => {
          hasher.update(if *b { b"t" } else { b"f" });
        }
      }
    }
    hex::encode(hasher.finalize())
  }

  /// Human-readable form for logs.
  pub fn description(&self) -> String {
    let rendered: Vec<String> = self
      .parts
      .iter()
      .map(|p| match p {
        KeyPart::Str(s) => s.clone(),
        KeyPart::Int(i) => i.to_string(),
        KeyPart::Bool(b) => b.to_string(),
      })
      .collect();
    rendered.join("/")
  }
}
