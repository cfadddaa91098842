//! Cache keys for queries and mutations.
//!
//! Keys are opaque, equality-comparable tokens. Callers that want
//! composite keys build them from primitive segments; segments are
//! joined deterministically so the same logical key always hashes to
//! the same entry.

use std::fmt;

/// Identifies one logical resource in the query store.
///
/// A key is just a string under the hood. Build one from a literal,
/// or from segments when the key is parameterized:
///
/// ```
/// use requery::QueryKey;
///
/// let plain = QueryKey::new("users");
/// let composite = QueryKey::from_segments(["users", "42", "posts"]);
/// assert_eq!(composite.as_str(), "users|42|posts");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
  /// Create a key from a single string.
  ///
  /// Keys must be non-empty; an empty key is a caller bug, caught by a
  /// `debug_assert` in debug builds. Release builds do not pay for the
  /// check and treat `""` as an ordinary (if useless) key.
  pub fn new(key: impl Into<String>) -> Self {
    let key = key.into();
    debug_assert!(!key.is_empty(), "cache keys must be non-empty");
    Self(key)
  }

  /// Create a key by joining primitive segments with `|`.
  pub fn from_segments<I>(segments: I) -> Self
  where
    I: IntoIterator,
    I::Item: fmt::Display,
  {
    let joined = segments
      .into_iter()
      .map(|s| s.to_string())
      .collect::<Vec<_>>()
      .join("|");
    Self::new(joined)
  }

  /// Derive a child key, e.g. a per-page key for infinite queries.
  pub fn child(&self, segment: impl fmt::Display) -> Self {
    Self(format!("{}:{}", self.0, segment))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for QueryKey {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for QueryKey {
  fn from(s: String) -> Self {
    Self::new(s)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
