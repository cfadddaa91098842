//! Error types for the query engine.
//!
//! Errors are `Clone` because a single fetch outcome may be broadcast
//! to every caller coalesced onto the same in-flight request.

use thiserror::Error;

/// Errors produced by queries and mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
  /// A fetcher rejected. This is what fetchers themselves return.
  #[error("{message}")]
  Fetch { message: String },

  /// A fetch kept failing until the configured attempts ran out.
  #[error("fetch failed after {attempts} attempts: {message}")]
  RetriesExhausted { attempts: u32, message: String },

  /// A mutator rejected.
  #[error("{message}")]
  Mutation { message: String },

  /// The in-flight request was dropped without producing an outcome.
  #[error("query was cancelled")]
  Cancelled,

  /// A cached value could not be decoded into the requested type.
  #[error("failed to decode cached value: {message}")]
  Decode { message: String },
}

impl QueryError {
  /// Fetch failure with a human-readable message.
  pub fn fetch(message: impl Into<String>) -> Self {
    Self::Fetch {
      message: message.into(),
    }
  }

  /// Mutation failure with a human-readable message.
  pub fn mutation(message: impl Into<String>) -> Self {
    Self::Mutation {
      message: message.into(),
    }
  }

  pub(crate) fn decode(err: serde_json::Error) -> Self {
    Self::Decode {
      message: err.to_string(),
    }
  }

  /// Wrap the last error of an exhausted retry loop.
  pub(crate) fn retries_exhausted(attempts: u32, last: &QueryError) -> Self {
    Self::RetriesExhausted {
      attempts,
      message: last.to_string(),
    }
  }
}
