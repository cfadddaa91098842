//! In-process async query cache with request coalescing, staleness
//! tracking and retries.
//!
//! Inspired by TanStack Query, this crate mediates between consumers
//! and a remote API without knowing anything about endpoint shapes:
//! it sees cache keys, fetch functions and state transitions, nothing
//! else. The cache lives for the life of the process; there is no
//! persistence and no cross-process synchronization.
//!
//! - [`QueryStore`] holds all query and mutation state and is the sole
//!   source of truth. Stores are explicit instances, never globals.
//! - `execute_query` coalesces concurrent callers onto one in-flight
//!   fetch per key, retries with a linear delay, and discards results
//!   that a newer fetch has superseded.
//! - [`Mutation`] runs one-shot writes and invalidates dependent keys
//!   when they land.
//! - [`QueryBinding`] is a consumer's live subscription: fetch on
//!   mount, refetch on focus/invalidation/interval, and teardown of
//!   every timer it owns on drop.
//!
//! # Example
//!
//! ```ignore
//! let store = QueryStore::new();
//!
//! let users: QueryBinding<Vec<User>> = QueryBinding::bind(
//!   &store,
//!   "users",
//!   move || {
//!     let api = api.clone();
//!     async move { api.list_users().await.map_err(QueryError::fetch) }
//!   },
//!   QueryOptions::default().with_stale_time(Duration::from_secs(30)),
//! );
//!
//! // In the event loop
//! users.changed().await;
//! render(users.snapshot());
//! ```

mod binding;
mod error;
mod executor;
mod infinite;
mod key;
mod mutation;
mod options;
mod store;

pub use binding::{QueryBinding, QuerySnapshot};
pub use error::QueryError;
pub use executor::{fetcher, Fetcher};
pub use infinite::InfiniteQuery;
pub use key::QueryKey;
pub use mutation::Mutation;
pub use options::{
  ErrorCallback, MutationOptions, OptimisticUpdate, QueryOptions, SettledCallback,
  SuccessCallback,
};
pub use store::{
  FetchOutcome, MutationState, MutationStatus, QueryState, QueryStatus, QueryStore,
};

/// Install a fmt subscriber for test runs, honoring `RUST_LOG`.
/// Idempotent; later calls after the first are no-ops.
#[cfg(test)]
pub(crate) fn init_test_logging() {
  use tracing_subscriber::EnvFilter;
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}
