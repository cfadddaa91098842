//! Typed configuration for queries and mutations.
//!
//! Every option has a stated default; an options struct is always
//! fully populated, so the rest of the engine never merges option
//! bags. Overrides happen in one place, through the `with_*` builders,
//! before an operation begins.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::store::QueryStore;

/// Callback invoked with a successfully fetched value.
pub type SuccessCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback invoked with a terminal error.
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;

/// Callback invoked once a mutation settles, success or failure.
pub type SettledCallback = Arc<dyn Fn(Option<&Value>, Option<&QueryError>) + Send + Sync>;

/// Optimistic patch applied to the store before a mutator is awaited.
pub type OptimisticUpdate = Arc<dyn Fn(&QueryStore) + Send + Sync>;

/// Configuration for a query binding or a direct `execute_query` call.
#[derive(Clone)]
pub struct QueryOptions {
  /// Whether the binding fetches at all. Disabled bindings still read
  /// cached state and can be driven manually through `refetch`.
  pub enabled: bool,
  /// How long an entry with zero subscribers survives before eviction.
  pub cache_time: Duration,
  /// Freshness window; elapsed data past this is stale.
  pub stale_time: Duration,
  /// Total fetch attempts before giving up.
  pub retry: u32,
  /// Linear delay between attempts. No implicit backoff multiplier.
  pub retry_delay: Duration,
  /// Refetch stale entries when the host application regains focus.
  pub refetch_on_window_focus: bool,
  /// Fetch on bind when no fresh data exists.
  pub refetch_on_mount: bool,
  /// Fixed-interval background refetch, disabled by default.
  pub refetch_interval: Option<Duration>,
  pub on_success: Option<SuccessCallback>,
  pub on_error: Option<ErrorCallback>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      cache_time: Duration::from_secs(5 * 60),
      stale_time: Duration::ZERO,
      retry: 3,
      retry_delay: Duration::from_millis(1000),
      refetch_on_window_focus: true,
      refetch_on_mount: true,
      refetch_interval: None,
      on_success: None,
      on_error: None,
    }
  }
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_cache_time(mut self, duration: Duration) -> Self {
    self.cache_time = duration;
    self
  }

  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn with_retry(mut self, attempts: u32) -> Self {
    self.retry = attempts;
    self
  }

  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn refetch_on_window_focus(mut self, refetch: bool) -> Self {
    self.refetch_on_window_focus = refetch;
    self
  }

  pub fn refetch_on_mount(mut self, refetch: bool) -> Self {
    self.refetch_on_mount = refetch;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }

  pub fn on_success(mut self, cb: impl Fn(&Value) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(cb));
    self
  }

  pub fn on_error(mut self, cb: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(cb));
    self
  }
}

impl fmt::Debug for QueryOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("enabled", &self.enabled)
      .field("cache_time", &self.cache_time)
      .field("stale_time", &self.stale_time)
      .field("retry", &self.retry)
      .field("retry_delay", &self.retry_delay)
      .field("refetch_on_window_focus", &self.refetch_on_window_focus)
      .field("refetch_on_mount", &self.refetch_on_mount)
      .field("refetch_interval", &self.refetch_interval)
      .finish_non_exhaustive()
  }
}

/// Configuration for a mutation.
#[derive(Clone)]
pub struct MutationOptions {
  /// Total mutator attempts before giving up.
  pub retry: u32,
  /// Linear delay between attempts.
  pub retry_delay: Duration,
  /// Query keys forced stale after the mutator resolves.
  pub invalidate_queries: Vec<QueryKey>,
  pub on_success: Option<SuccessCallback>,
  pub on_error: Option<ErrorCallback>,
  pub on_settled: Option<SettledCallback>,
  /// Applied to the store before the mutator runs.
  pub optimistic_update: Option<OptimisticUpdate>,
}

impl Default for MutationOptions {
  fn default() -> Self {
    Self {
      retry: 1,
      retry_delay: Duration::from_millis(1000),
      invalidate_queries: Vec::new(),
      on_success: None,
      on_error: None,
      on_settled: None,
      optimistic_update: None,
    }
  }
}

impl MutationOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_retry(mut self, attempts: u32) -> Self {
    self.retry = attempts;
    self
  }

  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  /// Mark these keys stale once the mutation succeeds.
  pub fn invalidates<I>(mut self, keys: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<QueryKey>,
  {
    self.invalidate_queries = keys.into_iter().map(Into::into).collect();
    self
  }

  pub fn on_success(mut self, cb: impl Fn(&Value) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(cb));
    self
  }

  pub fn on_error(mut self, cb: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(cb));
    self
  }

  pub fn on_settled(
    mut self,
    cb: impl Fn(Option<&Value>, Option<&QueryError>) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(cb));
    self
  }

  pub fn with_optimistic_update(
    mut self,
    update: impl Fn(&QueryStore) + Send + Sync + 'static,
  ) -> Self {
    self.optimistic_update = Some(Arc::new(update));
    self
  }
}

impl fmt::Debug for MutationOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationOptions")
      .field("retry", &self.retry)
      .field("retry_delay", &self.retry_delay)
      .field("invalidate_queries", &self.invalidate_queries)
      .finish_non_exhaustive()
  }
}
