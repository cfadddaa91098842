//! The query store: process-wide map from cache key to query state.
//!
//! The store is the single source of truth. It owns every query and
//! mutation entry, and all state transitions go through its methods;
//! entries are never handed out by reference. I/O never happens here —
//! fetching is the executor's job, the store only records outcomes.
//!
//! A `QueryStore` is a cheap cloneable handle over shared state, so an
//! application constructs one explicitly and passes clones around.
//! Tests get isolated caches by constructing their own instances.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::options::QueryOptions;

/// Lifecycle status of a query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Entry exists but nothing has been fetched yet.
  Idle,
  /// First fetch, no previous data to show.
  Loading,
  /// Background refresh while stale data is still servable.
  Fetching,
  Success,
  Error,
}

/// Lifecycle status of a mutation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Loading,
  Success,
  Error,
}

/// Read-only snapshot of a query entry.
///
/// `is_stale` is derived at read time from `last_fetched_at` and the
/// entry's stale time; it is never stored, so it cannot desync.
#[derive(Debug, Clone)]
pub struct QueryState {
  pub data: Option<Value>,
  pub error: Option<QueryError>,
  pub status: QueryStatus,
  pub last_fetched_at: Option<Instant>,
  pub is_stale: bool,
}

impl QueryState {
  fn idle() -> Self {
    Self {
      data: None,
      error: None,
      status: QueryStatus::Idle,
      last_fetched_at: None,
      is_stale: false,
    }
  }

  /// True during the first fetch for a key, when there is no data yet.
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  /// True whenever a fetch is in flight, foreground or background.
  pub fn is_fetching(&self) -> bool {
    matches!(self.status, QueryStatus::Loading | QueryStatus::Fetching)
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}

/// Read-only snapshot of a mutation entry.
#[derive(Debug, Clone)]
pub struct MutationState {
  pub status: MutationStatus,
  pub error: Option<QueryError>,
}

impl MutationState {
  fn idle() -> Self {
    Self {
      status: MutationStatus::Idle,
      error: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == MutationStatus::Loading
  }

  pub fn is_error(&self) -> bool {
    self.status == MutationStatus::Error
  }
}

/// Outcome of one fetch, broadcast to every coalesced caller.
pub type FetchOutcome = Result<Value, QueryError>;

/// The single in-flight request slot for a key.
pub(crate) struct InFlight {
  /// Sequence number of the attempt that owns this slot.
  pub(crate) seq: u64,
  pub(crate) tx: broadcast::Sender<FetchOutcome>,
}

pub(crate) struct QueryEntry {
  pub(crate) data: Option<Value>,
  pub(crate) error: Option<QueryError>,
  pub(crate) status: QueryStatus,
  pub(crate) last_fetched_at: Option<Instant>,
  pub(crate) stale_time: Duration,
  pub(crate) cache_time: Duration,
  /// Forced stale by `invalidate_queries`, independent of elapsed time.
  /// Cleared when the next fetch is dispatched, so one invalidation
  /// asks for exactly one refetch even if that refetch fails.
  pub(crate) invalidated: bool,
  /// Active bindings for this key.
  pub(crate) subscribers: usize,
  /// Bumped on every bind and every fetch dispatch; a pending eviction
  /// only fires if the epoch it captured is still current.
  pub(crate) epoch: u64,
  /// Monotonic per-key fetch counter; next dispatch takes the next one.
  pub(crate) next_seq: u64,
  /// Highest sequence whose outcome has been written back. Completions
  /// with a lower or equal sequence are discarded as superseded.
  pub(crate) applied_seq: u64,
  pub(crate) in_flight: Option<InFlight>,
}

impl QueryEntry {
  pub(crate) fn new(options: &QueryOptions) -> Self {
    Self {
      data: None,
      error: None,
      status: QueryStatus::Idle,
      last_fetched_at: None,
      stale_time: options.stale_time,
      cache_time: options.cache_time,
      invalidated: false,
      subscribers: 0,
      epoch: 0,
      next_seq: 0,
      applied_seq: 0,
      in_flight: None,
    }
  }

  pub(crate) fn is_stale(&self, now: Instant) -> bool {
    if self.invalidated {
      return true;
    }
    match self.last_fetched_at {
      Some(at) => now.duration_since(at) >= self.stale_time,
      None => true,
    }
  }

  /// Clear the in-flight slot, but only if `seq` still owns it. A
  /// superseded fetch must not release the slot of its replacement.
  pub(crate) fn release_in_flight(&mut self, seq: u64) {
    if self
      .in_flight
      .as_ref()
      .map(|in_flight| in_flight.seq == seq)
      .unwrap_or(false)
    {
      self.in_flight = None;
    }
  }

  /// Eviction parameters if nothing subscribes to this entry. Fetch
  /// completion paths use this so keys driven only through the
  /// executor surface are still collected after their cache time.
  pub(crate) fn eviction_due(&self) -> Option<(Duration, u64)> {
    (self.subscribers == 0).then_some((self.cache_time, self.epoch))
  }

  fn snapshot(&self, now: Instant) -> QueryState {
    QueryState {
      data: self.data.clone(),
      error: self.error.clone(),
      status: self.status,
      last_fetched_at: self.last_fetched_at,
      is_stale: self.is_stale(now),
    }
  }
}

pub(crate) struct MutationEntry {
  pub(crate) status: MutationStatus,
  pub(crate) error: Option<QueryError>,
}

pub(crate) struct Inner {
  pub(crate) queries: HashMap<QueryKey, QueryEntry>,
  pub(crate) mutations: HashMap<QueryKey, MutationEntry>,
}

struct Shared {
  inner: Mutex<Inner>,
  changes: broadcast::Sender<QueryKey>,
  focus: broadcast::Sender<()>,
}

/// Cloneable handle to one query cache instance.
#[derive(Clone)]
pub struct QueryStore {
  shared: Arc<Shared>,
}

impl Default for QueryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryStore {
  /// Create an empty store. Each instance is fully isolated.
  pub fn new() -> Self {
    let (changes, _) = broadcast::channel(64);
    let (focus, _) = broadcast::channel(16);
    Self {
      shared: Arc::new(Shared {
        inner: Mutex::new(Inner {
          queries: HashMap::new(),
          mutations: HashMap::new(),
        }),
        changes,
        focus,
      }),
    }
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
    self
      .shared
      .inner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Current state for a key. Returns an idle snapshot for keys the
  /// store has never seen; never fails.
  pub fn get_query_state(&self, key: &QueryKey) -> QueryState {
    let now = Instant::now();
    let inner = self.lock();
    match inner.queries.get(key) {
      Some(entry) => entry.snapshot(now),
      None => QueryState::idle(),
    }
  }

  /// Current state for a mutation key, idle if never seen.
  pub fn get_mutation_state(&self, key: &QueryKey) -> MutationState {
    let inner = self.lock();
    match inner.mutations.get(key) {
      Some(entry) => MutationState {
        status: entry.status,
        error: entry.error.clone(),
      },
      None => MutationState::idle(),
    }
  }

  /// Patch the cached data for a key without fetching.
  ///
  /// The updater receives the current data and returns the new value.
  /// Status, error and fetch timestamps are left untouched, so a
  /// manual patch never masks an error state. No-op for unseen keys.
  pub fn update_query_data<F>(&self, key: &QueryKey, updater: F)
  where
    F: FnOnce(Option<&Value>) -> Value,
  {
    let updated = {
      let mut inner = self.lock();
      match inner.queries.get_mut(key) {
        Some(entry) => {
          entry.data = Some(updater(entry.data.as_ref()));
          true
        }
        None => false,
      }
    };
    if updated {
      self.notify(key);
    }
  }

  /// Force the given keys stale, regardless of their stale time.
  ///
  /// Data is kept and stays servable; the next active subscriber
  /// reacts by refetching. Unseen keys are ignored.
  pub fn invalidate_queries<I>(&self, keys: I)
  where
    I: IntoIterator,
    I::Item: Into<QueryKey>,
  {
    let mut touched = Vec::new();
    {
      let mut inner = self.lock();
      for key in keys {
        let key = key.into();
        if let Some(entry) = inner.queries.get_mut(&key) {
          entry.invalidated = true;
          touched.push(key);
        }
      }
    }
    for key in touched {
      debug!(key = %key, "query invalidated");
      self.notify(&key);
    }
  }

  /// Force every key matching the predicate stale.
  pub fn invalidate_matching<P>(&self, predicate: P)
  where
    P: Fn(&QueryKey) -> bool,
  {
    let mut touched = Vec::new();
    {
      let mut inner = self.lock();
      for (key, entry) in inner.queries.iter_mut() {
        if predicate(key) {
          entry.invalidated = true;
          touched.push(key.clone());
        }
      }
    }
    for key in touched {
      debug!(key = %key, "query invalidated");
      self.notify(&key);
    }
  }

  /// Drop every query and mutation entry, returning the store to its
  /// freshly-constructed state. Bindings keep working; their entries
  /// are recreated on the next fetch.
  pub fn reset(&self) {
    let mut inner = self.lock();
    inner.queries.clear();
    inner.mutations.clear();
  }

  /// Forward a window/terminal focus event from the host application.
  /// Bindings with `refetch_on_window_focus` refetch if stale.
  pub fn notify_focus(&self) {
    let _ = self.shared.focus.send(());
  }

  /// Subscribe to entry-changed notifications. Each observable state
  /// transition broadcasts the key that changed.
  pub fn subscribe_changes(&self) -> broadcast::Receiver<QueryKey> {
    self.shared.changes.subscribe()
  }

  pub(crate) fn subscribe_focus(&self) -> broadcast::Receiver<()> {
    self.shared.focus.subscribe()
  }

  /// Whether the entry was forced stale and has not refetched since.
  /// Bindings use this, not elapsed staleness, to decide whether a
  /// change notification warrants a refetch; reacting to mere
  /// staleness would loop forever under a zero stale time.
  pub(crate) fn is_invalidated(&self, key: &QueryKey) -> bool {
    let inner = self.lock();
    inner
      .queries
      .get(key)
      .map(|entry| entry.invalidated)
      .unwrap_or(false)
  }

  pub(crate) fn notify(&self, key: &QueryKey) {
    // No receivers is fine; ignore the error.
    let _ = self.shared.changes.send(key.clone());
  }

  /// Register a binding's interest in a key: bump the subscriber count
  /// and cancel any pending eviction by advancing the epoch.
  ///
  /// Several bindings may share a key with different timing options;
  /// they merge conservatively. The shortest stale time and the
  /// longest cache time win, so no binding is served data it would
  /// consider fresh-by-accident and none loses the cache earlier than
  /// it asked for.
  pub(crate) fn bind(&self, key: &QueryKey, options: &QueryOptions) {
    let mut inner = self.lock();
    let entry = inner
      .queries
      .entry(key.clone())
      .or_insert_with(|| QueryEntry::new(options));
    entry.stale_time = entry.stale_time.min(options.stale_time);
    entry.cache_time = entry.cache_time.max(options.cache_time);
    entry.subscribers += 1;
    entry.epoch += 1;
  }

  /// Drop a binding's interest. The last unbind schedules eviction
  /// after the entry's cache time.
  pub(crate) fn unbind(&self, key: &QueryKey) {
    let (schedule, cache_time, epoch) = {
      let mut inner = self.lock();
      match inner.queries.get_mut(key) {
        Some(entry) => {
          entry.subscribers = entry.subscribers.saturating_sub(1);
          (entry.subscribers == 0, entry.cache_time, entry.epoch)
        }
        None => return,
      }
    };
    if schedule {
      self.schedule_eviction(key.clone(), cache_time, epoch);
    }
  }

  pub(crate) fn schedule_eviction(&self, key: QueryKey, cache_time: Duration, epoch: u64) {
    // Bindings can be dropped during runtime shutdown; skip the timer
    // if no runtime is available.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let store = self.clone();
    handle.spawn(async move {
      tokio::time::sleep(cache_time).await;
      store.evict_if_idle(&key, epoch);
    });
  }

  fn evict_if_idle(&self, key: &QueryKey, epoch: u64) {
    let mut inner = self.lock();
    let expired = inner
      .queries
      .get(key)
      .map(|entry| entry.subscribers == 0 && entry.epoch == epoch)
      .unwrap_or(false);
    if expired {
      debug!(key = %key, "evicting unused query entry");
      inner.queries.remove(key);
    }
  }
}

impl std::fmt::Debug for QueryStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.lock();
    f.debug_struct("QueryStore")
      .field("queries", &inner.queries.len())
      .field("mutations", &inner.mutations.len())
      .finish()
  }
}
