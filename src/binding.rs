//! Bindings bridge the query store to a consuming component tree.
//!
//! A binding registers interest in one key: it bumps the subscriber
//! count (cancelling any pending eviction), fetches on mount when no
//! fresh data exists, and refetches on focus regain, on invalidation,
//! and on a fixed interval when configured. All of that runs on tasks
//! the binding owns; dropping the binding aborts every task it
//! spawned, so nothing keeps ticking for a dead consumer. An already
//! in-flight fetch is deliberately not cancelled — its outcome still
//! lands in the shared cache for any other subscriber.
//!
//! The underlying cache entry outlives the binding and is evicted
//! separately, `cache_time` after the last binding goes away.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::QueryError;
use crate::executor::Fetcher;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::store::{QueryState, QueryStatus, QueryStore};

/// Typed snapshot of a query entry, as seen by one binding.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
  pub data: Option<T>,
  pub error: Option<QueryError>,
  pub status: QueryStatus,
  pub is_stale: bool,
}

impl<T> QuerySnapshot<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

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

/// A consumer's active interest in one cache key.
///
/// # Example
///
/// ```ignore
/// let binding: QueryBinding<Vec<User>> = QueryBinding::bind(
///   &store,
///   "users",
///   move || {
///     let api = api.clone();
///     async move { api.list_users().await }
///   },
///   QueryOptions::default(),
/// );
///
/// binding.changed().await;
/// let snapshot = binding.snapshot();
/// ```
pub struct QueryBinding<T> {
  store: QueryStore,
  key: QueryKey,
  fetcher: Fetcher,
  options: QueryOptions,
  tasks: Vec<JoinHandle<()>>,
  changes: broadcast::Receiver<QueryKey>,
  unbound: bool,
  _marker: PhantomData<fn() -> T>,
}

impl<T> QueryBinding<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Bind to `key`, fetching with `fetch` when the entry is absent or
  /// stale. Registers refetch triggers per `options`.
  pub fn bind<F, Fut>(
    store: &QueryStore,
    key: impl Into<QueryKey>,
    fetch: F,
    options: QueryOptions,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    let fetcher: Fetcher = Arc::new(move || {
      let fut = fetch();
      Box::pin(async move {
        fut
          .await
          .and_then(|value| serde_json::to_value(value).map_err(QueryError::decode))
      })
    });
    Self::bind_raw(store, key.into(), fetcher, options)
  }

  /// Bind without any automatic fetching; drive it with
  /// [`execute`](Self::execute). Cached state is still readable.
  pub fn lazy<F, Fut>(
    store: &QueryStore,
    key: impl Into<QueryKey>,
    fetch: F,
    options: QueryOptions,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    Self::bind(store, key, fetch, options.enabled(false))
  }

  fn bind_raw(store: &QueryStore, key: QueryKey, fetcher: Fetcher, options: QueryOptions) -> Self {
    store.bind(&key, &options);
    let changes = store.subscribe_changes();

    let mut tasks = Vec::new();
    if options.enabled {
      // Subscribe before spawning so triggers fired between bind and
      // task startup are not lost.
      let focus = store.subscribe_focus();
      let trigger_changes = store.subscribe_changes();
      tasks.push(spawn_trigger_task(
        store.clone(),
        key.clone(),
        fetcher.clone(),
        options.clone(),
        focus,
        trigger_changes,
      ));
      if let Some(interval) = options.refetch_interval {
        tasks.push(spawn_interval_task(
          store.clone(),
          key.clone(),
          fetcher.clone(),
          options.clone(),
          interval,
        ));
      }
    }

    Self {
      store: store.clone(),
      key,
      fetcher,
      options,
      tasks,
      changes,
      unbound: false,
      _marker: PhantomData,
    }
  }

  /// Current state of the bound entry, decoded into `T`.
  pub fn snapshot(&self) -> QuerySnapshot<T> {
    decode_state(self.store.get_query_state(&self.key))
  }

  /// Force a new fetch, replacing any in-flight one, and return its
  /// result.
  pub async fn refetch(&self) -> Result<T, QueryError> {
    let value = self
      .store
      .refetch_query(&self.key, self.fetcher.clone(), &self.options)
      .await?;
    serde_json::from_value(value).map_err(QueryError::decode)
  }

  /// Run the query once. For lazy bindings this is the way to start a
  /// fetch; fresh cached data is served without fetching.
  pub async fn execute(&self) -> Result<T, QueryError> {
    let value = self
      .store
      .execute_fetch(&self.key, self.fetcher.clone(), &self.options, false)
      .await?;
    serde_json::from_value(value).map_err(QueryError::decode)
  }

  /// Patch the cached data without fetching, e.g. after a local edit.
  pub fn update_data<F>(&self, updater: F)
  where
    F: FnOnce(Option<T>) -> T,
  {
    self.store.update_query_data(&self.key, |old| {
      let previous = old.cloned();
      let old_typed = previous
        .clone()
        .and_then(|value| serde_json::from_value(value).ok());
      match serde_json::to_value(updater(old_typed)) {
        Ok(value) => value,
        // Keep the old value rather than poison the entry.
        Err(_) => previous.unwrap_or(Value::Null),
      }
    });
  }

  /// Wait until the bound entry changes. Lagging behind the change
  /// stream counts as changed.
  pub async fn changed(&mut self) {
    loop {
      match self.changes.recv().await {
        Ok(key) if key == self.key => return,
        Ok(_) => {}
        Err(broadcast::error::RecvError::Lagged(_)) => return,
        Err(broadcast::error::RecvError::Closed) => return,
      }
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Tear down explicitly. Equivalent to dropping the binding.
  pub fn unbind(mut self) {
    self.teardown();
  }
}

impl<T> QueryBinding<T> {
  /// Cancel every task this binding owns and release its interest in
  /// the key. Cleanup runs exactly once, from `unbind` or `Drop`.
  fn teardown(&mut self) {
    if self.unbound {
      return;
    }
    self.unbound = true;
    for task in self.tasks.drain(..) {
      task.abort();
    }
    debug!(key = %self.key, "binding torn down");
    self.store.unbind(&self.key);
  }
}

impl<T> Drop for QueryBinding<T> {
  fn drop(&mut self) {
    self.teardown();
  }
}

fn decode_state<T: DeserializeOwned>(state: QueryState) -> QuerySnapshot<T> {
  let (data, decode_error) = match state.data {
    Some(value) => match serde_json::from_value(value) {
      Ok(typed) => (Some(typed), None),
      Err(err) => (None, Some(QueryError::decode(err))),
    },
    None => (None, None),
  };
  QuerySnapshot {
    data,
    error: decode_error.or(state.error),
    status: state.status,
    is_stale: state.is_stale,
  }
}

/// Mount fetch plus reactive refetch triggers: focus regain while
/// stale, and invalidation of the bound key.
fn spawn_trigger_task(
  store: QueryStore,
  key: QueryKey,
  fetcher: Fetcher,
  options: QueryOptions,
  mut focus: broadcast::Receiver<()>,
  mut changes: broadcast::Receiver<QueryKey>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    if options.refetch_on_mount {
      let state = store.get_query_state(&key);
      if state.data.is_none() || state.is_stale {
        let _ = store.execute_fetch(&key, fetcher.clone(), &options, false).await;
      }
    }

    loop {
      tokio::select! {
        focused = focus.recv() => {
          match focused {
            Ok(()) => {
              if options.refetch_on_window_focus && store.get_query_state(&key).is_stale {
                debug!(key = %key, "refetching on focus regain");
                let _ = store.execute_fetch(&key, fetcher.clone(), &options, false).await;
              }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
          }
        }
        changed = changes.recv() => {
          match changed {
            Ok(changed_key) if changed_key == key => {
              if store.is_invalidated(&key) {
                debug!(key = %key, "refetching invalidated query");
                let _ = store.execute_fetch(&key, fetcher.clone(), &options, false).await;
              }
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
          }
        }
      }
    }
  })
}

/// Fixed-interval background refetch. The first tick fires one full
/// interval after bind, not immediately.
fn spawn_interval_task(
  store: QueryStore,
  key: QueryKey,
  fetcher: Fetcher,
  options: QueryOptions,
  interval: tokio::time::Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
      ticker.tick().await;
      debug!(key = %key, "interval refetch");
      let _ = store.refetch_query(&key, fetcher.clone(), &options).await;
    }
  })
}
