//! Mutation execution: one-shot writes with their own loading/error
//! state and cache invalidation on completion.
//!
//! Mutations are commands, not idempotent reads, so they are never
//! coalesced — concurrent calls with the same key each run their own
//! mutator. Results are handed to the caller and not cached; only
//! `status` and `error` live in the store.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::options::MutationOptions;
use crate::store::{FetchOutcome, MutationEntry, MutationState, MutationStatus, QueryStore};

impl QueryStore {
  /// Run a mutation to completion.
  ///
  /// Sets the mutation entry to `Loading`, applies the optimistic
  /// update if configured, then runs the mutator with the retry
  /// policy. On success the entry flips to `Success`, `on_success`
  /// fires, every key in `invalidate_queries` is forced stale, then
  /// `on_settled` fires. On failure the error is stored, `on_error`
  /// then `on_settled` fire, and the error is returned so callers can
  /// use direct control flow as well as reactive state.
  pub async fn execute_mutation<F, Fut>(
    &self,
    key: &QueryKey,
    mutator: F,
    options: &MutationOptions,
  ) -> Result<Value, QueryError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = FetchOutcome>,
  {
    self.set_mutation_state(key, MutationStatus::Loading, None);

    if let Some(optimistic) = &options.optimistic_update {
      optimistic(self);
    }

    let attempts = options.retry.max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      match mutator().await {
        Ok(result) => {
          debug!(key = %key, attempt, "mutation succeeded");
          self.set_mutation_state(key, MutationStatus::Success, None);
          if let Some(cb) = &options.on_success {
            cb(&result);
          }
          // Invalidation is a pure local state operation; retries
          // never apply to it and it cannot fail.
          self.invalidate_queries(options.invalidate_queries.iter().cloned());
          if let Some(cb) = &options.on_settled {
            cb(Some(&result), None);
          }
          return Ok(result);
        }
        Err(err) => {
          warn!(key = %key, attempt, error = %err, "mutation attempt failed");
          if attempt >= attempts {
            let err = if attempts > 1 {
              QueryError::retries_exhausted(attempts, &err)
            } else {
              err
            };
            self.set_mutation_state(key, MutationStatus::Error, Some(err.clone()));
            if let Some(cb) = &options.on_error {
              cb(&err);
            }
            if let Some(cb) = &options.on_settled {
              cb(None, Some(&err));
            }
            return Err(err);
          }
          sleep(options.retry_delay).await;
        }
      }
    }
  }

  fn set_mutation_state(&self, key: &QueryKey, status: MutationStatus, error: Option<QueryError>) {
    {
      let mut inner = self.lock();
      let entry = inner
        .mutations
        .entry(key.clone())
        .or_insert_with(|| MutationEntry {
          status: MutationStatus::Idle,
          error: None,
        });
      entry.status = status;
      entry.error = error;
    }
    self.notify(key);
  }
}

type Mutator<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<R, QueryError>> + Send + Sync>;
type TypedSuccess<V, R> = Arc<dyn Fn(&R, &V) + Send + Sync>;
type TypedError<V> = Arc<dyn Fn(&QueryError, &V) + Send + Sync>;

/// Typed consumer handle for a mutation.
///
/// Wraps a mutator taking variables of type `V` and resolving to `R`.
/// Calls go through the store's mutation executor; typed callbacks
/// receive both the outcome and the variables of the call that
/// produced it.
pub struct Mutation<V, R> {
  store: QueryStore,
  key: QueryKey,
  mutator: Mutator<V, R>,
  options: MutationOptions,
  on_success: Option<TypedSuccess<V, R>>,
  on_error: Option<TypedError<V>>,
}

impl<V, R> Mutation<V, R>
where
  V: Clone + Send + Sync + 'static,
  R: Serialize + DeserializeOwned + Send + 'static,
{
  pub fn new<F, Fut>(store: &QueryStore, key: impl Into<QueryKey>, mutator: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
  {
    Self {
      store: store.clone(),
      key: key.into(),
      mutator: Arc::new(move |vars| Box::pin(mutator(vars))),
      options: MutationOptions::default(),
      on_success: None,
      on_error: None,
    }
  }

  pub fn with_options(mut self, options: MutationOptions) -> Self {
    self.options = options;
    self
  }

  /// Typed success callback, invoked with the result and the
  /// variables of the triggering call.
  pub fn on_success(mut self, cb: impl Fn(&R, &V) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(cb));
    self
  }

  /// Typed error callback, invoked with the terminal error and the
  /// variables of the triggering call.
  pub fn on_error(mut self, cb: impl Fn(&QueryError, &V) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(cb));
    self
  }

  /// Run the mutation with the configured options.
  pub async fn mutate(&self, variables: V) -> Result<R, QueryError> {
    self.mutate_with(variables, self.options.clone()).await
  }

  /// `mutate` under its awaitable name, for symmetry with the query
  /// surface. Identical behavior.
  pub async fn mutate_async(&self, variables: V) -> Result<R, QueryError> {
    self.mutate(variables).await
  }

  /// Run the mutation with per-call option overrides.
  pub async fn mutate_with(
    &self,
    variables: V,
    mut options: MutationOptions,
  ) -> Result<R, QueryError> {
    // Bind this call's variables into the executor-level callbacks.
    if let Some(cb) = &self.on_success {
      let cb = cb.clone();
      let vars = variables.clone();
      options.on_success = Some(Arc::new(move |value: &Value| {
        if let Ok(result) = serde_json::from_value::<R>(value.clone()) {
          cb(&result, &vars);
        }
      }));
    }
    if let Some(cb) = &self.on_error {
      let cb = cb.clone();
      let vars = variables.clone();
      options.on_error = Some(Arc::new(move |err: &QueryError| {
        cb(err, &vars);
      }));
    }

    let mutator = self.mutator.clone();
    let result = self
      .store
      .execute_mutation(
        &self.key,
        move || {
          let fut = mutator(variables.clone());
          async move {
            fut
              .await
              .and_then(|r| serde_json::to_value(r).map_err(QueryError::decode))
          }
        },
        &options,
      )
      .await?;
    serde_json::from_value(result).map_err(QueryError::decode)
  }

  /// Reactive state of this mutation key.
  pub fn state(&self) -> MutationState {
    self.store.get_mutation_state(&self.key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::options::QueryOptions;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;
  use tokio::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_mutation_invalidates_queries_immediately() {
    let store = QueryStore::new();
    let users = QueryKey::new("users");
    let query_options = QueryOptions::default().with_stale_time(Duration::from_secs(3600));

    store
      .execute_query(&users, || async { Ok(json!(["a"])) }, &query_options)
      .await
      .unwrap();
    assert!(!store.get_query_state(&users).is_stale);

    let options = MutationOptions::default().invalidates(["users"]);
    store
      .execute_mutation(
        &QueryKey::new("add-user"),
        || async { Ok(json!({"ok": true})) },
        &options,
      )
      .await
      .unwrap();

    // Stale immediately, even though stale_time has not elapsed.
    assert!(store.get_query_state(&users).is_stale);
  }

  #[tokio::test]
  async fn test_mutation_error_is_stored_and_reraised() {
    let store = QueryStore::new();
    let key = QueryKey::new("save");
    let settled = Arc::new(AtomicU32::new(0));

    let settled_cb = settled.clone();
    let options = MutationOptions::default().on_settled(move |result, error| {
      assert!(result.is_none());
      assert!(error.is_some());
      settled_cb.fetch_add(1, Ordering::SeqCst);
    });

    let result = store
      .execute_mutation(
        &key,
        || async { Err(QueryError::mutation("409 conflict")) },
        &options,
      )
      .await;

    assert_eq!(result, Err(QueryError::mutation("409 conflict")));
    let state = store.get_mutation_state(&key);
    assert_eq!(state.status, MutationStatus::Error);
    assert_eq!(state.error, Some(QueryError::mutation("409 conflict")));
    assert_eq!(settled.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_retry_then_success() {
    let store = QueryStore::new();
    let key = QueryKey::new("save");
    let calls = Arc::new(AtomicU32::new(0));
    let options = MutationOptions::default().with_retry(2);

    let calls_in_mutator = calls.clone();
    let result = store
      .execute_mutation(
        &key,
        move || {
          let n = calls_in_mutator.fetch_add(1, Ordering::SeqCst);
          async move {
            if n == 0 {
              Err(QueryError::mutation("deadlock, retry"))
            } else {
              Ok(json!(1))
            }
          }
        },
        &options,
      )
      .await;

    assert_eq!(result.unwrap(), json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
      store.get_mutation_state(&key).status,
      MutationStatus::Success
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_mutations_are_not_coalesced() {
    let store = QueryStore::new();
    let key = QueryKey::new("save");
    let calls = Arc::new(AtomicU32::new(0));
    let options = MutationOptions::default();

    let mutator = {
      let calls = calls.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
          sleep(Duration::from_millis(50)).await;
          Ok(json!("done"))
        }
      }
    };

    let (a, b) = tokio::join!(
      store.execute_mutation(&key, mutator.clone(), &options),
      store.execute_mutation(&key, mutator.clone(), &options),
    );
    a.unwrap();
    b.unwrap();

    // Commands, not reads: both calls ran their own mutator.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_optimistic_update_runs_before_mutator() {
    let store = QueryStore::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let optimistic_order = order.clone();
    let options = MutationOptions::default().with_optimistic_update(move |_store| {
      optimistic_order.lock().unwrap().push("optimistic");
    });

    let mutator_order = order.clone();
    store
      .execute_mutation(
        &QueryKey::new("save"),
        move || {
          mutator_order.lock().unwrap().push("mutator");
          async { Ok(json!(null)) }
        },
        &options,
      )
      .await
      .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["optimistic", "mutator"]);
  }

  #[tokio::test]
  async fn test_typed_mutation_handle() {
    let store = QueryStore::new();
    let seen = Arc::new(Mutex::new(None));

    let seen_cb = seen.clone();
    let mutation: Mutation<u32, String> =
      Mutation::new(&store, "rename", |id: u32| async move {
        Ok(format!("user-{id}"))
      })
      .on_success(move |result: &String, vars: &u32| {
        *seen_cb.lock().unwrap() = Some((result.clone(), *vars));
      });

    let result = mutation.mutate(7).await.unwrap();
    assert_eq!(result, "user-7");
    assert_eq!(*seen.lock().unwrap(), Some(("user-7".to_string(), 7)));
    assert_eq!(mutation.state().status, MutationStatus::Success);
  }
}
