//! The query executor: decides when to fetch, coalesces concurrent
//! callers, retries, and writes outcomes back into the store.
//!
//! One in-flight request per key, ever. The first caller dispatches a
//! driver task and every later caller subscribes to the same outcome
//! broadcast, so N simultaneous readers of one key cost one network
//! call. Each dispatch takes a monotonic per-key sequence number; a
//! superseded fetch that resolves late is discarded instead of
//! overwriting fresher data.
//!
//! The driver runs on its own task, so dropping a caller never cancels
//! the underlying fetch — the outcome still lands in the shared cache
//! for everyone else.

use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::store::{FetchOutcome, InFlight, QueryEntry, QueryStatus, QueryStore};

/// Boxed fetcher over the store's wire representation.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, FetchOutcome> + Send + Sync>;

/// Box a closure returning a future into a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = FetchOutcome> + Send + 'static,
{
  Arc::new(move || Box::pin(f()))
}

impl QueryStore {
  /// Fetch the value for `key`, or serve it from cache.
  ///
  /// Fresh cached data short-circuits without calling the fetcher. A
  /// stale or absent entry dispatches the fetcher with the configured
  /// retry policy; concurrent callers for the same key attach to the
  /// in-flight request instead of issuing their own.
  pub async fn execute_query<F, Fut>(
    &self,
    key: &QueryKey,
    fetch: F,
    options: &QueryOptions,
  ) -> Result<Value, QueryError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
  {
    self.execute_fetch(key, fetcher(fetch), options, false).await
  }

  /// Like [`execute_query`](Self::execute_query) but always dispatches
  /// a new fetch, replacing any in-flight one. Used by manual refetch.
  pub async fn refetch_query(
    &self,
    key: &QueryKey,
    fetch: Fetcher,
    options: &QueryOptions,
  ) -> Result<Value, QueryError> {
    self.execute_fetch(key, fetch, options, true).await
  }

  pub(crate) async fn execute_fetch(
    &self,
    key: &QueryKey,
    fetch: Fetcher,
    options: &QueryOptions,
    force: bool,
  ) -> Result<Value, QueryError> {
    let mut rx = match self.attach_or_dispatch(key, fetch, options, force) {
      Attached::Fresh(value) => return Ok(value),
      Attached::Waiting(rx) => rx,
    };

    match rx.recv().await {
      Ok(outcome) => outcome,
      // The driver went away without an outcome (abandoned retry loop
      // for a dead key, or store shutdown).
      Err(_) => Err(QueryError::Cancelled),
    }
  }

  /// Either return fresh cached data, attach to the in-flight request,
  /// or dispatch a new driver task and attach to that.
  fn attach_or_dispatch(
    &self,
    key: &QueryKey,
    fetch: Fetcher,
    options: &QueryOptions,
    force: bool,
  ) -> Attached {
    let now = Instant::now();
    let (rx, dispatched) = {
      let mut inner = self.lock();
      let entry = inner
        .queries
        .entry(key.clone())
        .or_insert_with(|| QueryEntry::new(options));
      entry.stale_time = entry.stale_time.min(options.stale_time);
      entry.cache_time = entry.cache_time.max(options.cache_time);

      if !force {
        if let Some(data) = &entry.data {
          if !entry.is_stale(now) {
            return Attached::Fresh(data.clone());
          }
        }
        if let Some(in_flight) = &entry.in_flight {
          return Attached::Waiting(in_flight.tx.subscribe());
        }
      }

      entry.next_seq += 1;
      let seq = entry.next_seq;
      // This dispatch is the refetch the invalidation asked for; clear
      // the flag now so a failing fetch cannot retrigger another one.
      entry.invalidated = false;
      // A live fetch also cancels any pending eviction.
      entry.epoch += 1;
      let (tx, rx) = broadcast::channel(4);
      entry.in_flight = Some(InFlight {
        seq,
        tx: tx.clone(),
      });
      entry.status = if entry.data.is_some() {
        QueryStatus::Fetching
      } else {
        QueryStatus::Loading
      };
      (rx, (seq, tx))
    };

    let (seq, tx) = dispatched;
    debug!(key = %key, seq, "dispatching fetch");
    self.notify(key);

    let store = self.clone();
    let key = key.clone();
    let options = options.clone();
    tokio::spawn(async move {
      store.drive_fetch(key, fetch, options, seq, tx).await;
    });

    Attached::Waiting(rx)
  }

  /// Runs one fetch to completion: attempt, retry with linear delay,
  /// then write the outcome back (unless superseded) and broadcast it.
  async fn drive_fetch(
    &self,
    key: QueryKey,
    fetch: Fetcher,
    options: QueryOptions,
    seq: u64,
    tx: broadcast::Sender<FetchOutcome>,
  ) {
    let attempts = options.retry.max(1);
    for attempt in 1..=attempts {
      match fetch().await {
        Ok(value) => {
          self.apply_success(&key, seq, &value, options.on_success.as_ref());
          let _ = tx.send(Ok(value));
          return;
        }
        Err(err) => {
          warn!(key = %key, seq, attempt, error = %err, "fetch attempt failed");
          if attempt == attempts {
            let err = if attempts > 1 {
              QueryError::retries_exhausted(attempts, &err)
            } else {
              err
            };
            self.apply_error(&key, seq, &err, options.on_error.as_ref());
            let _ = tx.send(Err(err));
            return;
          }
          // Nobody left waiting on this key: stop retrying instead of
          // resurrecting state for a dead consumer.
          if !self.fetch_still_wanted(&key, &tx) {
            debug!(key = %key, seq, "abandoning retries, no live subscribers");
            self.abandon_fetch(&key, seq);
            return;
          }
          sleep(options.retry_delay).await;
          if self.fetch_superseded(&key, seq) {
            debug!(key = %key, seq, "retry superseded by newer fetch");
            return;
          }
        }
      }
    }
  }

  fn fetch_still_wanted(&self, key: &QueryKey, tx: &broadcast::Sender<FetchOutcome>) -> bool {
    if tx.receiver_count() > 0 {
      return true;
    }
    let inner = self.lock();
    inner
      .queries
      .get(key)
      .map(|entry| entry.subscribers > 0)
      .unwrap_or(false)
  }

  fn fetch_superseded(&self, key: &QueryKey, seq: u64) -> bool {
    let inner = self.lock();
    match inner.queries.get(key) {
      Some(entry) => entry
        .in_flight
        .as_ref()
        .map(|in_flight| in_flight.seq != seq)
        .unwrap_or(true),
      // Entry evicted while we slept.
      None => true,
    }
  }

  fn apply_success(
    &self,
    key: &QueryKey,
    seq: u64,
    value: &Value,
    on_success: Option<&crate::options::SuccessCallback>,
  ) {
    let (applied, evict) = {
      let mut inner = self.lock();
      match inner.queries.get_mut(key) {
        Some(entry) => {
          if seq <= entry.applied_seq {
            debug!(key = %key, seq, "discarding superseded fetch result");
            entry.release_in_flight(seq);
            (false, None)
          } else {
            entry.applied_seq = seq;
            entry.data = Some(value.clone());
            entry.error = None;
            entry.status = QueryStatus::Success;
            entry.last_fetched_at = Some(Instant::now());
            entry.release_in_flight(seq);
            (true, entry.eviction_due())
          }
        }
        // Evicted mid-fetch; waiters still get the broadcast outcome.
        None => (false, None),
      }
    };
    if let Some((cache_time, epoch)) = evict {
      self.schedule_eviction(key.clone(), cache_time, epoch);
    }
    if applied {
      self.notify(key);
      if let Some(cb) = on_success {
        cb(value);
      }
    }
  }

  fn apply_error(
    &self,
    key: &QueryKey,
    seq: u64,
    err: &QueryError,
    on_error: Option<&crate::options::ErrorCallback>,
  ) {
    let (applied, evict) = {
      let mut inner = self.lock();
      match inner.queries.get_mut(key) {
        Some(entry) => {
          if seq <= entry.applied_seq {
            debug!(key = %key, seq, "discarding superseded fetch error");
            entry.release_in_flight(seq);
            (false, None)
          } else {
            entry.applied_seq = seq;
            // Prior data stays servable; a failed background refetch
            // never destroys what a previous fetch cached.
            entry.error = Some(err.clone());
            entry.status = QueryStatus::Error;
            entry.release_in_flight(seq);
            (true, entry.eviction_due())
          }
        }
        None => (false, None),
      }
    };
    if let Some((cache_time, epoch)) = evict {
      self.schedule_eviction(key.clone(), cache_time, epoch);
    }
    if applied {
      self.notify(key);
      if let Some(cb) = on_error {
        cb(err);
      }
    }
  }

  /// Roll back a dispatch whose retry loop stopped without an outcome.
  fn abandon_fetch(&self, key: &QueryKey, seq: u64) {
    let evict = {
      let mut inner = self.lock();
      match inner.queries.get_mut(key) {
        Some(entry) => {
          entry.release_in_flight(seq);
          if matches!(entry.status, QueryStatus::Loading | QueryStatus::Fetching) {
            entry.status = if entry.data.is_some() {
              QueryStatus::Success
            } else if entry.error.is_some() {
              QueryStatus::Error
            } else {
              QueryStatus::Idle
            };
          }
          entry.eviction_due()
        }
        None => None,
      }
    };
    if let Some((cache_time, epoch)) = evict {
      self.schedule_eviction(key.clone(), cache_time, epoch);
    }
  }
}

enum Attached {
  /// Cache was fresh; no fetch needed.
  Fresh(Value),
  /// Waiting on an in-flight fetch, ours or someone else's.
  Waiting(broadcast::Receiver<FetchOutcome>),
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::time::Duration;

  fn counting_fetcher(
    counter: Arc<AtomicU32>,
    delay: Duration,
    value: Value,
  ) -> impl Fn() -> BoxFuture<'static, FetchOutcome> + Clone + Send + Sync + 'static {
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      let value = value.clone();
      Box::pin(async move {
        sleep(delay).await;
        Ok(value)
      })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_callers_share_one_fetch() {
    crate::init_test_logging();
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();

    let fetch = counting_fetcher(calls.clone(), Duration::from_millis(100), json!(["a", "b"]));
    let (first, second) = tokio::join!(
      store.execute_query(&key, fetch.clone(), &options),
      store.execute_query(&key, fetch.clone(), &options),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap(), json!(["a", "b"]));
    assert_eq!(second.unwrap(), json!(["a", "b"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_refetch_shows_old_data_while_fetching() {
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let options = QueryOptions::default(); // stale_time 0: immediately stale

    store
      .execute_query(&key, || async { Ok(json!("v1")) }, &options)
      .await
      .unwrap();

    let handle = {
      let store = store.clone();
      let key = key.clone();
      let options = options.clone();
      tokio::spawn(async move {
        store
          .execute_query(
            &key,
            || async {
              sleep(Duration::from_millis(100)).await;
              Ok(json!("v2"))
            },
            &options,
          )
          .await
      })
    };
    tokio::task::yield_now().await;

    // Background refresh: previous data stays visible, status is
    // Fetching rather than Loading.
    let state = store.get_query_state(&key);
    assert_eq!(state.status, QueryStatus::Fetching);
    assert!(state.is_fetching());
    assert!(!state.is_loading());
    assert_eq!(state.data, Some(json!("v1")));

    assert_eq!(handle.await.unwrap().unwrap(), json!("v2"));
    assert_eq!(store.get_query_state(&key).data, Some(json!("v2")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_then_success() {
    let store = QueryStore::new();
    let key = QueryKey::new("flaky");
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_retry(3);

    let calls_in_fetch = calls.clone();
    let result = store
      .execute_query(
        &key,
        move || {
          let n = calls_in_fetch.fetch_add(1, Ordering::SeqCst);
          async move {
            if n < 2 {
              Err(QueryError::fetch("transient"))
            } else {
              Ok(json!(7))
            }
          }
        },
        &options,
      )
      .await;

    assert_eq!(result.unwrap(), json!(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let state = store.get_query_state(&key);
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.error.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_exhaustion_preserves_cached_data() {
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let options = QueryOptions::default().with_retry(2);

    store
      .execute_query(&key, || async { Ok(json!("v1")) }, &options)
      .await
      .unwrap();

    let result = store
      .execute_query(
        &key,
        || async { Err(QueryError::fetch("down")) },
        &options,
      )
      .await;

    assert!(matches!(
      result,
      Err(QueryError::RetriesExhausted { attempts: 2, .. })
    ));
    let state = store.get_query_state(&key);
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.error.is_some());
    // The failing refetch must not destroy the previous data.
    assert_eq!(state.data, Some(json!("v1")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_fetch_failure_is_not_wrapped_for_single_attempt() {
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let options = QueryOptions::default().with_retry(1);

    let result = store
      .execute_query(
        &key,
        || async { Err(QueryError::fetch("connection refused")) },
        &options,
      )
      .await;

    assert_eq!(result, Err(QueryError::fetch("connection refused")));
    let state = store.get_query_state(&key);
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.data.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_out_of_order_resolution_discards_superseded_fetch() {
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let options = QueryOptions::default().with_retry(1);

    // Sequence 1: slow.
    let slow = {
      let store = store.clone();
      let key = key.clone();
      let options = options.clone();
      tokio::spawn(async move {
        store
          .execute_query(
            &key,
            || async {
              sleep(Duration::from_millis(300)).await;
              Ok(json!("slow"))
            },
            &options,
          )
          .await
      })
    };
    tokio::task::yield_now().await;

    // Sequence 2: forced refetch that resolves first.
    let fast = store
      .refetch_query(
        &key,
        fetcher(|| async {
          sleep(Duration::from_millis(50)).await;
          Ok(json!("fast"))
        }),
        &options,
      )
      .await;
    assert_eq!(fast.unwrap(), json!("fast"));

    // Sequence 1 still resolves for its own caller...
    assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
    // ...but its late write is discarded: the newer result stands.
    assert_eq!(store.get_query_state(&key).data, Some(json!("fast")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_manual_update_visible_until_fetch_completes() {
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let options = QueryOptions::default().with_retry(1);

    let handle = {
      let store = store.clone();
      let key = key.clone();
      let options = options.clone();
      tokio::spawn(async move {
        store
          .execute_query(
            &key,
            || async {
              sleep(Duration::from_millis(100)).await;
              Ok(json!("fetched"))
            },
            &options,
          )
          .await
      })
    };
    tokio::task::yield_now().await;

    // Optimistic patch lands while the fetch is still in flight.
    store.update_query_data(&key, |_| json!("patched"));
    assert_eq!(store.get_query_state(&key).data, Some(json!("patched")));

    // Fetch completion wins.
    handle.await.unwrap().unwrap();
    assert_eq!(store.get_query_state(&key).data, Some(json!("fetched")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_stop_when_no_caller_remains() {
    let store = QueryStore::new();
    let key = QueryKey::new("doomed");
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default()
      .with_retry(5)
      .with_retry_delay(Duration::from_secs(1));

    let handle = {
      let store = store.clone();
      let key = key.clone();
      let options = options.clone();
      let calls = calls.clone();
      tokio::spawn(async move {
        store
          .execute_query(
            &key,
            move || {
              calls.fetch_add(1, Ordering::SeqCst);
              async { Err(QueryError::fetch("always down")) }
            },
            &options,
          )
          .await
      })
    };
    // Let the first attempt fail and the retry timer start.
    tokio::task::yield_now().await;
    handle.abort();

    // Plenty of time for all five attempts, had they been issued.
    sleep(Duration::from_secs(30)).await;

    // One attempt before the caller died, one after whose failure
    // notices the dead key and abandons the loop.
    assert!(calls.load(Ordering::SeqCst) <= 2);
    let state = store.get_query_state(&key);
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(state.error.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_data_short_circuits() {
    let store = QueryStore::new();
    let key = QueryKey::new("users");
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_stale_time(Duration::from_secs(60));

    let fetch = counting_fetcher(calls.clone(), Duration::ZERO, json!(1));
    store.execute_query(&key, fetch.clone(), &options).await.unwrap();
    store.execute_query(&key, fetch.clone(), &options).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unbound_entry_evicted_after_cache_time() {
    crate::init_test_logging();
    let store = QueryStore::new();
    let key = QueryKey::new("one-shot");
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(60));

    // Direct executor call, no binding ever attaches.
    store
      .execute_query(&key, || async { Ok(json!("v")) }, &options)
      .await
      .unwrap();
    assert_eq!(store.get_query_state(&key).data, Some(json!("v")));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!store.lock().queries.contains_key(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_of_unbound_entry_restarts_eviction_clock() {
    let store = QueryStore::new();
    let key = QueryKey::new("one-shot");
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(60));

    store
      .execute_query(&key, || async { Ok(json!("v1")) }, &options)
      .await
      .unwrap();

    // A refetch before the deadline keeps the entry for another full
    // cache time from its completion.
    tokio::time::sleep(Duration::from_secs(40)).await;
    store
      .refetch_query(&key, fetcher(|| async { Ok(json!("v2")) }), &options)
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(store.get_query_state(&key).data, Some(json!("v2")));

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(!store.lock().queries.contains_key(&key));
  }
}
