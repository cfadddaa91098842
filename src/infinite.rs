//! Cursor-paginated queries built on the same store and executor.
//!
//! Each page is cached under its own derived key (`key:cursor`), so
//! pages dedupe, retry and evict exactly like plain queries. The
//! handle tracks which pages have been fetched and accumulates them,
//! newest last; the next cursor is extracted from the most recent
//! page by a caller-supplied closure.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::error::QueryError;
use crate::executor::Fetcher;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::store::{FetchOutcome, QueryState, QueryStore};

type PageFetcher = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, FetchOutcome> + Send + Sync>;
type PageParam<T> = Arc<dyn Fn(&T) -> Option<Value> + Send + Sync>;

/// A paginated binding over one logical list.
pub struct InfiniteQuery<T> {
  store: QueryStore,
  key: QueryKey,
  fetcher: PageFetcher,
  options: QueryOptions,
  next_page_param: Option<PageParam<T>>,
  prev_page_param: Option<PageParam<T>>,
  /// Page keys in display order, oldest first.
  pages: Mutex<Vec<QueryKey>>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> InfiniteQuery<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// The fetcher receives the page cursor, `None` for the first page.
  pub fn new<F, Fut>(
    store: &QueryStore,
    key: impl Into<QueryKey>,
    fetch: F,
    options: QueryOptions,
  ) -> Self
  where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    let fetcher: PageFetcher = Arc::new(move |param| {
      let fut = fetch(param);
      Box::pin(async move {
        fut
          .await
          .and_then(|page| serde_json::to_value(page).map_err(QueryError::decode))
      })
    });
    Self {
      store: store.clone(),
      key: key.into(),
      fetcher,
      options,
      next_page_param: None,
      prev_page_param: None,
      pages: Mutex::new(Vec::new()),
      _marker: PhantomData,
    }
  }

  /// Extract the next cursor from a fetched page. Without this the
  /// query never reports a next page.
  pub fn with_next_page_param(mut self, cb: impl Fn(&T) -> Option<Value> + Send + Sync + 'static) -> Self {
    self.next_page_param = Some(Arc::new(cb));
    self
  }

  /// Extract the previous cursor from a fetched page.
  pub fn with_previous_page_param(
    mut self,
    cb: impl Fn(&T) -> Option<Value> + Send + Sync + 'static,
  ) -> Self {
    self.prev_page_param = Some(Arc::new(cb));
    self
  }

  /// Fetch the first page (served from cache when fresh).
  pub async fn fetch_first_page(&self) -> Result<T, QueryError> {
    self.fetch_page(None, Position::Back).await
  }

  /// Fetch the page after the newest one. Returns `Ok(None)` when the
  /// newest page has no next cursor, or nothing was fetched yet.
  pub async fn fetch_next_page(&self) -> Result<Option<T>, QueryError> {
    let Some(param) = self.page_param_from_edge(&self.next_page_param, Position::Back) else {
      return Ok(None);
    };
    self.fetch_page(Some(param), Position::Back).await.map(Some)
  }

  /// Fetch the page before the oldest one. Returns `Ok(None)` when
  /// there is no previous cursor.
  pub async fn fetch_previous_page(&self) -> Result<Option<T>, QueryError> {
    let Some(param) = self.page_param_from_edge(&self.prev_page_param, Position::Front) else {
      return Ok(None);
    };
    self.fetch_page(Some(param), Position::Front).await.map(Some)
  }

  /// Every fetched page in display order, skipping pages whose cache
  /// entries have been evicted.
  pub fn pages(&self) -> Vec<T> {
    let keys = self.pages.lock().unwrap_or_else(|p| p.into_inner()).clone();
    keys
      .iter()
      .filter_map(|key| self.store.get_query_state(key).data)
      .filter_map(|value| serde_json::from_value(value).ok())
      .collect()
  }

  pub fn has_next_page(&self) -> bool {
    self
      .page_param_from_edge(&self.next_page_param, Position::Back)
      .is_some()
  }

  pub fn has_previous_page(&self) -> bool {
    self
      .page_param_from_edge(&self.prev_page_param, Position::Front)
      .is_some()
  }

  /// State of the most recently tracked page, idle when none.
  pub fn last_page_state(&self) -> QueryState {
    let keys = self.pages.lock().unwrap_or_else(|p| p.into_inner());
    match keys.last() {
      Some(key) => self.store.get_query_state(key),
      None => self.store.get_query_state(&self.key),
    }
  }

  async fn fetch_page(&self, param: Option<Value>, position: Position) -> Result<T, QueryError> {
    let page_key = match &param {
      Some(param) => self.key.child(page_segment(param)),
      None => self.key.clone(),
    };

    let fetcher = self.fetcher.clone();
    let page_fetcher: Fetcher = Arc::new(move || fetcher(param.clone()));
    let value = self
      .store
      .execute_fetch(&page_key, page_fetcher, &self.options, false)
      .await?;

    self.track_page(page_key, position);
    serde_json::from_value(value).map_err(QueryError::decode)
  }

  /// Record the page key and take a subscription on it, so fetched
  /// pages are not evicted from under the handle.
  fn track_page(&self, page_key: QueryKey, position: Position) {
    let mut pages = self.pages.lock().unwrap_or_else(|p| p.into_inner());
    if pages.contains(&page_key) {
      return;
    }
    self.store.bind(&page_key, &self.options);
    match position {
      Position::Back => pages.push(page_key),
      Position::Front => pages.insert(0, page_key),
    }
  }

  fn page_param_from_edge(
    &self,
    extractor: &Option<PageParam<T>>,
    position: Position,
  ) -> Option<Value> {
    let extractor = extractor.as_ref()?;
    let pages = self.pages.lock().unwrap_or_else(|p| p.into_inner());
    let edge = match position {
      Position::Back => pages.last()?,
      Position::Front => pages.first()?,
    };
    let value = self.store.get_query_state(edge).data?;
    let page: T = serde_json::from_value(value).ok()?;
    extractor(&page)
  }
}

impl<T> Drop for InfiniteQuery<T> {
  fn drop(&mut self) {
    let pages = self.pages.lock().unwrap_or_else(|p| p.into_inner());
    for key in pages.iter() {
      self.store.unbind(key);
    }
  }
}

#[derive(Clone, Copy)]
enum Position {
  Front,
  Back,
}

/// Render a cursor value as a key segment; strings drop their quotes
/// so keys stay readable.
fn page_segment(param: &Value) -> String {
  match param {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::time::Duration;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Page {
    items: Vec<u32>,
    next_cursor: Option<u32>,
  }

  fn paged_fetch(
    calls: Arc<AtomicU32>,
  ) -> impl Fn(Option<Value>) -> futures::future::BoxFuture<'static, Result<Page, QueryError>>
       + Send
       + Sync
       + 'static {
    move |param| {
      calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move {
        let start = param.and_then(|p| p.as_u64()).unwrap_or(0) as u32;
        Ok(Page {
          items: vec![start, start + 1],
          next_cursor: if start >= 4 { None } else { Some(start + 2) },
        })
      })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_pages_accumulate_in_order() {
    let store = QueryStore::new();
    let calls = Arc::new(AtomicU32::new(0));

    let query = InfiniteQuery::new(&store, "feed", paged_fetch(calls.clone()), QueryOptions::default())
      .with_next_page_param(|page: &Page| page.next_cursor.map(|c| json!(c)));

    query.fetch_first_page().await.unwrap();
    assert!(query.has_next_page());

    query.fetch_next_page().await.unwrap().unwrap();
    query.fetch_next_page().await.unwrap().unwrap();

    let items: Vec<u32> = query.pages().into_iter().flat_map(|p| p.items).collect();
    assert_eq!(items, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The last page has no cursor: the chain ends.
    assert!(!query.has_next_page());
    assert!(query.fetch_next_page().await.unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_next_page_before_first_is_none() {
    let store = QueryStore::new();
    let calls = Arc::new(AtomicU32::new(0));
    let query = InfiniteQuery::new(&store, "feed", paged_fetch(calls.clone()), QueryOptions::default())
      .with_next_page_param(|page: &Page| page.next_cursor.map(|c| json!(c)));

    assert!(query.fetch_next_page().await.unwrap().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_pages_are_cached_individually() {
    let store = QueryStore::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_stale_time(Duration::from_secs(3600));

    let query = InfiniteQuery::new(&store, "feed", paged_fetch(calls.clone()), options)
      .with_next_page_param(|page: &Page| page.next_cursor.map(|c| json!(c)));

    query.fetch_first_page().await.unwrap();
    query.fetch_next_page().await.unwrap().unwrap();
    // Refetching the first page hits the fresh cache.
    query.fetch_first_page().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropping_handle_releases_pages() {
    let store = QueryStore::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_cache_time(Duration::from_secs(60));

    let query = InfiniteQuery::new(&store, "feed", paged_fetch(calls.clone()), options)
      .with_next_page_param(|page: &Page| page.next_cursor.map(|c| json!(c)));
    query.fetch_first_page().await.unwrap();
    drop(query);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(store.get_query_state(&QueryKey::new("feed")).data.is_none());
  }
}
