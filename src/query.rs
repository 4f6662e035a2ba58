//! Async query abstraction over the cache layer.
//!
//! Inspired by TanStack Query, this module provides a `Query<T>` type that
//! encapsulates cached data fetching, loading states, and error handling for
//! one consumer of one cache key.
//!
//! # Example
//!
//! ```ignore
//! let client = manga_client.clone();
//! let mut query = Query::new(cache.clone(), "@Manga/123", move || {
//!     let client = client.clone();
//!     async move { client.get_manga("123").await }
//! });
//!
//! // Reads the local entry; starts a fetch only if it is stale or missing
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.view() {
//!     QueryView::Loading { stale } => render_spinner_over(stale),
//!     QueryView::Ready(resolved) => render_data(&resolved.data),
//!     QueryView::Failed { error, .. } => render_error(error),
//!     QueryView::NoData => render_empty(),
//! }
//! ```

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{CacheEntry, CacheError, CacheLayer, Cacheable, Resolved};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// A remote fetch is pending
  Loading,
  /// Query produced data, from the cache or the network
  Success(Resolved<T>),
  /// The remote fetch failed
  Error(CacheError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(resolved) => Some(&resolved.data),
      _ => None,
    }
  }
}

/// What a consumer should render for a query right now.
#[derive(Debug)]
pub enum QueryView<'a, T> {
  /// Fetch pending; `stale` is the last persisted value, if any
  Loading { stale: Option<&'a T> },
  /// Data is available
  Ready(&'a Resolved<T>),
  /// Fetch failed; `stale` is still available if the consumer wants it
  Failed {
    error: &'a CacheError,
    stale: Option<&'a T>,
  },
  /// Neither the cache nor a fetch has produced anything
  NoData,
}

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, color_eyre::Result<T>> + Send + Sync>;

type QueryResult<T> = Result<Resolved<T>, CacheError>;

/// Cached query with state management.
///
/// Query<T> encapsulates:
/// - The cache key and the fetching logic (via a closure)
/// - Idle/loading/success/error states
/// - The last persisted value while a refresh is pending
/// - Async result handling via channels
pub struct Query<T> {
  state: QueryState<T>,
  stale: Option<CacheEntry<T>>,
  cache: CacheLayer,
  key: String,
  freshness: Duration,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<QueryResult<T>>>,
}

impl<T: Cacheable> Query<T> {
  /// Create a new query for `key` with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It is only called when
  /// the persisted entry is stale or missing, or on `refetch()`.
  pub fn new<F, Fut>(cache: CacheLayer, key: impl Into<String>, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let freshness = cache.freshness();
    Self {
      state: QueryState::Idle,
      stale: None,
      cache,
      key: key.into(),
      freshness,
      fetcher: Arc::new(move || fetcher().boxed()),
      receiver: None,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// The value to display: fresh data, or the stale value while loading.
  pub fn data(&self) -> Option<&T> {
    match &self.state {
      QueryState::Loading => self.stale(),
      state => state.data(),
    }
  }

  /// The last persisted value, kept while a refresh is pending or after it failed.
  pub fn stale(&self) -> Option<&T> {
    self.stale.as_ref().map(|entry| &entry.data)
  }

  /// Check if the query is currently loading.
  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn view(&self) -> QueryView<'_, T> {
    match &self.state {
      QueryState::Loading => QueryView::Loading {
        stale: self.stale(),
      },
      QueryState::Success(resolved) => QueryView::Ready(resolved),
      QueryState::Error(error) => QueryView::Failed {
        error,
        stale: self.stale(),
      },
      QueryState::Idle => QueryView::NoData,
    }
  }

  /// Resolve the query against the cache.
  ///
  /// A fresh persisted entry is served immediately without loading. Otherwise
  /// the entry (if any) is kept as the stale value and a fetch is started.
  /// This is a no-op if the query is already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }

    match self.cache.lookup::<T, _>(self.key.as_str()) {
      Some(entry) if self.cache.is_fresh(&entry, self.freshness) => {
        self.stale = None;
        self.state = QueryState::Success(Resolved::from_cache(entry));
      }
      entry => {
        self.stale = entry.or_else(|| self.current_entry());
        self.start_fetch(false);
      }
    }
  }

  /// Force a network refetch, even if already loading or data is fresh.
  pub fn refetch(&mut self) {
    // Drop any pending result by dropping the receiver; the cache write
    // of that fetch still happens.
    self.receiver = None;
    let entry = self
      .current_entry()
      .or_else(|| self.stale.take())
      .or_else(|| self.cache.lookup::<T, _>(self.key.as_str()));
    self.stale = entry;
    self.start_fetch(true);
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    // Try to receive without blocking
    match receiver.try_recv() {
      Ok(result) => {
        self.apply(result);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.cancelled();
        true
      }
    }
  }

  /// Wait for the pending fetch, if any, and apply its result.
  ///
  /// Returns `true` if the state changed.
  pub async fn settle(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.recv().await {
      Some(result) => self.apply(result),
      None => self.cancelled(),
    }
    true
  }

  fn apply(&mut self, result: QueryResult<T>) {
    self.receiver = None;
    match result {
      Ok(resolved) => {
        self.stale = None;
        self.state = QueryState::Success(resolved);
      }
      Err(error) => self.state = QueryState::Error(error),
    }
  }

  fn cancelled(&mut self) {
    // Sender dropped without sending - treat as error
    self.receiver = None;
    self.state = QueryState::Error(CacheError::RemoteFetch {
      key: self.key.clone(),
      message: "query was cancelled".to_string(),
    });
  }

  /// Current success data as an entry, for use as the stale value.
  fn current_entry(&self) -> Option<CacheEntry<T>> {
    match &self.state {
      QueryState::Success(resolved) => {
        Some(CacheEntry::new(resolved.data.clone(), resolved.stored_at))
      }
      _ => None,
    }
  }

  fn start_fetch(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let cache = self.cache.clone();
    let key = self.key.clone();
    let freshness = self.freshness;
    let fetcher = Arc::clone(&self.fetcher);

    tokio::spawn(async move {
      let result = if force {
        cache.refresh(&key, move || fetcher()).await
      } else {
        cache.resolve_within(&key, freshness, move || fetcher()).await
      };
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("stale", &self.stale)
      .field("freshness", &self.freshness)
      .finish_non_exhaustive()
  }
}
