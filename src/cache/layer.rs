//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::storage::KeyValueStore;
use super::traits::{CacheEntry, CacheKey, Cacheable, Clock, Resolved, SystemClock};

/// How long a persisted entry is trusted without re-fetching.
pub const DEFAULT_FRESHNESS_HOURS: i64 = 6;

/// Value stored for marker keys (e.g. "chapter read").
const MARKER_VALUE: &str = "true";

type FetchOutcome = Result<(serde_json::Value, DateTime<Utc>), CacheError>;
type InFlight = Shared<BoxFuture<'static, FetchOutcome>>;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network client. For each
/// request it either serves a persisted entry that is still inside the
/// freshness window or runs the remote fetch, persisting the result on
/// success. Concurrent requests for the same key share one remote fetch.
pub struct CacheLayer {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  /// How long before persisted data is considered stale
  freshness: Duration,
  in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(store: impl KeyValueStore + 'static) -> Self {
    Self::new_shared(Arc::new(store))
  }

  /// Create a cache layer over a store that is already shared.
  pub fn new_shared(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
      freshness: Duration::hours(DEFAULT_FRESHNESS_HOURS),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Set the default freshness window.
  pub fn with_freshness(mut self, freshness: Duration) -> Self {
    self.freshness = freshness;
    self
  }

  /// Replace the wall clock used for staleness decisions.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn freshness(&self) -> Duration {
    self.freshness
  }

  /// Whether `entry` is still inside `window`.
  ///
  /// An entry exactly `window` old is stale. Entries stamped in the future
  /// (clock skew) count as fresh.
  pub fn is_fresh<T>(&self, entry: &CacheEntry<T>, window: Duration) -> bool {
    self.clock.now() - entry.stored_at < window
  }

  /// Read the persisted entry for `key`, if there is a usable one.
  ///
  /// Storage faults and undecodable values are logged and reported as a miss.
  pub fn lookup<T, K>(&self, key: &K) -> Option<CacheEntry<T>>
  where
    T: Cacheable,
    K: CacheKey + ?Sized,
  {
    let storage_key = key.storage_key();
    if storage_key.is_empty() {
      return None;
    }

    let raw = match self.store.get(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        let err = CacheError::StorageRead {
          key: storage_key,
          message: format!("{:#}", e),
        };
        warn!(error = %err, "treating unreadable entry as a cache miss");
        return None;
      }
    };

    match serde_json::from_str::<CacheEntry<T>>(&raw) {
      Ok(entry) => Some(entry),
      Err(e) => {
        let err = CacheError::StorageRead {
          key: storage_key,
          message: e.to_string(),
        };
        warn!(error = %err, "treating corrupt entry as a cache miss");
        None
      }
    }
  }

  /// Resolve `key` using the default freshness window.
  pub async fn resolve<T, K, F, Fut>(&self, key: &K, fetcher: F) -> Result<Resolved<T>, CacheError>
  where
    T: Cacheable,
    K: CacheKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    self.resolve_within(key, self.freshness, fetcher).await
  }

  /// Resolve `key` with a cache-first strategy.
  ///
  /// 1. Read the persisted entry - if fresh, return it without fetching
  /// 2. If stale or missing, run (or join) the remote fetch
  /// 3. On success the new entry is persisted and returned
  /// 4. On failure the existing entry is left alone and the error returned
  pub async fn resolve_within<T, K, F, Fut>(
    &self,
    key: &K,
    window: Duration,
    fetcher: F,
  ) -> Result<Resolved<T>, CacheError>
  where
    T: Cacheable,
    K: CacheKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let storage_key = validated(key)?;

    match self.lookup::<T, _>(storage_key.as_str()) {
      Some(entry) if self.is_fresh(&entry, window) => {
        debug!(key = %storage_key, stored_at = %entry.stored_at, "cache hit");
        return Ok(Resolved::from_cache(entry));
      }
      Some(entry) => {
        debug!(key = %storage_key, stored_at = %entry.stored_at, "cache entry stale");
      }
      None => debug!(key = %storage_key, "cache miss"),
    }

    let fetch = self.join_or_start(storage_key.clone(), fetcher);
    decode(storage_key, fetch.await?)
  }

  /// Fetch `key` from the network regardless of what is persisted.
  pub async fn refresh<T, K, F, Fut>(&self, key: &K, fetcher: F) -> Result<Resolved<T>, CacheError>
  where
    T: Cacheable,
    K: CacheKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let storage_key = validated(key)?;
    let fetch = self.join_or_start(storage_key.clone(), fetcher);
    decode(storage_key, fetch.await?)
  }

  /// Delete every persisted entry, markers included.
  pub fn invalidate_all(&self) -> color_eyre::Result<()> {
    self.store.clear_all()?;
    info!("cache cleared");
    Ok(())
  }

  /// Store a plain flag under `key`. Failures are logged, not surfaced.
  pub fn put_marker<K: CacheKey + ?Sized>(&self, key: &K) {
    let storage_key = key.storage_key();
    if storage_key.is_empty() {
      return;
    }
    if let Err(e) = self.store.set(&storage_key, MARKER_VALUE) {
      let err = CacheError::StorageWrite {
        key: storage_key,
        message: format!("{:#}", e),
      };
      warn!(error = %err, "failed to store marker");
    }
  }

  /// Whether a flag was stored under `key`.
  pub fn has_marker<K: CacheKey + ?Sized>(&self, key: &K) -> bool {
    let storage_key = key.storage_key();
    match self.store.get(&storage_key) {
      Ok(value) => value.as_deref() == Some(MARKER_VALUE),
      Err(e) => {
        let message = format!("{:#}", e);
        warn!(key = %storage_key, error = %message, "failed to read marker");
        false
      }
    }
  }

  /// Join the in-flight fetch for `storage_key`, or start one.
  ///
  /// The slot is reserved under the registry lock, and `fetcher` runs only
  /// after that lock is released. The fetch and its store write run in a
  /// spawned task, so they complete even when every waiter has gone away.
  fn join_or_start<T, F, Fut>(&self, storage_key: String, fetcher: F) -> InFlight
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel::<FetchOutcome>();
    let shared = {
      let mut in_flight = lock(&*self.in_flight);
      if let Some(existing) = in_flight.get(&storage_key) {
        debug!(key = %storage_key, "joining in-flight fetch");
        return existing.clone();
      }

      let waiter_key = storage_key.clone();
      let shared = async move {
        rx.await.unwrap_or_else(|_| {
          Err(CacheError::RemoteFetch {
            key: waiter_key,
            message: "fetch task was dropped".to_string(),
          })
        })
      }
      .boxed()
      .shared();
      in_flight.insert(storage_key.clone(), shared.clone());
      shared
    };

    info!(key = %storage_key, "fetching from remote");
    let store = Arc::clone(&self.store);
    let clock = Arc::clone(&self.clock);
    let registry = Arc::clone(&self.in_flight);
    let key = storage_key;

    let fetch = match std::panic::catch_unwind(AssertUnwindSafe(fetcher)) {
      Ok(fetch) => AssertUnwindSafe(fetch).catch_unwind(),
      Err(_) => {
        lock(&*registry).remove(&key);
        let _ = tx.send(Err(panicked(&key)));
        return shared;
      }
    };

    tokio::spawn(async move {
      let outcome = match fetch.await {
        Ok(Ok(data)) => persist(&*store, &*clock, &key, &data),
        Ok(Err(e)) => {
          let err = CacheError::RemoteFetch {
            key: key.clone(),
            message: format!("{:#}", e),
          };
          warn!(error = %err, "remote fetch failed");
          Err(err)
        }
        Err(_) => Err(panicked(&key)),
      };
      lock(&*registry).remove(&key);
      // Every waiter may be gone already
      let _ = tx.send(outcome);
    });

    shared
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
      freshness: self.freshness,
      in_flight: Arc::clone(&self.in_flight),
    }
  }
}

fn validated<K: CacheKey + ?Sized>(key: &K) -> Result<String, CacheError> {
  let storage_key = key.storage_key();
  if storage_key.is_empty() {
    return Err(CacheError::InvalidKey);
  }
  Ok(storage_key)
}

fn panicked(key: &str) -> CacheError {
  CacheError::RemoteFetch {
    key: key.to_string(),
    message: "fetch panicked".to_string(),
  }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
  mutex
    .lock()
    .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write a fresh entry for `key`. A failed write is logged and the fetched
/// value is still handed back.
fn persist<T: Cacheable>(
  store: &dyn KeyValueStore,
  clock: &dyn Clock,
  key: &str,
  data: &T,
) -> FetchOutcome {
  let value = serde_json::to_value(data).map_err(|e| CacheError::Decode {
    key: key.to_string(),
    message: e.to_string(),
  })?;

  let stored_at = clock.now();
  let written = serde_json::to_string(&CacheEntry::new(&value, stored_at))
    .map_err(|e| e.to_string())
    .and_then(|raw| store.set(key, &raw).map_err(|e| format!("{:#}", e)));

  match written {
    Ok(()) => debug!(key, %stored_at, "cache entry written"),
    Err(message) => {
      let err = CacheError::StorageWrite {
        key: key.to_string(),
        message,
      };
      warn!(error = %err, "serving fetched value without caching it");
    }
  }

  Ok((value, stored_at))
}

fn decode<T: Cacheable>(
  key: String,
  (value, stored_at): (serde_json::Value, DateTime<Utc>),
) -> Result<Resolved<T>, CacheError> {
  let data = serde_json::from_value(value).map_err(|e| CacheError::Decode {
    key,
    message: e.to_string(),
  })?;
  Ok(Resolved::from_network(data, stored_at))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStore;
  use crate::cache::traits::{CacheSource, ManualClock};
  use chrono::TimeZone;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
  }

  fn layer_with_clock() -> (CacheLayer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(start()));
    let layer = CacheLayer::new(SqliteStore::open_in_memory().unwrap()).with_clock(clock.clone());
    (layer, clock)
  }

  /// Fetcher that counts invocations and yields `value`.
  fn counting(
    calls: &Arc<AtomicUsize>,
    value: i32,
  ) -> impl FnOnce() -> BoxFuture<'static, color_eyre::Result<i32>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { Ok(value) }.boxed()
    }
  }

  fn failing(calls: &Arc<AtomicUsize>) -> impl FnOnce() -> BoxFuture<'static, color_eyre::Result<i32>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { Err(eyre!("HTTP 429 Too Many Requests")) }.boxed()
    }
  }

  #[tokio::test]
  async fn test_miss_fetches_and_persists() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer.resolve("@Manga/1", counting(&calls, 7)).await.unwrap();

    assert_eq!(result.data, 7);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.stored_at, start());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let entry: CacheEntry<i32> = layer.lookup("@Manga/1").unwrap();
    assert_eq!(entry, CacheEntry::new(7, start()));
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_fetch() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("@Manga/1", counting(&calls, 7)).await.unwrap();

    clock.advance(Duration::hours(5));
    let result = layer.resolve("@Manga/1", counting(&calls, 8)).await.unwrap();

    assert_eq!(result.data, 7);
    assert!(result.is_from_cache());
    assert_eq!(result.stored_at, start());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_entry_is_refetched_and_restamped() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("@Manga/1", counting(&calls, 7)).await.unwrap();

    clock.advance(Duration::hours(5));
    layer.resolve("@Manga/1", counting(&calls, 8)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::hours(2));
    let result = layer.resolve("@Manga/1", counting(&calls, 8)).await.unwrap();

    assert_eq!(result.data, 8);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let entry: CacheEntry<i32> = layer.lookup("@Manga/1").unwrap();
    assert_eq!(entry.stored_at, start() + Duration::hours(7));
    assert_eq!(entry.data, 8);
  }

  #[tokio::test]
  async fn test_entry_exactly_window_old_is_stale() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("k", counting(&calls, 1)).await.unwrap();

    clock.advance(Duration::hours(DEFAULT_FRESHNESS_HOURS) - Duration::milliseconds(1));
    layer.resolve("k", counting(&calls, 2)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::milliseconds(1));
    let result = layer.resolve("k", counting(&calls, 2)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.data, 2);
  }

  #[tokio::test]
  async fn test_explicit_window_overrides_default() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("k", counting(&calls, 1)).await.unwrap();

    clock.advance(Duration::minutes(30));
    let result = layer
      .resolve_within("k", Duration::minutes(10), counting(&calls, 2))
      .await
      .unwrap();

    assert_eq!(result.data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_immediate_repeat_is_idempotent() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = layer.resolve("@Latest", counting(&calls, 3)).await.unwrap();
    let second = layer.resolve("@Latest", counting(&calls, 4)).await.unwrap();

    assert_eq!(first.data, second.data);
    assert_eq!(first.stored_at, second.stored_at);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_fetch_keeps_existing_entry() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("@Manga/1", counting(&calls, 7)).await.unwrap();

    clock.advance(Duration::hours(7));
    let err = layer.resolve("@Manga/1", failing(&calls)).await.unwrap_err();

    assert!(err.is_remote());
    assert!(err.to_string().contains("429"));
    let entry: CacheEntry<i32> = layer.lookup("@Manga/1").unwrap();
    assert_eq!(entry, CacheEntry::new(7, start()));
  }

  #[tokio::test]
  async fn test_failed_fetch_on_miss_writes_nothing() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    assert!(layer.resolve("@Manga/1", failing(&calls)).await.is_err());
    assert!(layer.lookup::<i32, _>("@Manga/1").is_none());

    // The failure is not remembered; the next call tries again.
    let result = layer.resolve("@Manga/1", counting(&calls, 1)).await.unwrap();
    assert_eq!(result.data, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_concurrent_resolves_share_one_fetch() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let slow = |calls: &Arc<AtomicUsize>| {
      let calls = Arc::clone(calls);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          tokio::time::sleep(std::time::Duration::from_millis(20)).await;
          Ok::<_, color_eyre::Report>(vec!["one".to_string()])
        }
      }
    };

    let (a, b) = tokio::join!(
      layer.resolve("@MangaChapters/9", slow(&calls)),
      layer.resolve("@MangaChapters/9", slow(&calls)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap().data, vec!["one".to_string()]);
    assert_eq!(b.unwrap().data, vec!["one".to_string()]);

    // Once settled the key is no longer in flight.
    layer.refresh("@MangaChapters/9", slow(&calls)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_concurrent_failure_reaches_every_waiter() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      layer.resolve("k", failing(&calls)),
      layer.resolve("k", failing(&calls)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), b.unwrap_err());
  }

  #[tokio::test]
  async fn test_different_keys_fetch_independently() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      layer.resolve("@Manga/1", counting(&calls, 1)),
      layer.resolve("@Manga/2", counting(&calls, 2)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(a.unwrap().data, 1);
    assert_eq!(b.unwrap().data, 2);
  }

  #[tokio::test]
  async fn test_invalidate_all_forces_refetch() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("@Mangas", counting(&calls, 1)).await.unwrap();
    layer.resolve("@Latest", counting(&calls, 2)).await.unwrap();
    layer.put_marker("@ChapterRead/m/c");

    layer.invalidate_all().unwrap();

    assert!(!layer.has_marker("@ChapterRead/m/c"));
    layer.resolve("@Mangas", counting(&calls, 1)).await.unwrap();
    layer.resolve("@Latest", counting(&calls, 2)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn test_nested_payload_round_trips() {
    let (layer, clock) = layer_with_clock();
    let payload = serde_json::json!({
      "id": "abc",
      "nsfw": false,
      "rating": 4.5,
      "chapters": 120,
      "genres": ["Action", "Fantasy"],
      "authors": [{ "name": "A", "roles": ["story", "art"] }],
      "extra": { "nested": { "deep": [1, 2, { "x": true }] } }
    });

    let expected = payload.clone();
    layer
      .resolve("@Manga/abc", move || async move { Ok(expected) })
      .await
      .unwrap();

    clock.advance(Duration::hours(1));
    let cached: Resolved<serde_json::Value> = layer
      .resolve("@Manga/abc", || async { Err(eyre!("should not fetch")) })
      .await
      .unwrap();

    assert_eq!(cached.data, payload);
    assert!(cached.is_from_cache());
  }

  #[tokio::test]
  async fn test_empty_key_is_rejected_without_fetching() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let err = layer.resolve("", counting(&calls, 1)).await.unwrap_err();

    assert_eq!(err, CacheError::InvalidKey);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_refresh_ignores_fresh_entry() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    layer.resolve("k", counting(&calls, 1)).await.unwrap();

    let result = layer.refresh("k", counting(&calls, 2)).await.unwrap();

    assert_eq!(result.data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(layer.lookup::<i32, _>("k").unwrap().data, 2);
  }

  #[tokio::test]
  async fn test_write_completes_after_caller_gives_up() {
    let (layer, _clock) = layer_with_clock();

    let pending = layer.resolve("@MangaImages/5", || async {
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
      Ok::<_, color_eyre::Report>(5)
    });
    let timed_out = tokio::time::timeout(std::time::Duration::from_millis(1), pending).await;
    assert!(timed_out.is_err());

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert_eq!(layer.lookup::<i32, _>("@MangaImages/5").unwrap().data, 5);
  }

  #[tokio::test]
  async fn test_panicking_fetch_is_a_remote_failure() {
    let (layer, _clock) = layer_with_clock();

    let err = layer
      .resolve("k", || async {
        if true {
          panic!("boom");
        }
        Ok::<i32, color_eyre::Report>(1)
      })
      .await
      .unwrap_err();
    assert!(err.is_remote());

    // The key does not stay stuck in flight.
    let calls = Arc::new(AtomicUsize::new(0));
    assert_eq!(layer.resolve("k", counting(&calls, 3)).await.unwrap().data, 3);
  }

  #[tokio::test]
  async fn test_fetcher_that_panics_before_returning_a_future() {
    let (layer, _clock) = layer_with_clock();

    let err = layer
      .resolve("k", || -> BoxFuture<'static, color_eyre::Result<i32>> { panic!("boom") })
      .await
      .unwrap_err();
    assert!(err.is_remote());

    let calls = Arc::new(AtomicUsize::new(0));
    assert_eq!(layer.resolve("k", counting(&calls, 4)).await.unwrap().data, 4);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_fetcher_may_resolve_through_the_same_layer() {
    let (layer, _clock) = layer_with_clock();
    let nested = layer.clone();

    let outer = layer.resolve("@Manga/outer", move || {
      // Blocks on a second fetch while the outer one is being started.
      let inner = futures::executor::block_on(
        nested.resolve("@Manga/inner", || async { Ok::<i32, color_eyre::Report>(1) }),
      );
      let value = inner.map(|resolved| resolved.data).unwrap_or(0);
      async move { Ok::<i32, color_eyre::Report>(value + 1) }
    });

    let resolved = tokio::time::timeout(std::time::Duration::from_secs(5), outer)
      .await
      .expect("starting a fetch must not hold the registry lock")
      .unwrap();
    assert_eq!(resolved.data, 2);
    assert_eq!(layer.lookup::<i32, _>("@Manga/inner").unwrap().data, 1);
  }

  #[test]
  fn test_future_entry_counts_as_fresh() {
    let (layer, _clock) = layer_with_clock();
    let entry = CacheEntry::new(1, start() + Duration::minutes(5));
    assert!(layer.is_fresh(&entry, Duration::hours(6)));
  }

  #[test]
  fn test_default_freshness_is_six_hours() {
    let layer = CacheLayer::new(SqliteStore::open_in_memory().unwrap());
    assert_eq!(layer.freshness(), Duration::hours(6));
  }

  #[test]
  fn test_markers() {
    let (layer, _clock) = layer_with_clock();
    assert!(!layer.has_marker("@ChapterRead/m/c"));
    layer.put_marker("@ChapterRead/m/c");
    assert!(layer.has_marker("@ChapterRead/m/c"));
  }

  /// Store whose reads or writes always fail.
  struct FaultyStore {
    inner: SqliteStore,
    fail_reads: bool,
    fail_writes: bool,
  }

  impl FaultyStore {
    fn new(fail_reads: bool, fail_writes: bool) -> Self {
      Self {
        inner: SqliteStore::open_in_memory().unwrap(),
        fail_reads,
        fail_writes,
      }
    }
  }

  impl KeyValueStore for FaultyStore {
    fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
      if self.fail_reads {
        return Err(eyre!("database is locked"));
      }
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> color_eyre::Result<()> {
      if self.fail_writes {
        return Err(eyre!("disk I/O error"));
      }
      self.inner.set(key, value)
    }

    fn clear_all(&self) -> color_eyre::Result<()> {
      self.inner.clear_all()
    }
  }

  #[tokio::test]
  async fn test_read_fault_falls_through_to_fetch() {
    let layer = CacheLayer::new(FaultyStore::new(true, false));
    let calls = Arc::new(AtomicUsize::new(0));

    layer.resolve("k", counting(&calls, 1)).await.unwrap();
    let result = layer.resolve("k", counting(&calls, 2)).await.unwrap();

    assert_eq!(result.data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_write_fault_still_returns_fetched_value() {
    let layer = CacheLayer::new(FaultyStore::new(false, true));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer.resolve("k", counting(&calls, 9)).await.unwrap();

    assert_eq!(result.data, 9);
    assert_eq!(result.source, CacheSource::Network);
    assert!(layer.lookup::<i32, _>("k").is_none());
  }

  #[tokio::test]
  async fn test_corrupt_entry_is_a_miss() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("k", "not json").unwrap();
    let layer = CacheLayer::new(store);
    let calls = Arc::new(AtomicUsize::new(0));

    assert!(layer.lookup::<i32, _>("k").is_none());
    let result = layer.resolve("k", counting(&calls, 4)).await.unwrap();

    assert_eq!(result.data, 4);
    assert_eq!(layer.lookup::<i32, _>("k").unwrap().data, 4);
  }
}
