//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Payloads that can be persisted by the cache layer.
///
/// Anything that round-trips through JSON and can cross task boundaries
/// qualifies, so this is blanket-implemented.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Identifies a logical resource instance in the persisted store.
///
/// The mapping from a key value to its storage key must be a pure function of
/// resource kind and identifier, so that distinct resources never share an
/// entry.
pub trait CacheKey {
  /// String used to address the entry in the key-value store
  fn storage_key(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String {
    self.storage_key()
  }
}

impl CacheKey for str {
  fn storage_key(&self) -> String {
    self.to_string()
  }
}

impl CacheKey for String {
  fn storage_key(&self) -> String {
    self.clone()
  }
}

/// A persisted payload together with the time it was written.
///
/// Entries are replaced wholesale; `stored_at` is the write time, never the
/// time the fetch started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  /// Last known-good payload
  pub data: T,
  /// When the entry was written
  #[serde(rename = "storedAt", with = "chrono::serde::ts_milliseconds")]
  pub stored_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, stored_at: DateTime<Utc>) -> Self {
    Self { data, stored_at }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was written to the store
  pub stored_at: DateTime<Utc>,
}

impl<T> Resolved<T> {
  /// Fresh data that was just fetched (and persisted at `stored_at`).
  pub fn from_network(data: T, stored_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      stored_at,
    }
  }

  /// Data served from a persisted entry still inside its freshness window.
  pub fn from_cache(entry: CacheEntry<T>) -> Self {
    Self {
      data: entry.data,
      source: CacheSource::Cache,
      stored_at: entry.stored_at,
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where resolved data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Persisted data, still inside the freshness window
  Cache,
}

/// Source of wall-clock time for staleness decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
  now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
  pub fn at(now: DateTime<Utc>) -> Self {
    Self {
      now: std::sync::Mutex::new(now),
    }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.now.lock().unwrap() = now;
  }

  pub fn advance(&self, by: chrono::Duration) {
    let mut now = self.now.lock().unwrap();
    *now += by;
  }
}

#[cfg(test)]
impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}
