//! Error taxonomy for the cache layer.

use thiserror::Error;

/// Failures surfaced by [`CacheLayer`](super::CacheLayer).
///
/// Storage faults on read and write are normally swallowed by the layer and
/// only logged; the variants exist so the store helpers can report them in a
/// uniform way. `Clone` lets every waiter on a de-duplicated fetch observe the
/// same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  /// Persisted store unavailable or value corrupt on read
  #[error("failed to read cache entry {key}: {message}")]
  StorageRead { key: String, message: String },

  /// Persisted store unavailable on write
  #[error("failed to write cache entry {key}: {message}")]
  StorageWrite { key: String, message: String },

  /// Network or HTTP failure of the remote fetch
  #[error("failed to fetch {key}: {message}")]
  RemoteFetch { key: String, message: String },

  /// Cache keys must be non-empty
  #[error("cache key must not be empty")]
  InvalidKey,

  /// A shared payload could not be decoded into the requested type
  #[error("failed to decode payload for {key}: {message}")]
  Decode { key: String, message: String },
}

impl CacheError {
  /// Whether this error came from the remote side rather than local storage.
  pub fn is_remote(&self) -> bool {
    matches!(self, CacheError::RemoteFetch { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display_includes_key() {
    let err = CacheError::RemoteFetch {
      key: "@Manga/42".to_string(),
      message: "HTTP 429".to_string(),
    };
    assert_eq!(err.to_string(), "failed to fetch @Manga/42: HTTP 429");
    assert!(err.is_remote());
  }

  #[test]
  fn test_storage_errors_are_not_remote() {
    let err = CacheError::StorageWrite {
      key: "k".to_string(),
      message: "disk full".to_string(),
    };
    assert!(!err.is_remote());
    assert!(!CacheError::InvalidKey.is_remote());
  }
}
