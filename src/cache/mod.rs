//! Time-boxed local cache in front of a rate-limited remote API.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Persists each fetched payload with the time it was written
//! - Serves persisted payloads while they are inside a freshness window
//! - Falls through to the remote fetch when an entry is missing, stale or unreadable
//! - Shares one remote fetch between concurrent requests for the same key
//! - Clears every entry on demand

mod error;
mod layer;
mod storage;
mod traits;

pub use error::CacheError;
pub use layer::{CacheLayer, DEFAULT_FRESHNESS_HOURS};
pub use storage::{KeyValueStore, NoopStore, SqliteStore};
pub use traits::{CacheEntry, CacheKey, CacheSource, Cacheable, Resolved};

#[cfg(test)]
pub use traits::ManualClock;
