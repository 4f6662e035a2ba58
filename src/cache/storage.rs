//! Key-value store trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistent string key-value storage consumed by the cache layer.
///
/// Values are opaque strings; serialization is owned by the caller. The store
/// is shared process-wide, so implementations must be usable from any task.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove every stored value.
  fn clear_all(&self) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear_all(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based key-value store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("mangashelf").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_get_missing_key_returns_none() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.get("@Manga/1").unwrap(), None);
  }

  #[test]
  fn test_set_then_get() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("@Manga/1", r#"{"data":1}"#).unwrap();
    assert_eq!(
      store.get("@Manga/1").unwrap().as_deref(),
      Some(r#"{"data":1}"#)
    );
  }

  #[test]
  fn test_set_replaces_value() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("k", "first").unwrap();
    store.set("k", "second").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));
  }

  #[test]
  fn test_clear_all_removes_every_key() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("@Mangas/page=1", "a").unwrap();
    store.set("@ChapterRead/m/c", "true").unwrap();

    store.clear_all().unwrap();

    assert_eq!(store.get("@Mangas/page=1").unwrap(), None);
    assert_eq!(store.get("@ChapterRead/m/c").unwrap(), None);
  }

  #[test]
  fn test_open_at_creates_parent_directories() {
    let dir = std::env::temp_dir().join(format!("mangashelf-store-{}", std::process::id()));
    let path = dir.join("nested").join("cache.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.set("k", "v").unwrap();
    }

    let reopened = SqliteStore::open_at(&path).unwrap();
    assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));

    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn test_noop_store_never_hits() {
    let store = NoopStore;
    store.set("k", "v").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
    assert!(store.clear_all().is_ok());
  }

  #[test]
  fn test_default_path_is_namespaced() {
    if let Ok(path) = SqliteStore::default_path() {
      assert!(path.ends_with("mangashelf/cache.db"));
    }
  }
}
