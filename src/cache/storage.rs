//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheId, CacheKind, CachedEntry};
use crate::error::{EngineError, EngineResult};
use crate::http::{CacheKey, Response};

/// Trait for cache storage backends.
///
/// Every method is synchronous and may fail; callers on the request path go
/// through [`CacheStore`](super::CacheStore), which turns failures into misses.
pub trait CacheStorage: Send + Sync {
  /// Record a cache in the registry. Returns true if it was not known before.
  fn register_cache(&self, cache: &CacheId) -> EngineResult<bool>;

  /// All registered caches, in registration order.
  fn caches(&self) -> EngineResult<Vec<CacheId>>;

  /// Get a stored entry.
  fn get_entry(&self, cache: &CacheId, key: &CacheKey) -> EngineResult<Option<CachedEntry>>;

  /// Store an entry, replacing any previous entry for the same key.
  fn put_entry(&self, cache: &CacheId, entry: &CachedEntry) -> EngineResult<()>;

  /// Delete a cache and all of its entries. Returns true if anything was deleted.
  fn delete_cache(&self, name: &str) -> EngineResult<bool>;

  /// Delete every cache and entry. Returns the number of caches removed.
  fn clear_all(&self) -> EngineResult<usize>;

  /// Delete entries stored before the cutoff. Returns the number removed.
  fn sweep_entries(&self, cache: &CacheId, stored_before: DateTime<Utc>) -> EngineResult<usize>;

  fn entry_count(&self, cache: &CacheId) -> EngineResult<usize>;

  /// Generation tag persisted as active, if any.
  fn active_generation(&self) -> EngineResult<Option<String>>;

  /// Persist `generation` as active. Clears it as the waiting generation.
  fn set_active_generation(&self, generation: &str) -> EngineResult<()>;

  /// Installed generation persisted as waiting to activate, if any.
  fn waiting_generation(&self) -> EngineResult<Option<String>>;

  fn set_waiting_generation(&self, generation: &str) -> EngineResult<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the database cannot be opened - the engine runs network-only.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn register_cache(&self, _cache: &CacheId) -> EngineResult<bool> {
    Ok(false)
  }

  fn caches(&self) -> EngineResult<Vec<CacheId>> {
    Ok(Vec::new())
  }

  fn get_entry(&self, _cache: &CacheId, _key: &CacheKey) -> EngineResult<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put_entry(&self, _cache: &CacheId, _entry: &CachedEntry) -> EngineResult<()> {
    Ok(()) // Discard
  }

  fn delete_cache(&self, _name: &str) -> EngineResult<bool> {
    Ok(false)
  }

  fn clear_all(&self) -> EngineResult<usize> {
    Ok(0)
  }

  fn sweep_entries(&self, _cache: &CacheId, _stored_before: DateTime<Utc>) -> EngineResult<usize> {
    Ok(0)
  }

  fn entry_count(&self, _cache: &CacheId) -> EngineResult<usize> {
    Ok(0)
  }

  fn active_generation(&self) -> EngineResult<Option<String>> {
    Ok(None)
  }

  fn set_active_generation(&self, _generation: &str) -> EngineResult<()> {
    Ok(())
  }

  fn waiting_generation(&self) -> EngineResult<Option<String>> {
    Ok(None)
  }

  fn set_waiting_generation(&self, _generation: &str) -> EngineResult<()> {
    Ok(())
  }
}

/// SQLite-based storage for the caches, lifecycle metadata and sync queue.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    conn
      .pragma_update(None, "journal_mode", "WAL")
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    Self::with_connection(conn)
  }

  /// Private, non-durable database. Used by tests and as a scratch store.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(())
  }

  pub(crate) fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for all engine tables.
const SCHEMA: &str = r#"
-- Registry of generation-scoped caches (a cache may exist with no entries)
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    generation TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    redirected INTEGER NOT NULL DEFAULT 0,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(cache_name, stored_at);

-- Lifecycle metadata (active and waiting generation)
CREATE TABLE IF NOT EXISTS engine_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Durable FIFO of pending mutations; id order is delivery order
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB,
    content_type TEXT,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;

const ACTIVE_GENERATION_KEY: &str = "active_generation";
const WAITING_GENERATION_KEY: &str = "waiting_generation";

impl CacheStorage for SqliteStorage {
  fn register_cache(&self, cache: &CacheId) -> EngineResult<bool> {
    let conn = self.lock()?;
    let inserted = conn.execute(
      "INSERT OR IGNORE INTO caches (name, kind, generation, created_at) VALUES (?, ?, ?, ?)",
      params![
        cache.name,
        cache.kind.as_str(),
        cache.generation,
        format_datetime(Utc::now())
      ],
    )?;
    Ok(inserted > 0)
  }

  fn caches(&self) -> EngineResult<Vec<CacheId>> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT name, kind, generation FROM caches ORDER BY created_at, name")?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(name, kind, generation)| {
          CacheKind::parse(&kind).map(|kind| CacheId {
            name,
            kind,
            generation,
          })
        })
        .collect(),
    )
  }

  fn get_entry(&self, cache: &CacheId, key: &CacheKey) -> EngineResult<Option<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT url, status, headers, body, redirected, stored_at FROM cache_entries
       WHERE cache_name = ? AND entry_key = ?",
    )?;

    let row: Option<(String, u16, String, Vec<u8>, bool, String)> = stmt
      .query_row(params![cache.name, key.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()?;

    let Some((url, status, headers, body, redirected, stored_at)) = row else {
      return Ok(None);
    };

    let status = StatusCode::from_u16(status)
      .map_err(|e| EngineError::StorageUnavailable(format!("Corrupt status {}: {}", status, e)))?;
    let pairs: Vec<(String, String)> = serde_json::from_str(&headers)?;

    Ok(Some(CachedEntry {
      key: key.clone(),
      url,
      response: Response {
        status,
        headers: Response::headers_from_pairs(&pairs),
        body,
        redirected,
      },
      stored_at: parse_datetime(&stored_at)?,
    }))
  }

  fn put_entry(&self, cache: &CacheId, entry: &CachedEntry) -> EngineResult<()> {
    let headers = serde_json::to_string(&entry.response.header_pairs())?;
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    // A write after PURGE_ALL must leave the cache discoverable for the next purge
    tx.execute(
      "INSERT OR IGNORE INTO caches (name, kind, generation, created_at) VALUES (?, ?, ?, ?)",
      params![
        cache.name,
        cache.kind.as_str(),
        cache.generation,
        format_datetime(Utc::now())
      ],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
       (cache_name, entry_key, url, status, headers, body, redirected, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        cache.name,
        entry.key.as_str(),
        entry.url,
        entry.response.status.as_u16(),
        headers,
        entry.response.body,
        entry.response.redirected,
        format_datetime(entry.stored_at)
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn delete_cache(&self, name: &str) -> EngineResult<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let entries = tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])?;
    let registered = tx.execute("DELETE FROM caches WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(entries + registered > 0)
  }

  fn clear_all(&self) -> EngineResult<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let names: Vec<String> = {
      let mut stmt = tx.prepare(
        "SELECT name FROM caches UNION SELECT DISTINCT cache_name FROM cache_entries",
      )?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      names
    };
    tx.execute("DELETE FROM cache_entries", [])?;
    tx.execute("DELETE FROM caches", [])?;
    tx.commit()?;
    Ok(names.len())
  }

  fn sweep_entries(&self, cache: &CacheId, stored_before: DateTime<Utc>) -> EngineResult<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ? AND stored_at < ?",
      params![cache.name, format_datetime(stored_before)],
    )?;
    Ok(removed)
  }

  fn entry_count(&self, cache: &CacheId) -> EngineResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
      params![cache.name],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn active_generation(&self) -> EngineResult<Option<String>> {
    self.meta(ACTIVE_GENERATION_KEY)
  }

  fn set_active_generation(&self, generation: &str) -> EngineResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO engine_meta (key, value) VALUES (?, ?)",
      params![ACTIVE_GENERATION_KEY, generation],
    )?;
    tx.execute(
      "DELETE FROM engine_meta WHERE key = ? AND value = ?",
      params![WAITING_GENERATION_KEY, generation],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn waiting_generation(&self) -> EngineResult<Option<String>> {
    self.meta(WAITING_GENERATION_KEY)
  }

  fn set_waiting_generation(&self, generation: &str) -> EngineResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO engine_meta (key, value) VALUES (?, ?)",
      params![WAITING_GENERATION_KEY, generation],
    )?;
    Ok(())
  }
}

impl SqliteStorage {
  fn meta(&self, key: &str) -> EngineResult<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM engine_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string written by [`format_datetime`].
pub(crate) fn parse_datetime(s: &str) -> EngineResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      EngineError::StorageUnavailable(format!("Failed to parse datetime '{}': {}", s, e))
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::{HeaderValue, CONTENT_TYPE};

  fn entry(key: &str, body: &str) -> CachedEntry {
    CachedEntry::new(
      CacheKey::from_stored(key.to_string()),
      format!("https://example.com/{}", key),
      Response::new(StatusCode::OK, body)
        .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain")),
    )
  }

  #[test]
  fn test_put_get_roundtrip_preserves_response() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cache = CacheId::new("t", CacheKind::Static, "v1");
    let stored = entry("a", "hello");

    storage.put_entry(&cache, &stored).unwrap();
    let loaded = storage.get_entry(&cache, &stored.key).unwrap().unwrap();

    assert_eq!(loaded.response, stored.response);
    assert_eq!(loaded.url, stored.url);
    assert_eq!(
      format_datetime(loaded.stored_at),
      format_datetime(stored.stored_at)
    );
  }

  #[test]
  fn test_same_key_is_last_write_wins() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cache = CacheId::new("t", CacheKind::Dynamic, "v1");

    storage.put_entry(&cache, &entry("a", "first")).unwrap();
    storage.put_entry(&cache, &entry("a", "second")).unwrap();

    let loaded = storage
      .get_entry(&cache, &CacheKey::from_stored("a".into()))
      .unwrap()
      .unwrap();
    assert_eq!(loaded.response.body, b"second");
    assert_eq!(storage.entry_count(&cache).unwrap(), 1);
  }

  #[test]
  fn test_caches_are_isolated_by_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let v1 = CacheId::new("t", CacheKind::Static, "v1");
    let v2 = CacheId::new("t", CacheKind::Static, "v2");
    let stored = entry("a", "v1 body");

    storage.put_entry(&v1, &stored).unwrap();
    assert!(storage.get_entry(&v2, &stored.key).unwrap().is_none());

    assert!(storage.delete_cache(&v1.name).unwrap());
    assert!(storage.get_entry(&v1, &stored.key).unwrap().is_none());
    assert!(!storage.delete_cache(&v1.name).unwrap());
  }

  #[test]
  fn test_registry_lists_empty_caches() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cache = CacheId::new("t", CacheKind::Dynamic, "v1");

    assert!(storage.register_cache(&cache).unwrap());
    assert!(!storage.register_cache(&cache).unwrap());
    assert_eq!(storage.caches().unwrap(), vec![cache]);
  }

  #[test]
  fn test_sweep_removes_only_old_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cache = CacheId::new("t", CacheKind::Dynamic, "v1");

    let mut old = entry("old", "x");
    old.stored_at = Utc::now() - chrono::Duration::days(2);
    storage.put_entry(&cache, &old).unwrap();
    storage.put_entry(&cache, &entry("new", "y")).unwrap();

    let removed = storage
      .sweep_entries(&cache, Utc::now() - chrono::Duration::days(1))
      .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(storage.entry_count(&cache).unwrap(), 1);
  }

  #[test]
  fn test_clear_all_counts_caches() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let a = CacheId::new("t", CacheKind::Static, "v1");
    let b = CacheId::new("t", CacheKind::Dynamic, "v1");
    storage.put_entry(&a, &entry("a", "x")).unwrap();
    storage.register_cache(&b).unwrap();

    assert_eq!(storage.clear_all().unwrap(), 2);
    assert!(storage.caches().unwrap().is_empty());
  }

  #[test]
  fn test_active_generation_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      assert_eq!(storage.active_generation().unwrap(), None);
      storage.set_active_generation("v2").unwrap();
    }

    let reopened = SqliteStorage::open(&path).unwrap();
    assert_eq!(reopened.active_generation().unwrap(), Some("v2".to_string()));
  }

  #[test]
  fn test_activation_clears_matching_waiting_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.set_waiting_generation("v3").unwrap();
    assert_eq!(storage.waiting_generation().unwrap(), Some("v3".to_string()));

    storage.set_active_generation("v2").unwrap();
    assert_eq!(storage.waiting_generation().unwrap(), Some("v3".to_string()));

    storage.set_active_generation("v3").unwrap();
    assert_eq!(storage.waiting_generation().unwrap(), None);
    assert_eq!(storage.active_generation().unwrap(), Some("v3".to_string()));
  }
}
