//! Generation-scoped cache stores and the arena that owns their lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::traits::{CacheId, CacheKind, CachedEntry};
use crate::error::{EngineError, EngineResult};
use crate::http::CacheKey;

/// Handle to one generation-scoped cache store.
///
/// Every operation tolerates storage failure: reads degrade to a miss and
/// writes are dropped, with a warning logged either way.
///
/// Writes hold the read side of `retired` until they reach storage, so
/// retiring a handle waits for in-flight writes and no write lands after it.
#[derive(Clone)]
pub struct CacheStore {
  id: Arc<CacheId>,
  storage: Arc<dyn CacheStorage>,
  retired: Arc<RwLock<bool>>,
  read_timeout: Duration,
}

impl CacheStore {
  pub fn id(&self) -> &CacheId {
    &self.id
  }

  pub fn kind(&self) -> CacheKind {
    self.id.kind
  }

  /// The store belongs to a superseded or destroyed generation.
  pub fn is_retired(&self) -> bool {
    *self.retired.read().unwrap_or_else(|e| e.into_inner())
  }

  fn retire(&self) {
    *self.retired.write().unwrap_or_else(|e| e.into_inner()) = true;
  }

  /// Look up an entry. Errors and reads slower than the read timeout are misses.
  pub async fn get(&self, key: &CacheKey) -> Option<CachedEntry> {
    let storage = Arc::clone(&self.storage);
    let id = Arc::clone(&self.id);
    let lookup_key = key.clone();
    let read = tokio::task::spawn_blocking(move || storage.get_entry(&id, &lookup_key));

    match tokio::time::timeout(self.read_timeout, read).await {
      Ok(Ok(Ok(entry))) => entry,
      Ok(Ok(Err(e))) => {
        warn!(cache = %self.id, key = %key, error = %e, "cache read failed, treating as miss");
        None
      }
      Ok(Err(e)) => {
        warn!(cache = %self.id, error = %e, "cache read task failed, treating as miss");
        None
      }
      Err(_) => {
        warn!(
          cache = %self.id,
          timeout_ms = self.read_timeout.as_millis() as u64,
          "cache read timed out, treating as miss"
        );
        None
      }
    }
  }

  /// Store an entry, reporting failures to the caller.
  pub async fn try_put(&self, entry: CachedEntry) -> EngineResult<()> {
    let storage = Arc::clone(&self.storage);
    let id = Arc::clone(&self.id);
    let retired = Arc::clone(&self.retired);
    tokio::task::spawn_blocking(move || {
      let retired = retired.read().unwrap_or_else(|e| e.into_inner());
      if *retired {
        return Err(EngineError::StorageUnavailable(format!("cache {} is retired", id)));
      }
      storage.put_entry(&id, &entry)
    })
    .await
    .map_err(|e| EngineError::StorageUnavailable(format!("cache write task failed: {}", e)))?
  }

  /// Store an entry. Returns whether it was written.
  pub async fn put(&self, entry: CachedEntry) -> bool {
    let key = entry.key.clone();
    match self.try_put(entry).await {
      Ok(()) => {
        debug!(cache = %self.id, key = %key, "stored entry");
        true
      }
      Err(e) => {
        if self.is_retired() {
          debug!(cache = %self.id, key = %key, "dropping write to retired cache");
        } else {
          warn!(cache = %self.id, key = %key, error = %e, "cache write failed");
        }
        false
      }
    }
  }

  /// Remove entries older than `max_age`. Static stores never expire by age.
  pub async fn sweep_expired(&self, max_age: Duration) -> usize {
    if self.kind() == CacheKind::Static || self.is_retired() {
      return 0;
    }

    let cutoff = match chrono::Duration::from_std(max_age) {
      Ok(age) => Utc::now() - age,
      Err(_) => return 0,
    };
    let storage = Arc::clone(&self.storage);
    let id = Arc::clone(&self.id);

    match tokio::task::spawn_blocking(move || storage.sweep_entries(&id, cutoff)).await {
      Ok(Ok(removed)) => {
        if removed > 0 {
          info!(cache = %self.id, removed, "swept expired entries");
        }
        removed
      }
      Ok(Err(e)) => {
        warn!(cache = %self.id, error = %e, "sweep failed");
        0
      }
      Err(e) => {
        warn!(cache = %self.id, error = %e, "sweep task failed");
        0
      }
    }
  }
}

#[derive(Default)]
struct Stores {
  live: HashMap<(CacheKind, String), CacheStore>,
  /// Superseded generations; never handed out as writable again
  retired: HashSet<String>,
}

/// Mapping from (cache kind, generation) to live store handles.
pub struct CacheArena {
  storage: Arc<dyn CacheStorage>,
  prefix: String,
  read_timeout: Duration,
  stores: Mutex<Stores>,
}

impl CacheArena {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    prefix: impl Into<String>,
    read_timeout: Duration,
  ) -> Self {
    Self {
      storage,
      prefix: prefix.into(),
      read_timeout,
      stores: Mutex::new(Stores::default()),
    }
  }

  fn stores(&self) -> std::sync::MutexGuard<'_, Stores> {
    self.stores.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn handle(&self, id: CacheId, retired: bool) -> CacheStore {
    CacheStore {
      id: Arc::new(id),
      storage: Arc::clone(&self.storage),
      retired: Arc::new(RwLock::new(retired)),
      read_timeout: self.read_timeout,
    }
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn cache_id(&self, kind: CacheKind, generation: &str) -> CacheId {
    CacheId::new(&self.prefix, kind, generation)
  }

  /// Get the store for a generation, creating it on first use.
  ///
  /// A retired generation gets a read-only handle and is not registered
  /// again, so a late request cannot bring a purged cache back.
  pub fn open(&self, kind: CacheKind, generation: &str) -> CacheStore {
    let mut stores = self.stores();
    let id = self.cache_id(kind, generation);
    if stores.retired.contains(generation) {
      debug!(cache = %id, "opened retired cache");
      return self.handle(id, true);
    }
    if let Some(store) = stores.live.get(&(kind, generation.to_string())) {
      return store.clone();
    }

    match self.storage.register_cache(&id) {
      Ok(true) => debug!(cache = %id, "created cache"),
      Ok(false) => {}
      Err(e) => warn!(cache = %id, error = %e, "failed to register cache"),
    }

    let store = self.handle(id, false);
    stores.live.insert((kind, generation.to_string()), store.clone());
    store
  }

  /// Retire every live handle of a generation and refuse writable handles
  /// for it from now on. Returns once in-flight writes have finished.
  pub fn retire_generation(&self, generation: &str) {
    let mut stores = self.stores();
    stores.retired.insert(generation.to_string());
    stores.live.retain(|(_, g), store| {
      if g == generation {
        store.retire();
        false
      } else {
        true
      }
    });
  }

  /// Allow a previously retired generation to be installed again.
  pub fn reinstate(&self, generation: &str) {
    if self.stores().retired.remove(generation) {
      debug!(generation, "reinstated retired generation");
    }
  }

  /// Retire the handle and delete the store with all its entries.
  pub fn destroy(&self, kind: CacheKind, generation: &str) -> EngineResult<bool> {
    if let Some(store) = self.stores().live.remove(&(kind, generation.to_string())) {
      store.retire();
    }
    let id = self.cache_id(kind, generation);
    self.storage.delete_cache(&id.name)
  }

  /// Every cache known to storage.
  pub fn list(&self) -> EngineResult<Vec<CacheId>> {
    self.storage.caches()
  }

  /// Delete every cache whose generation is not in `keep`.
  ///
  /// Each cache is deleted independently, so a purge interrupted midway is
  /// completed by simply running it again.
  pub fn purge_except(&self, keep: &[&str]) -> EngineResult<usize> {
    let stale: Vec<CacheId> = self
      .list()?
      .into_iter()
      .filter(|cache| !keep.contains(&cache.generation.as_str()))
      .collect();

    let mut purged = 0;
    for cache in stale {
      self.retire_generation(&cache.generation);
      if self.storage.delete_cache(&cache.name)? {
        info!(cache = %cache, "purged stale cache");
        purged += 1;
      }
    }
    Ok(purged)
  }

  /// Delete every cache regardless of generation. Live handles stay usable.
  pub fn purge_all(&self) -> EngineResult<usize> {
    let purged = self.storage.clear_all()?;
    info!(purged, "purged all caches");
    Ok(purged)
  }
}
