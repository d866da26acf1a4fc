//! Bounded pool for detached background refreshes.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::http::CacheKey;

/// Runs refreshes as detached tasks, at most `capacity` at a time and at most
/// one per cache key. Work that does not fit is skipped, not queued.
#[derive(Clone)]
pub struct RefreshPool {
  permits: Arc<Semaphore>,
  capacity: usize,
  in_flight: Arc<Mutex<HashSet<CacheKey>>>,
}

impl RefreshPool {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      permits: Arc::new(Semaphore::new(capacity)),
      capacity,
      in_flight: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Spawn `task` unless the pool is full or `key` is already refreshing.
  /// Returns whether the task was started.
  pub fn submit<F>(&self, key: CacheKey, task: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    {
      let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      if !in_flight.insert(key.clone()) {
        debug!(key = %key, "refresh already in flight");
        return false;
      }
    }

    let permit = match Arc::clone(&self.permits).try_acquire_owned() {
      Ok(permit) => permit,
      Err(_) => {
        self.release(&key);
        debug!(key = %key, capacity = self.capacity, "refresh pool full, skipping");
        return false;
      }
    };

    let pool = self.clone();
    tokio::spawn(async move {
      task.await;
      pool.release(&key);
      drop(permit);
    });
    true
  }

  /// Wait until no refresh is running.
  pub async fn wait_idle(&self) {
    if let Ok(all) = self.permits.acquire_many(self.capacity as u32).await {
      drop(all);
    }
  }

  fn release(&self, key: &CacheKey) {
    self
      .in_flight
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(key);
  }
}
