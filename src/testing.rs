//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::cache::{CacheId, CacheStorage, CachedEntry, SqliteStorage};
use crate::error::{EngineError, EngineResult};
use crate::http::{CacheKey, Request, Response};
use crate::network::NetworkFetcher;

pub(crate) fn url(s: &str) -> Url {
  Url::parse(s).unwrap()
}

/// Scripted network: fixed responses per (method, url), switchable offline
/// mode, optional latency, and a log of every request it saw.
pub(crate) struct MockFetcher {
  routes: Mutex<HashMap<(Method, String), Response>>,
  failures: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
  delay: Mutex<Duration>,
  requests: Mutex<Vec<Request>>,
}

impl MockFetcher {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      routes: Mutex::new(HashMap::new()),
      failures: Mutex::new(HashMap::new()),
      offline: AtomicBool::new(false),
      delay: Mutex::new(Duration::ZERO),
      requests: Mutex::new(Vec::new()),
    })
  }

  pub(crate) fn respond(&self, method: Method, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url.to_string()), response);
  }

  pub(crate) fn respond_ok(&self, url: &str, body: &str) {
    self.respond(Method::GET, url, Response::new(StatusCode::OK, body.to_string()));
  }

  /// The next `times` requests to `url` fail as if the network were down.
  pub(crate) fn fail_next(&self, url: &str, times: usize) {
    self.failures.lock().unwrap().insert(url.to_string(), times);
  }

  pub(crate) fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub(crate) fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  pub(crate) fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub(crate) fn calls_to(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub(crate) fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl NetworkFetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> EngineResult<Response> {
    self.requests.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(EngineError::NetworkUnavailable("mock offline".to_string()));
    }

    {
      let mut failures = self.failures.lock().unwrap();
      if let Some(remaining) = failures.get_mut(request.url.as_str()) {
        if *remaining > 0 {
          *remaining -= 1;
          return Err(EngineError::NetworkUnavailable("mock failure".to_string()));
        }
      }
    }

    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(&(request.method.clone(), request.url.to_string()))
        .cloned()
        .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, "not found")),
    )
  }
}

/// Storage wrapper that counts mutations and can simulate failing or slow reads.
pub(crate) struct CountingStorage {
  inner: SqliteStorage,
  mutations: AtomicUsize,
  fail_reads: AtomicBool,
  fail_deletes_after: Mutex<Option<usize>>,
  read_delay: Mutex<Duration>,
  write_delay: Mutex<Duration>,
}

impl CountingStorage {
  pub(crate) fn new(inner: SqliteStorage) -> Self {
    Self {
      inner,
      mutations: AtomicUsize::new(0),
      fail_reads: AtomicBool::new(false),
      fail_deletes_after: Mutex::new(None),
      read_delay: Mutex::new(Duration::ZERO),
      write_delay: Mutex::new(Duration::ZERO),
    }
  }

  pub(crate) fn mutations(&self) -> usize {
    self.mutations.load(Ordering::SeqCst)
  }

  pub(crate) fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Allow `n` more cache deletions, then fail every later one.
  pub(crate) fn fail_deletes_after(&self, n: Option<usize>) {
    *self.fail_deletes_after.lock().unwrap() = n;
  }

  pub(crate) fn set_read_delay(&self, delay: Duration) {
    *self.read_delay.lock().unwrap() = delay;
  }

  pub(crate) fn set_write_delay(&self, delay: Duration) {
    *self.write_delay.lock().unwrap() = delay;
  }

  fn mutated(&self) {
    self.mutations.fetch_add(1, Ordering::SeqCst);
  }
}

impl CacheStorage for CountingStorage {
  fn register_cache(&self, cache: &CacheId) -> EngineResult<bool> {
    let created = self.inner.register_cache(cache)?;
    if created {
      self.mutated();
    }
    Ok(created)
  }

  fn caches(&self) -> EngineResult<Vec<CacheId>> {
    self.inner.caches()
  }

  fn get_entry(&self, cache: &CacheId, key: &CacheKey) -> EngineResult<Option<CachedEntry>> {
    let delay = *self.read_delay.lock().unwrap();
    if !delay.is_zero() {
      std::thread::sleep(delay);
    }
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(EngineError::StorageUnavailable("simulated read failure".into()));
    }
    self.inner.get_entry(cache, key)
  }

  fn put_entry(&self, cache: &CacheId, entry: &CachedEntry) -> EngineResult<()> {
    let delay = *self.write_delay.lock().unwrap();
    if !delay.is_zero() {
      std::thread::sleep(delay);
    }
    self.mutated();
    self.inner.put_entry(cache, entry)
  }

  fn delete_cache(&self, name: &str) -> EngineResult<bool> {
    {
      let mut budget = self.fail_deletes_after.lock().unwrap();
      if let Some(remaining) = budget.as_mut() {
        if *remaining == 0 {
          return Err(EngineError::StorageUnavailable("simulated crash".into()));
        }
        *remaining -= 1;
      }
    }
    self.mutated();
    self.inner.delete_cache(name)
  }

  fn clear_all(&self) -> EngineResult<usize> {
    self.mutated();
    self.inner.clear_all()
  }

  fn sweep_entries(&self, cache: &CacheId, stored_before: DateTime<Utc>) -> EngineResult<usize> {
    self.mutated();
    self.inner.sweep_entries(cache, stored_before)
  }

  fn entry_count(&self, cache: &CacheId) -> EngineResult<usize> {
    self.inner.entry_count(cache)
  }

  fn active_generation(&self) -> EngineResult<Option<String>> {
    self.inner.active_generation()
  }

  fn set_active_generation(&self, generation: &str) -> EngineResult<()> {
    self.mutated();
    self.inner.set_active_generation(generation)
  }

  fn waiting_generation(&self) -> EngineResult<Option<String>> {
    self.inner.waiting_generation()
  }

  fn set_waiting_generation(&self, generation: &str) -> EngineResult<()> {
    self.mutated();
    self.inner.set_waiting_generation(generation)
  }
}
