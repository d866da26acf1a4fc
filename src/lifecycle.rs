//! Cache generation lifecycle: install, wait, activate, supersede.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheArena, CacheKind, CachedEntry, StrategyExecutor};
use crate::control::{ControlMessage, ControlReply};
use crate::error::{EngineError, EngineResult};
use crate::http::{extension, Destination, Request};

/// State of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Critical-path assets are being cached
  Installing,
  /// Fully cached, waiting for the previous generation's clients to go away
  Waiting,
  /// Serving requests
  Active,
  /// Replaced; lives on only while its in-flight requests drain
  Superseded,
}

#[derive(Debug, Clone)]
pub struct InstallPolicy {
  pub max_attempts: u32,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
}

impl InstallPolicy {
  /// Delay after the `attempt`-th failed attempt: doubling, capped.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self
      .backoff_base
      .saturating_mul(1u32 << exponent)
      .min(self.backoff_max)
  }
}

/// Result of an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
  pub generation: String,
  pub previous: Option<String>,
  /// Stale caches deleted by this activation
  pub purged: usize,
}

#[derive(Debug, Default)]
struct Generations {
  active: Option<String>,
  installing: Option<String>,
  waiting: Option<String>,
  superseded: Vec<String>,
}

/// In-flight request counts per generation.
#[derive(Default)]
struct LeaseTable {
  counts: Mutex<HashMap<String, usize>>,
  released: Notify,
}

impl LeaseTable {
  fn acquire(self: &Arc<Self>, generation: &str) -> ClientLease {
    let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
    *counts.entry(generation.to_string()).or_insert(0) += 1;
    ClientLease {
      table: Arc::clone(self),
      generation: generation.to_string(),
    }
  }

  fn count(&self, generation: &str) -> usize {
    let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
    counts.get(generation).copied().unwrap_or(0)
  }
}

/// Marks a request as being served under a generation. Dropping the lease
/// releases the client.
pub struct ClientLease {
  table: Arc<LeaseTable>,
  generation: String,
}

impl ClientLease {
  pub fn generation(&self) -> &str {
    &self.generation
  }
}

impl Drop for ClientLease {
  fn drop(&mut self) {
    let mut counts = self.table.counts.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(count) = counts.get_mut(&self.generation) {
      *count -= 1;
      if *count == 0 {
        counts.remove(&self.generation);
        drop(counts);
        self.table.released.notify_waiters();
      }
    }
  }
}

/// Manages cache generations: pre-warms a new one, activates it, and purges
/// every store belonging to any other generation.
pub struct LifecycleController {
  arena: Arc<CacheArena>,
  executor: StrategyExecutor,
  origin: Url,
  precache: Vec<String>,
  max_body_bytes: usize,
  policy: InstallPolicy,
  generations: Mutex<Generations>,
  leases: Arc<LeaseTable>,
}

impl LifecycleController {
  pub fn new(
    arena: Arc<CacheArena>,
    executor: StrategyExecutor,
    origin: Url,
    precache: Vec<String>,
    max_body_bytes: usize,
    policy: InstallPolicy,
  ) -> Self {
    Self {
      arena,
      executor,
      origin,
      precache,
      max_body_bytes,
      policy,
      generations: Mutex::new(Generations::default()),
      leases: Arc::new(LeaseTable::default()),
    }
  }

  fn generations(&self) -> std::sync::MutexGuard<'_, Generations> {
    self.generations.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn active_generation(&self) -> Option<String> {
    self.generations().active.clone()
  }

  pub fn waiting_generation(&self) -> Option<String> {
    self.generations().waiting.clone()
  }

  pub fn state(&self, generation: &str) -> Option<LifecycleState> {
    let g = self.generations();
    if g.active.as_deref() == Some(generation) {
      Some(LifecycleState::Active)
    } else if g.waiting.as_deref() == Some(generation) {
      Some(LifecycleState::Waiting)
    } else if g.installing.as_deref() == Some(generation) {
      Some(LifecycleState::Installing)
    } else if g.superseded.iter().any(|s| s == generation) && self.leases.count(generation) > 0 {
      Some(LifecycleState::Superseded)
    } else {
      None
    }
  }

  /// Restore the persisted active and waiting generations and finish any
  /// purge that was interrupted before the last shutdown.
  pub fn resume(&self) -> EngineResult<Option<String>> {
    let storage = self.arena.storage();
    let active = storage.active_generation()?;
    let installed = self.arena.list()?;
    let waiting = storage.waiting_generation()?.filter(|waiting| {
      active.as_deref() != Some(waiting.as_str())
        && installed.iter().any(|cache| &cache.generation == waiting)
    });
    {
      let mut g = self.generations();
      g.active = active.clone();
      g.waiting = waiting.clone();
    }

    if let Some(generation) = &active {
      let keep: Vec<&str> = active.iter().chain(waiting.iter()).map(String::as_str).collect();
      let purged = self.arena.purge_except(&keep)?;
      if purged > 0 {
        info!(generation, purged, "finished interrupted purge");
      }
    }
    if let Some(waiting) = &waiting {
      info!(generation = waiting, "restored generation waiting to activate");
    }
    Ok(active)
  }

  /// Lease the active generation for the duration of one request.
  pub fn acquire_lease(&self) -> Option<ClientLease> {
    let generation = self.active_generation()?;
    Some(self.leases.acquire(&generation))
  }

  /// Cache every critical-path asset for `generation`, all or nothing,
  /// retrying with exponential backoff. Returns the number of assets cached.
  ///
  /// On failure the partial store is deleted and the active generation, if
  /// any, keeps serving.
  pub async fn install(&self, generation: &str) -> EngineResult<usize> {
    {
      let mut g = self.generations();
      if g.active.as_deref() == Some(generation) || g.waiting.as_deref() == Some(generation) {
        debug!(generation, "generation already installed");
        return Ok(0);
      }
      if g.installing.is_some() {
        return Err(EngineError::InvalidRequest(format!(
          "cannot install {} while {} is installing",
          generation,
          g.installing.as_deref().unwrap_or_default()
        )));
      }
      g.installing = Some(generation.to_string());
    }
    self.arena.reinstate(generation);
    info!(generation, assets = self.precache.len(), "installing generation");

    let mut attempt = 0u32;
    let result = loop {
      attempt += 1;
      match self.prime(generation).await {
        Ok(count) => break Ok(count),
        Err(e) => {
          if let Err(cleanup) = self.arena.destroy(CacheKind::Static, generation) {
            warn!(generation, error = %cleanup, "failed to delete partial cache");
          }
          if attempt >= self.policy.max_attempts {
            break Err(e);
          }

          let backoff = self.policy.backoff(attempt);
          warn!(
            generation,
            error = %e,
            attempt,
            max_attempts = self.policy.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            "install attempt failed, retrying"
          );
          tokio::time::sleep(backoff).await;
        }
      }
    };

    let mut g = self.generations();
    g.installing = None;
    match result {
      Ok(count) => {
        g.waiting = Some(generation.to_string());
        if let Err(e) = self.arena.storage().set_waiting_generation(generation) {
          warn!(generation, error = %e, "failed to persist waiting generation");
        }
        info!(generation, assets = count, "generation installed, waiting to activate");
        Ok(count)
      }
      Err(e) => {
        warn!(
          generation,
          error = %e,
          active = ?g.active,
          "install failed, previous generation remains active"
        );
        Err(EngineError::InstallFailed {
          generation: generation.to_string(),
          reason: e.to_string(),
        })
      }
    }
  }

  /// One install attempt: fetch everything first, write only if all succeeded.
  async fn prime(&self, generation: &str) -> EngineResult<usize> {
    let requests = self
      .precache
      .iter()
      .map(|path| self.precache_request(path))
      .collect::<EngineResult<Vec<_>>>()?;

    let responses =
      futures::future::join_all(requests.iter().map(|request| self.executor.fetch(request))).await;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(responses) {
      let response = result?;
      if !response.is_success() {
        return Err(EngineError::UpstreamError {
          status: response.status,
        });
      }
      if let Some(reason) = response.storage_rejection(self.max_body_bytes) {
        return Err(EngineError::InvalidRequest(format!(
          "{} cannot be cached: {}",
          request.url, reason
        )));
      }
      entries.push(CachedEntry::new(
        request.cache_key(),
        request.url.as_str(),
        response,
      ));
    }

    let store = self.arena.open(CacheKind::Static, generation);
    let count = entries.len();
    for entry in entries {
      store.try_put(entry).await?;
    }
    Ok(count)
  }

  /// The request a client would make for a precached path: pages are
  /// fetched as navigations so later navigations find them.
  fn precache_request(&self, path: &str) -> EngineResult<Request> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| {
        EngineError::InvalidRequest(format!("invalid precache path '{}': {}", path, e))
      })?;

    let destination = Destination::from_path(url.path());
    let is_page = destination == Destination::Document
      || (destination == Destination::Other && extension(url.path()).is_none());
    if is_page {
      Ok(Request::navigation(url))
    } else {
      Ok(Request::get(url).with_destination(destination))
    }
  }

  /// Make `generation` active and purge every other generation's caches.
  ///
  /// Calling this again for the active generation only re-runs the purge,
  /// which completes a previously interrupted one and otherwise changes
  /// nothing.
  pub fn activate(&self, generation: &str) -> EngineResult<Activation> {
    let previous = {
      let mut g = self.generations();
      let is_active = g.active.as_deref() == Some(generation);
      if !is_active && g.waiting.as_deref() != Some(generation) {
        return Err(EngineError::InvalidRequest(format!(
          "generation {} is not installed",
          generation
        )));
      }

      if is_active {
        None
      } else {
        self.arena.storage().set_active_generation(generation)?;
        g.waiting = None;
        g.superseded.retain(|s| s != generation);
        let previous = g.active.replace(generation.to_string());
        if let Some(prev) = &previous {
          g.superseded.push(prev.clone());
        }
        info!(generation, previous = ?previous, "generation activated");
        previous
      }
    };

    if let Some(prev) = &previous {
      self.arena.retire_generation(prev);
    }
    self.arena.open(CacheKind::Static, generation);
    self.arena.open(CacheKind::Dynamic, generation);

    let purged = self.arena.purge_except(&[generation])?;
    Ok(Activation {
      generation: generation.to_string(),
      previous,
      purged,
    })
  }

  /// Activate once no client of the currently active generation remains.
  /// Immediate when nothing else is serving.
  pub async fn activate_when_released(&self, generation: &str) -> EngineResult<Activation> {
    loop {
      let released = self.leases.released.notified();
      tokio::pin!(released);
      released.as_mut().enable();

      let blocking = self
        .active_generation()
        .filter(|active| active != generation)
        .filter(|active| self.leases.count(active) > 0);

      match blocking {
        Some(active) => {
          debug!(
            generation,
            active,
            clients = self.leases.count(&active),
            "waiting for clients of the active generation"
          );
          released.await;
        }
        None => return self.activate(generation),
      }
    }
  }

  /// Install `generation` and activate it once the previous one is released.
  pub async fn deploy(&self, generation: &str) -> EngineResult<Activation> {
    self.install(generation).await?;
    self.activate_when_released(generation).await
  }

  pub fn handle_control(&self, message: ControlMessage) -> EngineResult<ControlReply> {
    debug!(?message, "control message");
    match message {
      ControlMessage::ActivateNow => match self.waiting_generation() {
        Some(waiting) => {
          let activation = self.activate(&waiting)?;
          Ok(ControlReply::Activated {
            generation: activation.generation,
            purged: activation.purged,
          })
        }
        None => Ok(ControlReply::NothingWaiting {
          active: self.active_generation(),
        }),
      },
      ControlMessage::ReportVersion => Ok(ControlReply::Version {
        generation: self.active_generation(),
      }),
      ControlMessage::PurgeAll => Ok(ControlReply::Purged {
        caches: self.arena.purge_all()?,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, RefreshPool, SqliteStorage};
  use crate::http::{CacheKey, Response};
  use crate::testing::{url, CountingStorage, MockFetcher};
  use reqwest::StatusCode;

  const ORIGIN: &str = "https://portfolio.example.com";

  struct Harness {
    fetcher: Arc<MockFetcher>,
    storage: Arc<CountingStorage>,
    arena: Arc<CacheArena>,
    controller: LifecycleController,
  }

  fn controller_over(
    storage: Arc<CountingStorage>,
    fetcher: Arc<MockFetcher>,
    precache: &[&str],
  ) -> (Arc<CacheArena>, LifecycleController) {
    let arena = Arc::new(CacheArena::new(
      storage.clone(),
      "portfolio",
      Duration::from_millis(500),
    ));
    let executor = StrategyExecutor::new(
      fetcher,
      RefreshPool::new(2),
      Duration::from_millis(500),
      1024,
    );
    let controller = LifecycleController::new(
      arena.clone(),
      executor,
      url(ORIGIN),
      precache.iter().map(|p| p.to_string()).collect(),
      1024,
      InstallPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(10),
      },
    );
    (arena, controller)
  }

  fn harness(precache: &[&str]) -> Harness {
    let fetcher = MockFetcher::new();
    for path in precache {
      fetcher.respond_ok(&format!("{}{}", ORIGIN, path), path);
    }
    let storage = Arc::new(CountingStorage::new(SqliteStorage::open_in_memory().unwrap()));
    let (arena, controller) = controller_over(storage.clone(), fetcher.clone(), precache);
    Harness {
      fetcher,
      storage,
      arena,
      controller,
    }
  }

  fn generations_in(arena: &CacheArena) -> Vec<String> {
    let mut generations: Vec<String> =
      arena.list().unwrap().into_iter().map(|c| c.generation).collect();
    generations.sort();
    generations.dedup();
    generations
  }

  #[tokio::test]
  async fn test_install_primes_static_cache_and_waits() {
    let h = harness(&["/", "/offline.html", "/style-v3.css"]);

    let cached = h.controller.install("v1").await.unwrap();
    assert_eq!(cached, 3);
    assert_eq!(h.controller.state("v1"), Some(LifecycleState::Waiting));

    let store = h.arena.open(CacheKind::Static, "v1");
    let css = Request::get(url("https://portfolio.example.com/style-v3.css"));
    assert!(store.get(&css.cache_key()).await.is_some());
    // Pages are keyed like navigations
    let home = Request::navigation(url("https://portfolio.example.com/"));
    assert!(store.get(&home.cache_key()).await.is_some());
  }

  #[tokio::test]
  async fn test_first_activation_is_immediate() {
    let h = harness(&["/style-v3.css"]);
    h.controller.install("v1").await.unwrap();

    let activation = h.controller.activate_when_released("v1").await.unwrap();
    assert_eq!(activation.previous, None);
    assert_eq!(h.controller.active_generation(), Some("v1".to_string()));
    assert_eq!(h.storage.active_generation().unwrap(), Some("v1".to_string()));
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let h = harness(&["/", "/style-v3.css"]);
    h.controller.deploy("v1").await.unwrap();

    // v2 needs an asset the network cannot deliver
    h.fetcher.respond(
      reqwest::Method::GET,
      "https://portfolio.example.com/missing.js",
      Response::new(StatusCode::NOT_FOUND, ""),
    );
    let arena = h.arena.clone();
    let v2 = LifecycleController::new(
      arena.clone(),
      h.controller.executor.clone(),
      url(ORIGIN),
      vec!["/style-v3.css".to_string(), "/missing.js".to_string()],
      1024,
      InstallPolicy {
        max_attempts: 2,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(10),
      },
    );
    v2.resume().unwrap();

    let result = v2.install("v2").await;
    assert!(matches!(result, Err(EngineError::InstallFailed { .. })));
    assert_eq!(v2.active_generation(), Some("v1".to_string()));
    assert_eq!(v2.state("v2"), None);
    assert_eq!(generations_in(&arena), vec!["v1".to_string()]);
    assert_eq!(h.fetcher.calls_to("https://portfolio.example.com/missing.js"), 2);
  }

  #[tokio::test]
  async fn test_install_retries_transient_failures() {
    let h = harness(&["/style-v3.css"]);
    h.fetcher.fail_next("https://portfolio.example.com/style-v3.css", 2);

    assert_eq!(h.controller.install("v1").await.unwrap(), 1);
    assert_eq!(h.fetcher.calls(), 3);
  }

  #[tokio::test]
  async fn test_activate_twice_is_idempotent() {
    let h = harness(&["/style-v3.css"]);
    h.controller.install("v1").await.unwrap();
    h.controller.activate("v1").unwrap();

    let before = h.storage.mutations();
    let again = h.controller.activate("v1").unwrap();
    assert_eq!(again.purged, 0);
    assert_eq!(again.previous, None);
    assert_eq!(h.storage.mutations(), before);
  }

  #[tokio::test]
  async fn test_activating_new_generation_purges_old_even_when_interrupted() {
    let h = harness(&["/style-v3.css"]);
    h.controller.deploy("v1").await.unwrap();
    h.arena
      .open(CacheKind::Dynamic, "v1")
      .put(CachedEntry::new(
        CacheKey::from_stored("page".into()),
        "https://portfolio.example.com/about",
        Response::new(StatusCode::OK, "about"),
      ))
      .await;
    h.controller.install("v2").await.unwrap();

    // Crash after the first deletion
    h.storage.fail_deletes_after(Some(1));
    assert!(h.controller.activate("v2").is_err());
    assert_eq!(h.controller.active_generation(), Some("v2".to_string()));
    assert_eq!(
      generations_in(&h.arena),
      vec!["v1".to_string(), "v2".to_string()]
    );

    // Retry completes the purge and leaves v2 intact
    h.storage.fail_deletes_after(None);
    let activation = h.controller.activate("v2").unwrap();
    assert_eq!(activation.purged, 1);
    assert_eq!(generations_in(&h.arena), vec!["v2".to_string()]);
    let css = Request::get(url("https://portfolio.example.com/style-v3.css"));
    assert!(h
      .arena
      .open(CacheKind::Static, "v2")
      .get(&css.cache_key())
      .await
      .is_some());
  }

  #[tokio::test]
  async fn test_resume_finishes_interrupted_purge() {
    let h = harness(&["/style-v3.css"]);
    h.controller.deploy("v1").await.unwrap();
    h.controller.install("v2").await.unwrap();
    h.storage.fail_deletes_after(Some(0));
    assert!(h.controller.activate("v2").is_err());
    h.storage.fail_deletes_after(None);

    // Restart: a new controller over the same storage
    let (arena, restarted) = controller_over(h.storage.clone(), h.fetcher.clone(), &[]);
    assert_eq!(restarted.resume().unwrap(), Some("v2".to_string()));
    assert_eq!(generations_in(&arena), vec!["v2".to_string()]);
  }

  #[tokio::test]
  async fn test_waits_for_prior_clients_to_be_released() {
    let h = Arc::new(harness(&["/style-v3.css"]));
    h.controller.deploy("v1").await.unwrap();
    let lease = h.controller.acquire_lease().unwrap();
    assert_eq!(lease.generation(), "v1");

    h.controller.install("v2").await.unwrap();
    let waiter = {
      let h = Arc::clone(&h);
      tokio::spawn(async move { h.controller.activate_when_released("v2").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(h.controller.state("v2"), Some(LifecycleState::Waiting));
    assert_eq!(h.controller.active_generation(), Some("v1".to_string()));

    drop(lease);
    let activation = waiter.await.unwrap().unwrap();
    assert_eq!(activation.previous, Some("v1".to_string()));
    assert_eq!(h.controller.active_generation(), Some("v2".to_string()));
  }

  #[tokio::test]
  async fn test_superseded_generation_stops_writing() {
    let h = harness(&["/style-v3.css"]);
    h.controller.deploy("v1").await.unwrap();
    let old_store = h.arena.open(CacheKind::Dynamic, "v1");
    let lease = h.controller.acquire_lease().unwrap();

    h.controller.install("v2").await.unwrap();
    h.controller.handle_control(ControlMessage::ActivateNow).unwrap();

    assert_eq!(h.controller.state("v1"), Some(LifecycleState::Superseded));
    assert!(!old_store
      .put(CachedEntry::new(
        CacheKey::from_stored("late".into()),
        "https://portfolio.example.com/late",
        Response::new(StatusCode::OK, "late"),
      ))
      .await);
    assert_eq!(generations_in(&h.arena), vec!["v2".to_string()]);

    drop(lease);
    assert_eq!(h.controller.state("v1"), None);
  }

  #[tokio::test]
  async fn test_control_messages() {
    let h = harness(&["/style-v3.css"]);
    assert_eq!(
      h.controller.handle_control(ControlMessage::ActivateNow).unwrap(),
      ControlReply::NothingWaiting { active: None }
    );

    h.controller.install("v1").await.unwrap();
    assert_eq!(
      h.controller.handle_control(ControlMessage::ActivateNow).unwrap(),
      ControlReply::Activated {
        generation: "v1".to_string(),
        purged: 0
      }
    );
    assert_eq!(
      h.controller.handle_control(ControlMessage::ReportVersion).unwrap(),
      ControlReply::Version {
        generation: Some("v1".to_string())
      }
    );
    assert_eq!(
      h.controller.handle_control(ControlMessage::PurgeAll).unwrap(),
      ControlReply::Purged { caches: 2 }
    );
    assert!(h.arena.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_waiting_generation_survives_restart() {
    let h = harness(&["/style-v3.css"]);
    h.controller.deploy("v1").await.unwrap();
    h.controller.install("v2").await.unwrap();

    // Another process over the same database
    let (arena, restarted) = controller_over(h.storage.clone(), h.fetcher.clone(), &[]);
    assert_eq!(restarted.resume().unwrap(), Some("v1".to_string()));
    assert_eq!(restarted.state("v2"), Some(LifecycleState::Waiting));
    assert_eq!(
      generations_in(&arena),
      vec!["v1".to_string(), "v2".to_string()]
    );

    assert_eq!(
      restarted.handle_control(ControlMessage::ActivateNow).unwrap(),
      ControlReply::Activated {
        generation: "v2".to_string(),
        purged: 2
      }
    );
    assert_eq!(h.storage.waiting_generation().unwrap(), None);
    assert_eq!(generations_in(&arena), vec!["v2".to_string()]);
  }

  #[tokio::test]
  async fn test_reinstalling_a_superseded_generation_is_writable() {
    let h = harness(&["/style-v3.css"]);
    h.controller.deploy("v1").await.unwrap();
    h.controller.deploy("v2").await.unwrap();
    assert!(h.arena.open(CacheKind::Static, "v1").is_retired());

    // Rolling back installs v1 again from scratch
    h.controller.deploy("v1").await.unwrap();
    assert_eq!(h.controller.active_generation(), Some("v1".to_string()));
    assert_eq!(generations_in(&h.arena), vec!["v1".to_string()]);
    let css = Request::get(url("https://portfolio.example.com/style-v3.css"));
    assert!(h
      .arena
      .open(CacheKind::Static, "v1")
      .get(&css.cache_key())
      .await
      .is_some());
  }

  #[test]
  fn test_install_backoff_is_capped() {
    let policy = InstallPolicy {
      max_attempts: 100,
      backoff_base: Duration::from_secs(1),
      backoff_max: Duration::from_secs(30),
    };
    assert_eq!(policy.backoff(1), Duration::from_secs(1));
    assert_eq!(policy.backoff(3), Duration::from_secs(4));
    assert_eq!(policy.backoff(20), Duration::from_secs(30));
    assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));

    let huge = InstallPolicy {
      backoff_base: Duration::from_secs(u64::MAX / 2),
      ..policy
    };
    assert_eq!(huge.backoff(40), Duration::from_secs(30));
  }

  #[tokio::test]
  async fn test_activate_unknown_generation_is_rejected() {
    let h = harness(&[]);
    assert!(matches!(
      h.controller.activate("v9"),
      Err(EngineError::InvalidRequest(_))
    ));
  }
}
