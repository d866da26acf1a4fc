//! Entry point for intercepted requests.

use std::sync::Arc;

use reqwest::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{
  CacheArena, CacheKind, CacheStore, ResponseSource, Served, Strategy, StrategyExecutor,
};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::EngineResult;
use crate::http::{Request, Response};
use crate::lifecycle::LifecycleController;
use crate::route::{RouteCategory, RouteClassifier};
use crate::sync::SyncQueue;

/// Built-in page for navigations that can be answered neither by the network
/// nor by a cached offline page.
const OFFLINE_HTML: &str = "<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"utf-8\"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available offline. Check your connection and try again.</p>
</body>
</html>
";

/// What the host should do with an intercepted request.
#[derive(Debug, Clone)]
pub enum Interception {
  Respond(Served),
  /// Let the request go to the network untouched
  PassThrough,
}

/// Classifies each request, runs the strategy for its category against the
/// active generation's stores, and parks mutations made while offline.
///
/// Cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct InterceptionDispatcher {
  classifier: Arc<RouteClassifier>,
  arena: Arc<CacheArena>,
  lifecycle: Arc<LifecycleController>,
  executor: StrategyExecutor,
  sync: Arc<SyncQueue>,
  connectivity: Arc<ConnectivityMonitor>,
  offline_page: Option<Url>,
}

impl InterceptionDispatcher {
  pub fn new(
    classifier: Arc<RouteClassifier>,
    arena: Arc<CacheArena>,
    lifecycle: Arc<LifecycleController>,
    executor: StrategyExecutor,
    sync: Arc<SyncQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    offline_page: Option<Url>,
  ) -> Self {
    Self {
      classifier,
      arena,
      lifecycle,
      executor,
      sync,
      connectivity,
      offline_page,
    }
  }

  pub async fn handle(&self, request: Request) -> EngineResult<Interception> {
    if !matches!(request.url.scheme(), "http" | "https") {
      debug!(url = %request.url, "not an http(s) request, passing through");
      return Ok(Interception::PassThrough);
    }
    if request.forbids_storage() {
      debug!(url = %request.url, "no-store request, passing through");
      return Ok(Interception::PassThrough);
    }

    let lease = self.lifecycle.acquire_lease();
    let generation = lease.as_ref().map(|l| l.generation().to_string());

    if request.is_mutation() {
      return self.mutate(&request).await.map(Interception::Respond);
    }

    let decision = self.classifier.classify(&request).decision();
    let store = match (decision.cache, &generation) {
      (Some(kind), Some(generation)) => Some(self.arena.open(kind, generation)),
      _ => None,
    };
    // Opened now so a cutover during the fetch cannot reopen a purged store
    let offline_store = match (decision.category, &generation) {
      (RouteCategory::Navigation, Some(generation)) => {
        Some(self.arena.open(CacheKind::Static, generation))
      }
      _ => None,
    };
    debug!(
      url = %request.url,
      category = ?decision.category,
      strategy = ?decision.strategy,
      generation = ?generation,
      "intercepted request"
    );

    let result = match self
      .executor
      .execute(decision.strategy, store.as_ref(), &request)
      .await
    {
      Err(e) if !e.is_network() => {
        warn!(url = %request.url, error = %e, "strategy failed, falling back to network");
        self
          .executor
          .execute(Strategy::NetworkWithFallback, store.as_ref(), &request)
          .await
      }
      other => other,
    };
    self.observe(&request, &result);

    match result {
      Ok(served) => Ok(Interception::Respond(served)),
      Err(e) if decision.category == RouteCategory::Navigation && e.is_network() => {
        debug!(url = %request.url, error = %e, "navigation failed, serving offline page");
        let served = self.offline_fallback(&request, offline_store.as_ref()).await;
        Ok(Interception::Respond(served))
      }
      Err(e) => Err(e),
    }
  }

  /// Mutations always go to the network. If the request could not be sent
  /// at all it is queued for replay and acknowledged with 202 Accepted.
  ///
  /// A timed-out or interrupted mutation may already have been processed,
  /// so it is returned to the caller instead of being queued.
  async fn mutate(&self, request: &Request) -> EngineResult<Served> {
    match self.executor.fetch(request).await {
      Ok(response) => {
        self.report(request, Connectivity::Online);
        Ok(Served::from_network(response))
      }
      Err(e) if e.is_unsent() => {
        self.report(request, Connectivity::Offline);
        let queued = self.sync.enqueue(request).map_err(|storage| {
          warn!(url = %request.url, error = %storage, "cannot queue mutation");
          e.clone()
        })?;
        Ok(Served::queued(queued.id))
      }
      Err(e) => {
        if e.is_transient() {
          self.report(request, Connectivity::Offline);
          warn!(url = %request.url, error = %e, "mutation outcome unknown, not queued");
        }
        Err(e)
      }
    }
  }

  /// 1. The page itself, if it was precached
  /// 2. The cached offline page
  /// 3. The built-in offline page
  async fn offline_fallback(&self, request: &Request, store: Option<&CacheStore>) -> Served {
    let Some(store) = store else {
      return Served::fallback(builtin_offline_page(), None);
    };

    if let Some(entry) = store.get(&request.cache_key()).await {
      return Served::offline(entry);
    }
    if let Some(page) = &self.offline_page {
      if let Some(entry) = store.get(&Request::navigation(page.clone()).cache_key()).await {
        return Served::fallback(entry.response, Some(entry.stored_at));
      }
    }
    Served::fallback(builtin_offline_page(), None)
  }

  /// Feed same-origin request outcomes to the connectivity monitor.
  fn observe(&self, request: &Request, result: &EngineResult<Served>) {
    match result {
      Ok(served) if served.source == ResponseSource::Network => {
        self.report(request, Connectivity::Online)
      }
      Ok(served) if served.source == ResponseSource::Offline => {
        self.report(request, Connectivity::Offline)
      }
      Err(e) if e.is_transient() => self.report(request, Connectivity::Offline),
      _ => {}
    }
  }

  fn report(&self, request: &Request, observed: Connectivity) {
    if self.classifier.is_same_origin(&request.url) {
      self.connectivity.report(observed);
    }
  }
}

fn builtin_offline_page() -> Response {
  Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_HTML)
    .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
    .with_header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
}
