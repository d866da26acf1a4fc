//! Caching strategies that combine the cache stores with network fetching.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::arena::CacheStore;
use super::refresh::RefreshPool;
use super::traits::{CachedEntry, Served};
use crate::error::{EngineError, EngineResult};
use crate::http::{Request, Response};
use crate::network::NetworkFetcher;

/// A named algorithm for answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkWithFallback,
}

/// Executes strategies over a cache store and the network.
///
/// Cheap to clone; background refreshes carry their own clone.
#[derive(Clone)]
pub struct StrategyExecutor {
  fetcher: Arc<dyn NetworkFetcher>,
  refresh: RefreshPool,
  network_timeout: Duration,
  max_body_bytes: usize,
}

impl StrategyExecutor {
  pub fn new(
    fetcher: Arc<dyn NetworkFetcher>,
    refresh: RefreshPool,
    network_timeout: Duration,
    max_body_bytes: usize,
  ) -> Self {
    Self {
      fetcher,
      refresh,
      network_timeout,
      max_body_bytes,
    }
  }

  pub fn refresh_pool(&self) -> &RefreshPool {
    &self.refresh
  }

  /// Answer `request` with `strategy`. Without a store every strategy reduces
  /// to a plain network call.
  pub async fn execute(
    &self,
    strategy: Strategy,
    cache: Option<&CacheStore>,
    request: &Request,
  ) -> EngineResult<Served> {
    let Some(cache) = cache else {
      return self.fetch(request).await.map(Served::from_network);
    };

    match strategy {
      Strategy::CacheFirst => self.cache_first(cache, request).await,
      Strategy::NetworkFirst => self.network_first(cache, request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(cache, request).await,
      Strategy::NetworkWithFallback => self.network_with_fallback(cache, request).await,
    }
  }

  /// Network call bounded by the configured timeout.
  pub async fn fetch(&self, request: &Request) -> EngineResult<Response> {
    match tokio::time::timeout(self.network_timeout, self.fetcher.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(EngineError::NetworkTimeout(self.network_timeout)),
    }
  }

  /// 1. Stored hit - return immediately, no network call
  /// 2. Miss - fetch, store on success
  /// 3. Network failure propagates
  async fn cache_first(&self, cache: &CacheStore, request: &Request) -> EngineResult<Served> {
    if let Some(entry) = self.lookup(cache, request).await {
      debug!(url = %request.url, cache = %cache.id(), "cache hit");
      return Ok(Served::from_cache(entry));
    }

    debug!(url = %request.url, cache = %cache.id(), "cache miss");
    let response = self.fetch(request).await?;
    self.store(cache, request, &response).await;
    Ok(Served::from_network(response))
  }

  /// 1. Fetch - store on success
  /// 2. On network failure, return the stored entry (offline mode)
  async fn network_first(&self, cache: &CacheStore, request: &Request) -> EngineResult<Served> {
    match self.fetch(request).await {
      Ok(response) => {
        self.store(cache, request, &response).await;
        Ok(Served::from_network(response))
      }
      Err(e) => self.offline_or(cache, request, e).await,
    }
  }

  /// 1. Stored hit - return immediately, refresh in the background
  /// 2. Miss - behave like network-first
  async fn stale_while_revalidate(
    &self,
    cache: &CacheStore,
    request: &Request,
  ) -> EngineResult<Served> {
    let Some(entry) = self.lookup(cache, request).await else {
      return self.network_first(cache, request).await;
    };

    let executor = self.clone();
    let store = cache.clone();
    let refresh_request = request.clone();
    self.refresh.submit(request.cache_key(), async move {
      match executor.fetch(&refresh_request).await {
        Ok(response) => {
          executor.store(&store, &refresh_request, &response).await;
        }
        Err(e) => {
          warn!(url = %refresh_request.url, error = %e, "background refresh failed");
        }
      }
    });

    Ok(Served::from_cache(entry))
  }

  /// Network without storing; stored entry only when the network fails.
  async fn network_with_fallback(
    &self,
    cache: &CacheStore,
    request: &Request,
  ) -> EngineResult<Served> {
    match self.fetch(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(e) => self.offline_or(cache, request, e).await,
    }
  }

  async fn offline_or(
    &self,
    cache: &CacheStore,
    request: &Request,
    error: EngineError,
  ) -> EngineResult<Served> {
    match self.lookup(cache, request).await {
      Some(entry) => {
        debug!(url = %request.url, error = %error, "network failed, serving stored entry");
        Ok(Served::offline(entry))
      }
      None => Err(error),
    }
  }

  async fn lookup(&self, cache: &CacheStore, request: &Request) -> Option<CachedEntry> {
    if request.is_mutation() {
      return None;
    }
    cache.get(&request.cache_key()).await
  }

  /// Store a network response if it is storable: GET, 2xx, not redirected,
  /// within the size ceiling.
  async fn store(&self, cache: &CacheStore, request: &Request, response: &Response) -> bool {
    if request.method != reqwest::Method::GET || request.forbids_storage() {
      return false;
    }
    if let Some(reason) = response.storage_rejection(self.max_body_bytes) {
      debug!(url = %request.url, status = response.status.as_u16(), reason, "not storing response");
      return false;
    }

    let entry = CachedEntry::new(request.cache_key(), request.url.as_str(), response.clone());
    cache.put(entry).await
  }
}
