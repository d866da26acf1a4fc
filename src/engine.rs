//! Wires the engine's components together from configuration.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheArena, CacheId, CacheKind, CacheStorage, NoopStorage, RefreshPool, SqliteStorage,
  StrategyExecutor,
};
use crate::config::Config;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::control::{ControlMessage, ControlReply};
use crate::dispatcher::{Interception, InterceptionDispatcher};
use crate::error::EngineResult;
use crate::http::Request;
use crate::lifecycle::{Activation, InstallPolicy, LifecycleController};
use crate::network::{NetworkFetcher, ReqwestFetcher};
use crate::route::RouteClassifier;
use crate::sync::{
  DrainReport, PendingMutation, QueueStorage, RejectedMutation, SyncPolicy, SyncQueue,
};

/// A fully wired engine.
pub struct Engine {
  config: Config,
  arena: Arc<CacheArena>,
  lifecycle: Arc<LifecycleController>,
  sync: Arc<SyncQueue>,
  connectivity: Arc<ConnectivityMonitor>,
  dispatcher: InterceptionDispatcher,
}

impl Engine {
  /// Open the database and build the engine around the `reqwest` fetcher.
  ///
  /// If the database cannot be opened the engine still runs, network-only,
  /// with nothing cached or queued.
  pub fn open(config: Config) -> Result<Self> {
    let fetcher = Arc::new(ReqwestFetcher::new(config.limits.network_timeout())?);
    let path = config.database_path()?;

    let (cache, queue): (Arc<dyn CacheStorage>, Arc<dyn QueueStorage>) =
      match SqliteStorage::open(&path) {
        Ok(storage) => {
          debug!(path = %path.display(), "opened database");
          let storage = Arc::new(storage);
          (storage.clone(), storage)
        }
        Err(e) => {
          warn!(path = %path.display(), error = %e, "database unavailable, running network-only");
          (Arc::new(NoopStorage), Arc::new(NoopStorage))
        }
      };

    Self::with_parts(config, cache, queue, fetcher)
  }

  pub fn with_parts(
    config: Config,
    cache: Arc<dyn CacheStorage>,
    queue: Arc<dyn QueueStorage>,
    fetcher: Arc<dyn NetworkFetcher>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let limits = &config.limits;

    let executor = StrategyExecutor::new(
      Arc::clone(&fetcher),
      RefreshPool::new(config.refresh_pool_size),
      limits.network_timeout(),
      limits.max_body_bytes,
    );
    let arena = Arc::new(CacheArena::new(
      cache,
      config.cache_prefix.clone(),
      limits.cache_read_timeout(),
    ));
    let lifecycle = Arc::new(LifecycleController::new(
      Arc::clone(&arena),
      executor.clone(),
      origin.clone(),
      config.precache.clone(),
      limits.max_body_bytes,
      InstallPolicy {
        max_attempts: config.install.max_attempts,
        backoff_base: Duration::from_millis(config.install.backoff_base_ms),
        backoff_max: Duration::from_secs(config.install.backoff_max_secs),
      },
    ));
    let sync = Arc::new(SyncQueue::new(
      queue,
      executor.clone(),
      SyncPolicy::from(&config.sync),
    ));
    let connectivity = Arc::new(ConnectivityMonitor::new(
      fetcher,
      origin.clone(),
      Duration::from_secs(config.sync.probe_interval_secs.max(1)),
      limits.network_timeout(),
      Connectivity::Online,
    ));
    let offline_page = match &config.offline_page {
      Some(path) => Some(
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid offline page '{}': {}", path, e))?,
      ),
      None => None,
    };

    let dispatcher = InterceptionDispatcher::new(
      Arc::new(RouteClassifier::new(&origin, &config.routes)),
      Arc::clone(&arena),
      Arc::clone(&lifecycle),
      executor,
      Arc::clone(&sync),
      Arc::clone(&connectivity),
      offline_page,
    );

    Ok(Self {
      config,
      arena,
      lifecycle,
      sync,
      connectivity,
      dispatcher,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn dispatcher(&self) -> &InterceptionDispatcher {
    &self.dispatcher
  }

  pub fn lifecycle(&self) -> &Arc<LifecycleController> {
    &self.lifecycle
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  /// Restore the active generation, finish an interrupted purge and load the
  /// persisted sync queue.
  pub fn resume(&self) -> EngineResult<Option<String>> {
    let active = self.lifecycle.resume()?;
    self.sync.load()?;
    Ok(active)
  }

  /// Install the configured generation and activate it once the previous
  /// generation has no clients left.
  pub async fn deploy(&self) -> EngineResult<Activation> {
    self.lifecycle.deploy(&self.config.generation).await
  }

  pub async fn handle(&self, request: Request) -> EngineResult<Interception> {
    self.dispatcher.handle(request).await
  }

  pub fn control(&self, message: ControlMessage) -> EngineResult<ControlReply> {
    self.lifecycle.handle_control(message)
  }

  pub async fn drain(&self) -> EngineResult<DrainReport> {
    self.sync.drain().await
  }

  pub fn pending(&self) -> EngineResult<Vec<PendingMutation>> {
    self.sync.pending()
  }

  pub fn subscribe_rejections(&self) -> mpsc::UnboundedReceiver<RejectedMutation> {
    self.sync.subscribe_rejections()
  }

  /// Every cache with its entry count.
  pub fn caches(&self) -> EngineResult<Vec<(CacheId, usize)>> {
    let storage = self.arena.storage();
    self
      .arena
      .list()?
      .into_iter()
      .map(|cache| {
        let entries = storage.entry_count(&cache)?;
        Ok((cache, entries))
      })
      .collect()
  }

  /// Remove expired entries from the active generation's dynamic cache.
  pub async fn sweep(&self) -> usize {
    sweep_active(&self.arena, &self.lifecycle, &self.config).await
  }

  pub fn spawn_sweeper(&self) -> JoinHandle<()> {
    let arena = Arc::clone(&self.arena);
    let lifecycle = Arc::clone(&self.lifecycle);
    let config = self.config.clone();
    tokio::spawn(async move {
      let period = config.limits.sweep_interval().max(Duration::from_secs(1));
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        sweep_active(&arena, &lifecycle, &config).await;
      }
    })
  }

  /// Sweeper, connectivity probe and sync replay.
  pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
    info!(
      origin = %self.config.origin,
      generation = ?self.lifecycle.active_generation(),
      "starting background tasks"
    );
    vec![
      self.spawn_sweeper(),
      Arc::clone(&self.connectivity).spawn(),
      Arc::clone(&self.sync).spawn_replay(self.connectivity.subscribe()),
    ]
  }
}

async fn sweep_active(
  arena: &CacheArena,
  lifecycle: &LifecycleController,
  config: &Config,
) -> usize {
  match lifecycle.active_generation() {
    Some(generation) => {
      arena
        .open(CacheKind::Dynamic, &generation)
        .sweep_expired(config.limits.dynamic_max_age())
        .await
    }
    None => 0,
  }
}
