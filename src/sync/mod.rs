//! Durable queue of mutations made while offline, replayed in order once
//! connectivity returns.

mod store;

pub use store::{NewMutation, PendingMutation, QueueStorage};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderName;
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::StrategyExecutor;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{EngineError, EngineResult};
use crate::http::{Request, Response};

/// Header carrying the queue id on a synthetic "queued" response.
pub const QUEUED_HEADER: HeaderName = HeaderName::from_static("x-offgrid-queued");

#[derive(Debug, Clone)]
pub struct SyncPolicy {
  /// Deliveries attempted before a mutation is rejected
  pub max_attempts: u32,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
}

impl SyncPolicy {
  /// Exponential backoff after `attempts` failed deliveries, capped.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    self
      .backoff_base
      .saturating_mul(1u32 << exponent)
      .min(self.backoff_max)
  }
}

impl From<&SyncConfig> for SyncPolicy {
  fn from(config: &SyncConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      backoff_base: Duration::from_millis(config.backoff_base_ms),
      backoff_max: Duration::from_secs(config.backoff_max_secs),
    }
  }
}

/// A mutation dropped from the queue without being delivered.
#[derive(Debug, Clone)]
pub struct RejectedMutation {
  pub mutation: PendingMutation,
  /// Always [`EngineError::QueuePermanentFailure`]
  pub error: EngineError,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReport {
  /// Another drain was in progress; nothing was delivered
  AlreadyRunning,
  /// The queue was emptied
  Drained { delivered: usize, rejected: usize },
  /// A transient failure stopped the pass; `remaining` entries stay queued
  Halted {
    delivered: usize,
    rejected: usize,
    remaining: usize,
    retry_after: Duration,
  },
}

enum Delivery {
  Delivered(StatusCode),
  Transient(String),
  Permanent(String),
}

impl Delivery {
  fn of(result: EngineResult<Response>) -> Self {
    match result {
      Ok(response) => {
        let status = response.status;
        if status.is_success() || status.is_redirection() {
          Self::Delivered(status)
        } else if status.is_server_error()
          || status.is_informational()
          // 408 Request Timeout, 425 Too Early, 429 Too Many Requests
          || matches!(status.as_u16(), 408 | 425 | 429)
        {
          Self::Transient(format!("upstream returned {}", status))
        } else {
          Self::Permanent(format!("upstream rejected with {}", status))
        }
      }
      Err(e) if e.is_transient() => Self::Transient(e.to_string()),
      Err(e) => Self::Permanent(e.to_string()),
    }
  }
}

/// Strict FIFO replay of queued mutations.
///
/// Storage is the source of truth: every drain reads the queue afresh, so
/// entries persisted before a restart are delivered by the first drain after it.
pub struct SyncQueue {
  storage: Arc<dyn QueueStorage>,
  executor: StrategyExecutor,
  policy: SyncPolicy,
  draining: tokio::sync::Mutex<()>,
  rejections: Mutex<Option<mpsc::UnboundedSender<RejectedMutation>>>,
  enqueued: Notify,
}

impl SyncQueue {
  pub fn new(
    storage: Arc<dyn QueueStorage>,
    executor: StrategyExecutor,
    policy: SyncPolicy,
  ) -> Self {
    Self {
      storage,
      executor,
      policy,
      draining: tokio::sync::Mutex::new(()),
      rejections: Mutex::new(None),
      enqueued: Notify::new(),
    }
  }

  pub fn policy(&self) -> &SyncPolicy {
    &self.policy
  }

  /// Receive every mutation dropped as permanently failed from now on.
  /// A later subscription replaces the earlier one.
  pub fn subscribe_rejections(&self) -> mpsc::UnboundedReceiver<RejectedMutation> {
    let (tx, rx) = mpsc::unbounded_channel();
    *self.rejections.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    rx
  }

  /// Durably append a mutation that could not be delivered.
  pub fn enqueue(&self, request: &Request) -> EngineResult<PendingMutation> {
    let queued = self.storage.push(&NewMutation::from_request(request))?;
    info!(
      id = queued.id,
      method = %queued.method,
      url = %queued.url,
      "queued mutation for replay"
    );
    self.enqueued.notify_one();
    Ok(queued)
  }

  pub fn pending(&self) -> EngineResult<Vec<PendingMutation>> {
    self.storage.pending()
  }

  /// Read the persisted queue. Returns the number of pending mutations.
  pub fn load(&self) -> EngineResult<usize> {
    let pending = self.storage.pending()?.len();
    if pending > 0 {
      info!(pending, "restored queued mutations");
    }
    Ok(pending)
  }

  /// Deliver queued mutations oldest first.
  ///
  /// 1. Delivered (2xx/3xx) - removed
  /// 2. Permanent failure (other 4xx) - removed and reported as rejected
  /// 3. Transient failure (offline, timeout, 408, 425, 429, 5xx) - attempt
  ///    counted, pass halts so nothing later overtakes it
  /// 4. Attempts exhausted - removed and reported, pass halts
  pub async fn drain(&self) -> EngineResult<DrainReport> {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("drain already in progress");
      return Ok(DrainReport::AlreadyRunning);
    };

    let pending = self.storage.pending()?;
    if pending.is_empty() {
      return Ok(DrainReport::Drained {
        delivered: 0,
        rejected: 0,
      });
    }
    debug!(pending = pending.len(), "draining sync queue");

    let mut delivered = 0;
    let mut rejected = 0;
    for (index, mutation) in pending.iter().enumerate() {
      let outcome = match mutation.to_request() {
        Ok(request) => Delivery::of(self.executor.fetch(&request).await),
        Err(e) => Delivery::Permanent(e.to_string()),
      };

      match outcome {
        Delivery::Delivered(status) => {
          self.storage.remove(mutation.id)?;
          delivered += 1;
          info!(
            id = mutation.id,
            method = %mutation.method,
            url = %mutation.url,
            status = status.as_u16(),
            "delivered queued mutation"
          );
        }
        Delivery::Permanent(reason) => {
          self.reject(mutation, reason)?;
          rejected += 1;
        }
        Delivery::Transient(reason) => {
          let attempts = self.storage.record_attempt(mutation.id)?;
          let mut remaining = pending.len() - index;
          if attempts >= self.policy.max_attempts {
            self.reject(
              mutation,
              format!("gave up after {} attempts: {}", attempts, reason),
            )?;
            rejected += 1;
            remaining -= 1;
          }

          let retry_after = self.policy.backoff(attempts);
          warn!(
            id = mutation.id,
            url = %mutation.url,
            attempts,
            remaining,
            retry_after_ms = retry_after.as_millis() as u64,
            reason = %reason,
            "delivery failed, halting drain"
          );
          return Ok(DrainReport::Halted {
            delivered,
            rejected,
            remaining,
            retry_after,
          });
        }
      }
    }

    info!(delivered, rejected, "sync queue drained");
    Ok(DrainReport::Drained {
      delivered,
      rejected,
    })
  }

  fn reject(&self, mutation: &PendingMutation, reason: String) -> EngineResult<()> {
    self.storage.remove(mutation.id)?;
    warn!(
      id = mutation.id,
      method = %mutation.method,
      url = %mutation.url,
      reason = %reason,
      "dropping queued mutation"
    );

    let rejection = RejectedMutation {
      mutation: mutation.clone(),
      error: EngineError::QueuePermanentFailure {
        id: mutation.id,
        reason,
      },
    };
    let mut rejections = self.rejections.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(tx) = rejections.as_ref() {
      if tx.send(rejection).is_err() {
        *rejections = None;
      }
    }
    Ok(())
  }

  /// Drain on every transition to online, then again after each backoff
  /// delay while online and entries remain. Stops when the connectivity
  /// channel closes.
  pub fn spawn_replay(
    self: Arc<Self>,
    mut connectivity: watch::Receiver<Connectivity>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        let online = *connectivity.borrow_and_update() == Connectivity::Online;
        let mut retry_after = None;
        if online {
          match self.drain().await {
            Ok(DrainReport::Halted {
              retry_after: delay, ..
            }) => retry_after = Some(delay),
            Ok(report) => debug!(?report, "replay pass finished"),
            Err(e) => {
              warn!(error = %e, "replay failed");
              retry_after = Some(self.policy.backoff_base);
            }
          }
        }

        tokio::select! {
          changed = connectivity.changed() => {
            if changed.is_err() {
              debug!("connectivity channel closed, stopping replay");
              break;
            }
          }
          // Enqueued while we believed we were online: give the network a moment
          _ = self.enqueued.notified(), if online => {
            tokio::time::sleep(self.policy.backoff_base).await;
          }
          _ = tokio::time::sleep(retry_after.unwrap_or_default()),
            if online && retry_after.is_some() => {}
        }
      }
    })
  }
}
