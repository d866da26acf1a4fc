//! Online/offline tracking for the origin.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::http::Request;
use crate::network::NetworkFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  Offline,
}

/// Probes the origin periodically and publishes transitions on a watch
/// channel. Request outcomes observed elsewhere can be reported too.
pub struct ConnectivityMonitor {
  fetcher: Arc<dyn NetworkFetcher>,
  probe_url: Url,
  interval: Duration,
  timeout: Duration,
  state: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
  pub fn new(
    fetcher: Arc<dyn NetworkFetcher>,
    probe_url: Url,
    interval: Duration,
    timeout: Duration,
    initial: Connectivity,
  ) -> Self {
    let (state, _) = watch::channel(initial);
    Self {
      fetcher,
      probe_url,
      interval,
      timeout,
      state,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  pub fn current(&self) -> Connectivity {
    *self.state.borrow()
  }

  /// Publish an observed state. Returns whether it changed.
  pub fn report(&self, observed: Connectivity) -> bool {
    let changed = self.state.send_if_modified(|current| {
      if *current == observed {
        false
      } else {
        *current = observed;
        true
      }
    });
    if changed {
      info!(state = ?observed, "connectivity changed");
    }
    changed
  }

  /// Any HTTP response from the origin counts as online.
  pub async fn probe(&self) -> Connectivity {
    let request = Request::new(Method::HEAD, self.probe_url.clone());
    let observed = match tokio::time::timeout(self.timeout, self.fetcher.fetch(&request)).await {
      Ok(Ok(response)) => {
        debug!(status = response.status.as_u16(), "origin reachable");
        Connectivity::Online
      }
      Ok(Err(e)) => {
        debug!(error = %e, "origin unreachable");
        Connectivity::Offline
      }
      Err(_) => {
        debug!(timeout_ms = self.timeout.as_millis() as u64, "origin probe timed out");
        Connectivity::Offline
      }
    };
    self.report(observed);
    observed
  }

  pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        self.probe().await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{url, MockFetcher};

  fn monitor(fetcher: Arc<MockFetcher>) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
      fetcher,
      url("https://portfolio.example.com/"),
      Duration::from_secs(60),
      Duration::from_millis(200),
      Connectivity::Online,
    )
  }

  #[tokio::test]
  async fn test_probe_publishes_transitions() {
    let fetcher = MockFetcher::new();
    let monitor = monitor(fetcher.clone());
    let mut rx = monitor.subscribe();

    // A 404 still proves the origin is reachable
    assert_eq!(monitor.probe().await, Connectivity::Online);
    assert!(!rx.has_changed().unwrap());

    fetcher.set_offline(true);
    assert_eq!(monitor.probe().await, Connectivity::Offline);
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), Connectivity::Offline);
    assert_eq!(fetcher.requests()[0].method, Method::HEAD);
  }

  #[tokio::test]
  async fn test_slow_probe_counts_as_offline() {
    let fetcher = MockFetcher::new();
    fetcher.set_delay(Duration::from_secs(2));
    let monitor = monitor(fetcher);

    assert_eq!(monitor.probe().await, Connectivity::Offline);
    assert_eq!(monitor.current(), Connectivity::Offline);
  }

  #[test]
  fn test_report_ignores_repeated_state() {
    let monitor = monitor(MockFetcher::new());
    assert!(!monitor.report(Connectivity::Online));
    assert!(monitor.report(Connectivity::Offline));
    assert!(!monitor.report(Connectivity::Offline));
  }
}
