use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures the engine distinguishes when deciding how to answer a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Network request timed out after {0:?}")]
  NetworkTimeout(Duration),

  /// The connection failed after the request was sent; it may have been
  /// processed.
  #[error("Network connection lost: {0}")]
  NetworkInterrupted(String),

  #[error("Upstream responded with {status}")]
  UpstreamError { status: StatusCode },

  #[error("Cache storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Mutation {id} permanently rejected: {reason}")]
  QueuePermanentFailure { id: i64, reason: String },

  #[error("Installation of generation {generation} failed: {reason}")]
  InstallFailed { generation: String, reason: String },

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
  /// Failures worth retrying later: the network may come back.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::NetworkUnavailable(_) | Self::NetworkTimeout(_) | Self::NetworkInterrupted(_)
    )
  }

  /// The request never reached the network, so sending it again cannot
  /// deliver it twice.
  pub fn is_unsent(&self) -> bool {
    matches!(self, Self::NetworkUnavailable(_))
  }

  /// Failures that originate from the network or the backend rather than
  /// from the engine itself.
  pub fn is_network(&self) -> bool {
    matches!(
      self,
      Self::NetworkUnavailable(_)
        | Self::NetworkTimeout(_)
        | Self::NetworkInterrupted(_)
        | Self::UpstreamError { .. }
    )
  }
}

impl From<rusqlite::Error> for EngineError {
  fn from(e: rusqlite::Error) -> Self {
    Self::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for EngineError {
  fn from(e: serde_json::Error) -> Self {
    Self::StorageUnavailable(format!("Failed to (de)serialize stored value: {}", e))
  }
}
