//! Inbound control channel messages.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Force the waiting generation to activate
  ActivateNow,
  /// Reply with the active generation tag
  ReportVersion,
  /// Clear every store regardless of generation
  PurgeAll,
}

impl FromStr for ControlMessage {
  type Err = String;

  /// Accepts a bare tag (`PURGE_ALL`) or a JSON message (`{"type":"PURGE_ALL"}`).
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.starts_with('{') {
      return serde_json::from_str(s).map_err(|e| format!("invalid control message: {}", e));
    }
    match s.to_ascii_uppercase().as_str() {
      "ACTIVATE_NOW" => Ok(Self::ActivateNow),
      "REPORT_VERSION" => Ok(Self::ReportVersion),
      "PURGE_ALL" => Ok(Self::PurgeAll),
      other => Err(format!("unknown control message '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  Activated {
    generation: String,
    purged: usize,
  },
  /// ACTIVATE_NOW with no generation waiting
  NothingWaiting {
    active: Option<String>,
  },
  Version {
    generation: Option<String>,
  },
  Purged {
    caches: usize,
  },
}
