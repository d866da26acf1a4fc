//! Core types shared by the cache stores and the strategies.

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::http::{CacheKey, Response};
use crate::sync::QUEUED_HEADER;

/// Which family of stores a cache belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
  /// Fingerprinted assets; replaced only by a new generation
  Static,
  /// API responses and pages; swept by age
  Dynamic,
}

impl CacheKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "static" => Some(Self::Static),
      "dynamic" => Some(Self::Dynamic),
      _ => None,
    }
  }
}

/// Identity of one generation-scoped cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheId {
  pub name: String,
  pub kind: CacheKind,
  pub generation: String,
}

impl CacheId {
  pub fn new(prefix: &str, kind: CacheKind, generation: &str) -> Self {
    Self {
      name: format!("{}-{}-{}", prefix, kind.as_str(), generation),
      kind,
      generation: generation.to_string(),
    }
  }
}

impl fmt::Display for CacheId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub key: CacheKey,
  /// URL the response was fetched from, kept for inspection
  pub url: String,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn new(key: CacheKey, url: impl Into<String>, response: Response) -> Self {
    Self {
      key,
      url: url.into(),
      response,
      stored_at: Utc::now(),
    }
  }
}

/// A response handed back to the host, including metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: ResponseSource,
  /// When the response was stored (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh response from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      stored_at: None,
    }
  }

  /// Stored response served without consulting the network.
  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Cache,
      stored_at: Some(entry.stored_at),
    }
  }

  /// Stored response served because the network failed.
  pub fn offline(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Offline,
      stored_at: Some(entry.stored_at),
    }
  }

  /// Designated offline page for a navigation that could not be answered.
  pub fn fallback(response: Response, stored_at: Option<DateTime<Utc>>) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
      stored_at,
    }
  }

  /// Acknowledgement for a mutation parked in the sync queue.
  pub fn queued(id: i64) -> Self {
    let body = serde_json::json!({ "queued": true, "id": id }).to_string();
    let response = Response::new(StatusCode::ACCEPTED, body)
      .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
      .with_header(QUEUED_HEADER, HeaderValue::from(id));
    Self {
      response,
      source: ResponseSource::Queued,
      stored_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Data from cache, network not consulted (or refreshing in background)
  Cache,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline page substituted for an unanswerable navigation
  Fallback,
  /// Mutation accepted into the sync queue
  Queued,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Fallback => "fallback",
      Self::Queued => "queued",
    };
    f.write_str(s)
  }
}
