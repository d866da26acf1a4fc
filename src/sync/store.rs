//! Durable storage for pending mutations.

use chrono::{DateTime, SubsecRound, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use url::Url;

use crate::cache::{format_datetime, parse_datetime, NoopStorage, SqliteStorage};
use crate::error::{EngineError, EngineResult};
use crate::http::Request;

/// A mutation about to be queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMutation {
  pub method: String,
  pub url: String,
  pub body: Option<Vec<u8>>,
  pub content_type: Option<String>,
}

impl NewMutation {
  pub fn from_request(request: &Request) -> Self {
    Self {
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      body: request.body.clone(),
      content_type: request.content_type().map(str::to_string),
    }
  }
}

/// A queued mutation. `id` order is delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMutation {
  pub id: i64,
  pub method: String,
  pub url: String,
  #[serde(skip)]
  pub body: Option<Vec<u8>>,
  pub content_type: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
}

impl PendingMutation {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> EngineResult<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| {
        EngineError::InvalidRequest(format!("invalid method '{}': {}", self.method, e))
      })?;
    let url = Url::parse(&self.url)
      .map_err(|e| EngineError::InvalidRequest(format!("invalid url '{}': {}", self.url, e)))?;

    let mut request = Request::new(method, url);
    if let Some(body) = &self.body {
      request = request.with_body(body.clone());
    }
    if let Some(content_type) = &self.content_type {
      let value = HeaderValue::from_str(content_type).map_err(|e| {
        EngineError::InvalidRequest(format!("invalid content type '{}': {}", content_type, e))
      })?;
      request = request.with_header(CONTENT_TYPE, value);
    }
    Ok(request)
  }

  pub fn body_len(&self) -> usize {
    self.body.as_ref().map(Vec::len).unwrap_or(0)
  }
}

/// Durable FIFO backing the sync queue.
pub trait QueueStorage: Send + Sync {
  /// Append a mutation, assigning the next id.
  fn push(&self, mutation: &NewMutation) -> EngineResult<PendingMutation>;

  /// Every queued mutation, oldest first.
  fn pending(&self) -> EngineResult<Vec<PendingMutation>>;

  /// Returns true if the mutation was still queued.
  fn remove(&self, id: i64) -> EngineResult<bool>;

  /// Count one failed delivery. Returns the new attempt count.
  fn record_attempt(&self, id: i64) -> EngineResult<u32>;
}

/// Without a database nothing can be queued durably, so enqueueing fails and
/// the mutation's network error reaches the caller.
impl QueueStorage for NoopStorage {
  fn push(&self, _mutation: &NewMutation) -> EngineResult<PendingMutation> {
    Err(EngineError::StorageUnavailable(
      "no durable storage for queued mutations".to_string(),
    ))
  }

  fn pending(&self) -> EngineResult<Vec<PendingMutation>> {
    Ok(Vec::new())
  }

  fn remove(&self, _id: i64) -> EngineResult<bool> {
    Ok(false)
  }

  fn record_attempt(&self, _id: i64) -> EngineResult<u32> {
    Ok(0)
  }
}

impl QueueStorage for SqliteStorage {
  fn push(&self, mutation: &NewMutation) -> EngineResult<PendingMutation> {
    // Stored with microsecond precision; return exactly what a reload sees
    let enqueued_at = Utc::now().trunc_subsecs(6);
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO sync_queue (method, url, body, content_type, enqueued_at, attempts)
       VALUES (?, ?, ?, ?, ?, 0)",
      params![
        mutation.method,
        mutation.url,
        mutation.body,
        mutation.content_type,
        format_datetime(enqueued_at)
      ],
    )?;

    Ok(PendingMutation {
      id: conn.last_insert_rowid(),
      method: mutation.method.clone(),
      url: mutation.url.clone(),
      body: mutation.body.clone(),
      content_type: mutation.content_type.clone(),
      enqueued_at,
      attempts: 0,
    })
  }

  fn pending(&self) -> EngineResult<Vec<PendingMutation>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, method, url, body, content_type, enqueued_at, attempts
       FROM sync_queue ORDER BY id",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<Vec<u8>>>(3)?,
          row.get::<_, Option<String>>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, u32>(6)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows
      .into_iter()
      .map(
        |(id, method, url, body, content_type, enqueued_at, attempts)| {
          Ok(PendingMutation {
            id,
            method,
            url,
            body,
            content_type,
            enqueued_at: parse_datetime(&enqueued_at)?,
            attempts,
          })
        },
      )
      .collect()
  }

  fn remove(&self, id: i64) -> EngineResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
    Ok(removed > 0)
  }

  fn record_attempt(&self, id: i64) -> EngineResult<u32> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?",
      params![id],
    )?;
    let attempts: Option<u32> = conn
      .query_row(
        "SELECT attempts FROM sync_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(attempts.unwrap_or(0))
  }
}
