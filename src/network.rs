//! Network access behind a trait, with a `reqwest` implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::http::{Request, Response};

/// User agent for outbound requests.
const USER_AGENT_VALUE: &str = concat!("offgrid/", env!("CARGO_PKG_VERSION"));

/// Issues real network calls.
///
/// Implementations report connectivity problems as `NetworkUnavailable` when
/// the request never left, otherwise as `NetworkTimeout` or
/// `NetworkInterrupted`. Any HTTP status, including 4xx/5xx, is a successful
/// fetch; deciding what a status means is up to the caller.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> EngineResult<Response>;
}

/// Fetcher backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
  timeout: Duration,
}

impl ReqwestFetcher {
  pub fn new(timeout: Duration) -> EngineResult<Self> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .default_headers(default_headers)
      .build()
      .map_err(|e| {
        EngineError::NetworkUnavailable(format!("failed to create HTTP client: {}", e))
      })?;

    Ok(Self { client, timeout })
  }

  fn map_send_error(&self, e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
      EngineError::NetworkTimeout(self.timeout)
    } else if e.is_connect() || e.is_builder() {
      EngineError::NetworkUnavailable(e.to_string())
    } else {
      EngineError::NetworkInterrupted(e.to_string())
    }
  }

  /// The request was sent and answered; only reading the body failed.
  fn map_body_error(&self, e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
      EngineError::NetworkTimeout(self.timeout)
    } else {
      EngineError::NetworkInterrupted(e.to_string())
    }
  }
}

#[async_trait]
impl NetworkFetcher for ReqwestFetcher {
  async fn fetch(&self, request: &Request) -> EngineResult<Response> {
    debug!(method = %request.method, url = %request.url, "network fetch");

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
    let status = response.status();
    let redirected = response.url() != &request.url;
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| self.map_body_error(e))?;

    debug!(
      url = %request.url,
      status = status.as_u16(),
      bytes = body.len(),
      content_type = ?headers.get(CONTENT_TYPE),
      "network response"
    );

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
      redirected,
    })
  }
}
