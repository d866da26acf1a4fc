//! Request and response values exchanged with the host networking layer.

use std::fmt;
use std::str::FromStr;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Resource type the host declared for an intercepted request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  Fetch,
  #[default]
  Other,
}

impl Destination {
  /// Guess the destination from a path's file extension.
  pub fn from_path(path: &str) -> Self {
    match extension(path).as_deref() {
      Some("js" | "mjs") => Self::Script,
      Some("css") => Self::Style,
      Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "avif" | "ico") => Self::Image,
      Some("woff" | "woff2" | "ttf" | "otf") => Self::Font,
      Some("html" | "htm") => Self::Document,
      _ => Self::Other,
    }
  }
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "image" => Ok(Self::Image),
      "font" => Ok(Self::Font),
      "fetch" => Ok(Self::Fetch),
      "other" => Ok(Self::Other),
      other => Err(format!("unknown destination '{}'", other)),
    }
  }
}

/// Lowercased file extension of the last path segment, if any.
pub(crate) fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub destination: Destination,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      destination: Destination::Other,
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A top-level page load as a browser would issue it.
  pub fn navigation(url: Url) -> Self {
    Self::get(url)
      .with_destination(Destination::Document)
      .with_header(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"))
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Anything other than GET, HEAD and OPTIONS changes server state.
  pub fn is_mutation(&self) -> bool {
    !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
  }

  pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn accepts_html(&self) -> bool {
    self
      .header_str(&ACCEPT)
      .map(|accept| accept.to_ascii_lowercase().contains("text/html"))
      .unwrap_or(false)
  }

  /// The request carries `Cache-Control: no-store`.
  pub fn forbids_storage(&self) -> bool {
    self
      .header_str(&CACHE_CONTROL)
      .map(|v| has_directive(v, "no-store"))
      .unwrap_or(false)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header_str(&CONTENT_TYPE)
  }

  pub fn cache_key(&self) -> CacheKey {
    CacheKey::for_request(self)
  }
}

/// Canonical request identity used as the key inside a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  /// Hash of method, URL without fragment, and the representation class
  /// negotiated through `Accept`.
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let input = format!(
      "{}\n{}\n{}",
      request.method.as_str(),
      url.as_str(),
      AcceptClass::of(request.header_str(&ACCEPT)).as_str()
    );

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn from_stored(raw: String) -> Self {
    Self(raw)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Coarse representation class. Browsers send long, version-specific
/// `Accept` strings, so keys vary on the class rather than the raw header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptClass {
  Html,
  Json,
  Any,
}

impl AcceptClass {
  fn of(accept: Option<&str>) -> Self {
    let accept = accept.unwrap_or("").to_ascii_lowercase();
    if accept.contains("text/html") {
      Self::Html
    } else if accept.contains("json") {
      Self::Json
    } else {
      Self::Any
    }
  }

  fn as_str(self) -> &'static str {
    match self {
      Self::Html => "html",
      Self::Json => "json",
      Self::Any => "any",
    }
  }
}

/// A response produced by the network, a cache store, or the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
  /// The network followed at least one redirect to produce this response.
  pub redirected: bool,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
      redirected: false,
    }
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  /// Reason this response must not be stored, or `None` if it may be.
  pub fn storage_rejection(&self, max_body_bytes: usize) -> Option<&'static str> {
    if !self.status.is_success() {
      Some("non-success status")
    } else if self.status == StatusCode::PARTIAL_CONTENT {
      Some("partial content")
    } else if self.redirected {
      Some("redirected")
    } else if self.body.len() > max_body_bytes {
      Some("body exceeds size ceiling")
    } else if self
      .headers
      .get(CACHE_CONTROL)
      .and_then(|v| v.to_str().ok())
      .map(|v| has_directive(v, "no-store"))
      .unwrap_or(false)
    {
      Some("no-store")
    } else {
      None
    }
  }

  /// Headers as name/value pairs, for persistence.
  pub fn header_pairs(&self) -> Vec<(String, String)> {
    self
      .headers
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect()
  }

  /// Rebuild a header map from persisted pairs, skipping invalid ones.
  pub fn headers_from_pairs(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }
    headers
  }
}

fn has_directive(header: &str, directive: &str) -> bool {
  header
    .split(',')
    .any(|d| d.trim().eq_ignore_ascii_case(directive))
}
