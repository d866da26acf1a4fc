//! Request classification.

use serde::Serialize;
use url::Url;

use crate::cache::{CacheKind, Strategy};
use crate::config::RoutesConfig;
use crate::http::{extension, Destination, Request};

/// Category an intercepted request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCategory {
  StaticAsset,
  ApiCall,
  Navigation,
  DynamicContent,
  Unmatched,
}

/// Strategy and target cache for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
  pub category: RouteCategory,
  pub strategy: Strategy,
  pub cache: Option<CacheKind>,
}

impl RouteCategory {
  pub fn decision(self) -> RouteDecision {
    let (strategy, cache) = match self {
      Self::StaticAsset => (Strategy::CacheFirst, Some(CacheKind::Static)),
      Self::ApiCall => (Strategy::NetworkFirst, Some(CacheKind::Dynamic)),
      Self::Navigation => (Strategy::StaleWhileRevalidate, Some(CacheKind::Dynamic)),
      Self::DynamicContent => (Strategy::NetworkFirst, Some(CacheKind::Dynamic)),
      Self::Unmatched => (Strategy::NetworkWithFallback, None),
    };
    RouteDecision {
      category: self,
      strategy,
      cache,
    }
  }
}

/// Evaluation order; the first matching rule wins.
const RULE_ORDER: [RouteCategory; 4] = [
  RouteCategory::StaticAsset,
  RouteCategory::ApiCall,
  RouteCategory::Navigation,
  RouteCategory::DynamicContent,
];

const STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "woff", "woff2",
  "ttf", "otf",
];

/// Pure classifier over method, URL and declared resource type.
/// The rule set is fixed at construction.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
  origin: Url,
  static_prefixes: Vec<String>,
  api_prefixes: Vec<String>,
  api_hosts: Vec<String>,
}

impl RouteClassifier {
  pub fn new(origin: &Url, routes: &RoutesConfig) -> Self {
    Self {
      origin: origin.clone(),
      static_prefixes: routes.static_prefixes.clone(),
      api_prefixes: routes.api_prefixes.clone(),
      api_hosts: routes.api_hosts.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> RouteCategory {
    if request.method != reqwest::Method::GET {
      return RouteCategory::Unmatched;
    }

    RULE_ORDER
      .into_iter()
      .find(|category| self.matches(*category, request))
      .unwrap_or(RouteCategory::Unmatched)
  }

  fn matches(&self, category: RouteCategory, request: &Request) -> bool {
    let path = request.url.path();
    match category {
      RouteCategory::StaticAsset => {
        matches!(
          request.destination,
          Destination::Script | Destination::Style | Destination::Image | Destination::Font
        ) || extension(path)
          .map(|ext| STATIC_EXTENSIONS.contains(&ext.as_str()))
          .unwrap_or(false)
          || (self.is_same_origin(&request.url)
            && self.static_prefixes.iter().any(|p| path.starts_with(p.as_str())))
      }
      RouteCategory::ApiCall => {
        let api_host = request
          .url
          .host_str()
          .map(|host| self.api_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
          .unwrap_or(false);
        api_host
          || (self.is_same_origin(&request.url)
            && self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())))
      }
      RouteCategory::Navigation => {
        request.destination == Destination::Document || request.accepts_html()
      }
      RouteCategory::DynamicContent => self.is_same_origin(&request.url),
      RouteCategory::Unmatched => false,
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }
}
