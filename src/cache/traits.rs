//! Core types for the caching system: request identity, move-only responses,
//! and the result of serving a request.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use url::Url;

use super::freshness::FreshnessState;

/// Identity of a cacheable resource.
///
/// Used both as the cache lookup key and as the fetch target, so it is cheap to
/// clone and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
  method: String,
  url: Url,
}

impl Request {
  /// Create a request for an arbitrary method. The method is upper-cased.
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
    }
  }

  /// Shorthand for a GET request.
  #[cfg(test)]
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Stable, fixed-length key for the cache store and the side-store.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human readable identity, e.g. `GET https://example.com/`.
  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// Response body. Consumed at most once; there is no `Clone`.
#[derive(Debug)]
pub struct Body(Bytes);

impl Body {
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Consume the body.
  pub fn into_bytes(self) -> Bytes {
    self.0
  }
}

/// A fetched or cached resource.
///
/// Responses are move-only: a response that has to reach two consumers (the
/// caller and the cache store) must be split with [`Response::tee`] first.
#[derive(Debug)]
pub struct Response {
  status: u16,
  headers: Vec<(String, String)>,
  body: Body,
}

impl Response {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: Body(body.into()),
    }
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// The intrinsic `date` header, if any.
  pub fn date_header(&self) -> Option<&str> {
    self.header("date")
  }

  pub fn body(&self) -> &Body {
    &self.body
  }

  /// Consume the response, yielding its body.
  pub fn into_body(self) -> Bytes {
    self.body.into_bytes()
  }

  /// Consume the response, yielding all of its parts.
  pub fn into_parts(self) -> (u16, Vec<(String, String)>, Bytes) {
    (self.status, self.headers, self.body.into_bytes())
  }

  /// Split into two independently consumable copies.
  pub fn tee(self) -> (Response, Response) {
    let copy = Response {
      status: self.status,
      headers: self.headers.clone(),
      body: Body(self.body.0.clone()),
    };
    (self, copy)
  }
}

/// Result of serving a request, including where the response came from.
#[derive(Debug)]
pub struct Served {
  /// The response handed to the caller
  pub response: Response,
  /// Freshness of the cache entry at lookup time
  pub state: FreshnessState,
  /// Where the response came from
  pub source: ServeSource,
}

impl Served {
  /// Fresh data from the network.
  pub fn from_network(response: Response, state: FreshnessState) -> Self {
    Self {
      response,
      state,
      source: ServeSource::Network,
    }
  }

  /// Data served straight from the cache.
  pub fn from_cache(response: Response, state: FreshnessState) -> Self {
    Self {
      response,
      state,
      source: ServeSource::Cache,
    }
  }

  /// Network failed, serving the outdated cache entry.
  pub fn stale_fallback(response: Response, state: FreshnessState) -> Self {
    Self {
      response,
      state,
      source: ServeSource::StaleFallback,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
  /// Fresh data from the network
  Network,
  /// Cache entry, served without waiting on the network
  Cache,
  /// Network failed, serving an outdated cache entry
  StaleFallback,
}

impl std::fmt::Display for ServeSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Network => f.pad("network"),
      Self::Cache => f.pad("cache"),
      Self::StaleFallback => f.pad("stale-fallback"),
    }
  }
}
