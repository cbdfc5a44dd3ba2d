//! Cached HTTP client that wraps HttpClient with the age-based cache policy.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{
  CacheLayer, CacheStorage, FetchError, Inspection, Request, Served, TimestampStore,
};
use crate::config::Config;

use super::client::HttpClient;

/// HTTP client with transparent caching support.
///
/// Provides the same fetch API as HttpClient, but every request goes through
/// the cache layer first.
pub struct CachedHttpClient<S: CacheStorage + TimestampStore> {
  inner: HttpClient,
  cache: CacheLayer<S>,
}

impl<S: CacheStorage + TimestampStore + 'static> CachedHttpClient<S> {
  /// Create a new cached client on top of the given storage.
  pub fn new(config: &Config, storage: S) -> Result<Self> {
    let inner = HttpClient::new(config)?;

    let mut cache = CacheLayer::new(storage, &config.cache_name, config.thresholds()?);
    if let Some(secs) = config.fetch_timeout_secs {
      cache = cache.with_fetch_timeout(Duration::from_secs(secs));
    }
    if let Some(statuses) = &config.cacheable_statuses {
      cache = cache.with_cacheable_statuses(statuses.iter().copied());
    }

    Ok(Self { inner, cache })
  }

  /// Serve a request through the cache.
  pub async fn fetch(&self, request: &Request) -> Result<Served, FetchError> {
    self
      .cache
      .serve(request, || {
        let inner = self.inner.clone();
        let request = request.clone();
        async move { inner.fetch(&request).await }
      })
      .await
  }

  /// Look at the cache entry for a request without fetching.
  pub fn inspect(&self, request: &Request) -> Result<Inspection> {
    self.cache.inspect(request)
  }

  /// Drop the cache entry for a request.
  pub fn evict(&self, request: &Request) -> Result<bool> {
    self.cache.evict(request)
  }

  /// Drop every entry of the configured cache.
  pub fn clear(&self) -> Result<usize> {
    self.cache.clear()
  }

  pub fn cache_name(&self) -> &str {
    self.cache.cache_name()
  }

  /// Wait for background refreshes and cache writes to finish.
  pub async fn finish(&self) -> usize {
    debug!(pending = self.cache.tasks().pending(), "Waiting for background work");
    self.cache.tasks().drain().await
  }
}

impl<S: CacheStorage + TimestampStore> Clone for CachedHttpClient<S> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      cache: self.cache.clone(),
    }
  }
}

/// Build a request from a command-line method and URL.
pub fn parse_request(method: &str, url: &str) -> Result<Request> {
  let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
  match url.scheme() {
    "http" | "https" => Ok(Request::new(method, url)),
    scheme => Err(eyre!("Unsupported URL scheme {}: {}", scheme, url)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{FreshnessState, MemoryStorage, ServeSource};
  use bytes::Bytes;
  use mockito::Server;

  fn config(extra: &str) -> Config {
    Config::from_yaml(&format!(
      "cache_name: test-v1\nold_duration_secs: 60\noutdated_duration_secs: 360\n{}",
      extra
    ))
    .unwrap()
  }

  fn client(extra: &str) -> CachedHttpClient<MemoryStorage> {
    CachedHttpClient::new(&config(extra), MemoryStorage::new()).unwrap()
  }

  #[tokio::test]
  async fn test_second_request_is_served_from_cache() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/news")
      .with_status(200)
      .with_body("headlines")
      .expect(1)
      .create_async()
      .await;

    let client = client("");
    let request = parse_request("GET", &format!("{}/news", server.url())).unwrap();

    let first = client.fetch(&request).await.unwrap();
    assert_eq!(first.source, ServeSource::Network);
    assert_eq!(first.state, FreshnessState::Missing);
    client.finish().await;

    let second = client.fetch(&request).await.unwrap();
    assert_eq!(second.source, ServeSource::Cache);
    assert_eq!(second.state, FreshnessState::Fresh);
    assert_eq!(second.response.into_body(), Bytes::from("headlines"));

    client.finish().await;
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_cacheable_statuses_limit_what_is_stored() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/missing")
      .with_status(404)
      .with_body("not here")
      .expect(2)
      .create_async()
      .await;

    let client = client("cacheable_statuses: [200]");
    let request = parse_request("GET", &format!("{}/missing", server.url())).unwrap();

    for _ in 0..2 {
      let served = client.fetch(&request).await.unwrap();
      assert_eq!(served.response.status(), 404);
      assert_eq!(served.source, ServeSource::Network);
      client.finish().await;
    }

    assert_eq!(client.inspect(&request).unwrap().state, FreshnessState::Missing);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_evict_forces_refetch() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/item")
      .with_status(200)
      .with_body("item")
      .expect(2)
      .create_async()
      .await;

    let client = client("");
    let request = parse_request("GET", &format!("{}/item", server.url())).unwrap();

    client.fetch(&request).await.unwrap();
    client.finish().await;
    assert!(client.evict(&request).unwrap());

    let served = client.fetch(&request).await.unwrap();
    assert_eq!(served.source, ServeSource::Network);
    client.finish().await;
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_entries_are_keyed_by_method() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("POST", "/search")
      .with_status(200)
      .with_body("results")
      .create_async()
      .await;

    let client = client("");
    let url = format!("{}/search", server.url());
    let post = parse_request("POST", &url).unwrap();
    client.fetch(&post).await.unwrap();
    client.finish().await;

    let get = parse_request("GET", &url).unwrap();
    assert_eq!(client.inspect(&get).unwrap().state, FreshnessState::Missing);
    assert_eq!(client.inspect(&post).unwrap().state, FreshnessState::Fresh);

    assert!(!client.evict(&get).unwrap());
    assert!(client.evict(&post).unwrap());
    assert_eq!(client.inspect(&post).unwrap().state, FreshnessState::Missing);
  }

  #[test]
  fn test_parse_request() {
    let request = parse_request("post", "https://example.com/a?b=c").unwrap();
    assert_eq!(request.method(), "POST");
    assert_eq!(request.url().as_str(), "https://example.com/a?b=c");

    assert!(parse_request("GET", "not a url").is_err());
    assert!(parse_request("GET", "ftp://example.com/file").is_err());
  }
}
