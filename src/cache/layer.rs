//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration as Age, Utc};
use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::FetchError;
use super::freshness::{classify, FreshnessState, Thresholds, Timestamp};
use super::storage::{CacheStorage, TimestampStore};
use super::tasks::BackgroundTasks;
use super::timestamp::resolve;
use super::traits::{Request, Response, Served};
use super::writer::CacheWriter;

/// Cache layer that decides, per request, whether to serve the cache, refresh
/// it in the background, or go to the network first.
///
/// | state      | behaviour                                              |
/// |------------|--------------------------------------------------------|
/// | `fresh`    | serve cache, no network                                |
/// | `old`      | serve cache, refresh in the background                 |
/// | `outdated` | await network, fall back to the cache entry on failure |
/// | `missing`  | await network, failures surface to the caller          |
pub struct CacheLayer<S: CacheStorage + TimestampStore> {
  storage: Arc<S>,
  cache_name: Arc<str>,
  thresholds: Thresholds,
  fetch_timeout: Option<Duration>,
  writer: CacheWriter<S>,
  tasks: BackgroundTasks,
}

/// What the cache knows about a request, without touching the network.
#[derive(Debug, Clone)]
pub struct Inspection {
  pub state: FreshnessState,
  /// `None` when there is no entry
  pub timestamp: Option<Timestamp>,
  pub age: Option<Age>,
  pub status: Option<u16>,
  pub size: Option<usize>,
}

impl<S: CacheStorage + TimestampStore + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S, cache_name: &str, thresholds: Thresholds) -> Self {
    debug!(
      cache = cache_name,
      old_secs = thresholds.old().num_seconds(),
      outdated_secs = thresholds.outdated().num_seconds(),
      "Created cache layer"
    );
    let storage = Arc::new(storage);
    let tasks = BackgroundTasks::new();
    let writer = CacheWriter::new(Arc::clone(&storage), cache_name, tasks.clone());
    Self {
      storage,
      cache_name: Arc::from(cache_name),
      thresholds,
      fetch_timeout: None,
      writer,
      tasks,
    }
  }

  /// Give up on fetches that take longer than `timeout`.
  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.fetch_timeout = Some(timeout);
    self
  }

  /// Only persist responses with one of these statuses.
  pub fn with_cacheable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
    self.writer = self.writer.with_cacheable_statuses(statuses);
    self
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  /// Background refreshes and cache writes started by this layer.
  pub fn tasks(&self) -> &BackgroundTasks {
    &self.tasks
  }

  /// Serve a request.
  ///
  /// `fetcher` is called at most once, and only when the classification asks
  /// for the network. For `old` entries the fetch runs detached and its
  /// outcome never reaches the caller.
  pub async fn serve<F, Fut>(&self, request: &Request, fetcher: F) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>> + Send + 'static,
  {
    let cached = self.lookup(request);
    let timestamp = cached
      .as_ref()
      .map(|response| resolve(request, Some(response), self.storage.as_ref()));
    let state = classify(timestamp, Utc::now(), &self.thresholds);
    debug!(request = %request.description(), %state, "Classified cache entry");

    match (state, cached) {
      (FreshnessState::Fresh, Some(cached)) => Ok(Served::from_cache(cached, state)),
      (FreshnessState::Old, Some(cached)) => {
        self.refresh_in_background(request, fetcher());
        Ok(Served::from_cache(cached, state))
      }
      (FreshnessState::Outdated, Some(cached)) => {
        match fetch_to_cache(&self.writer, self.fetch_timeout, request, fetcher()).await {
          Ok(response) => Ok(Served::from_network(response, state)),
          Err(e) => {
            // Network failed, serve the outdated entry (offline mode)
            warn!(request = %request.description(), "Serving outdated cache entry: {}", e);
            Ok(Served::stale_fallback(cached, state))
          }
        }
      }
      (state, _) => {
        // No cache, must fetch from network
        let response = fetch_with_timeout(self.fetch_timeout, request, fetcher()).await?;
        if is_server_error(&response) {
          // Nothing to fall back to, hand the error page over uncached
          warn!(
            request = %request.description(),
            status = response.status(),
            "Server error with no cache entry, not caching"
          );
          return Ok(Served::from_network(response, state));
        }
        Ok(Served::from_network(self.writer.write(request, response), state))
      }
    }
  }

  /// Classify the cache entry for a request without fetching anything.
  pub fn inspect(&self, request: &Request) -> Result<Inspection> {
    let cached = self.storage.get(&self.cache_name, request)?;
    let timestamp = cached
      .as_ref()
      .map(|response| resolve(request, Some(response), self.storage.as_ref()));
    let now = Utc::now();
    let state = classify(timestamp, now, &self.thresholds);

    let age = match timestamp {
      Some(Timestamp::Known(at)) => Some(now - at),
      _ => None,
    };

    Ok(Inspection {
      state,
      timestamp,
      age,
      status: cached.as_ref().map(Response::status),
      size: cached.as_ref().map(|r| r.body().len()),
    })
  }

  /// Remove the entry and the recorded write time for a request.
  pub fn evict(&self, request: &Request) -> Result<bool> {
    let removed = self.storage.delete(&self.cache_name, request)?;
    self.storage.delete_timestamp(&request.cache_key())?;
    info!(request = %request.description(), removed, "Evicted cache entry");
    Ok(removed)
  }

  /// Remove every entry of this layer's cache.
  pub fn clear(&self) -> Result<usize> {
    let removed = self.storage.clear(&self.cache_name)?;
    info!(cache = %self.cache_name, removed, "Cleared cache");
    Ok(removed)
  }

  /// Read the cache entry; a broken store counts as a miss.
  fn lookup(&self, request: &Request) -> Option<Response> {
    match self.storage.get(&self.cache_name, request) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(request = %request.description(), "Cache lookup failed, treating as miss: {}", e);
        None
      }
    }
  }

  fn refresh_in_background<Fut>(&self, request: &Request, fetch: Fut)
  where
    Fut: Future<Output = Result<Response, FetchError>> + Send + 'static,
  {
    let writer = self.writer.clone();
    let timeout = self.fetch_timeout;
    let request = request.clone();

    self.tasks.spawn(async move {
      match fetch_to_cache(&writer, timeout, &request, fetch).await {
        Ok(_) => debug!(request = %request.description(), "Background refresh finished"),
        Err(e) => warn!(request = %request.description(), "Background refresh failed: {}", e),
      }
    });
  }
}

impl<S: CacheStorage + TimestampStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      cache_name: Arc::clone(&self.cache_name),
      thresholds: self.thresholds,
      fetch_timeout: self.fetch_timeout,
      writer: self.writer.clone(),
      tasks: self.tasks.clone(),
    }
  }
}

/// Await a fetch, giving up after `timeout` when one is set.
async fn fetch_with_timeout<Fut>(
  timeout: Option<Duration>,
  request: &Request,
  fetch: Fut,
) -> Result<Response, FetchError>
where
  Fut: Future<Output = Result<Response, FetchError>>,
{
  match timeout {
    Some(limit) => tokio::time::timeout(limit, fetch)
      .await
      .map_err(|_| FetchError::Timeout {
        url: request.url().to_string(),
        timeout: limit,
      })?,
    None => fetch.await,
  }
}

fn is_server_error(response: &Response) -> bool {
  response.status() >= 500
}

/// Await a fetch and hand a usable response to the cache writer.
///
/// Server errors count as no usable response so an outdated entry is preferred
/// over them.
async fn fetch_to_cache<S, Fut>(
  writer: &CacheWriter<S>,
  timeout: Option<Duration>,
  request: &Request,
  fetch: Fut,
) -> Result<Response, FetchError>
where
  S: CacheStorage + TimestampStore + 'static,
  Fut: Future<Output = Result<Response, FetchError>>,
{
  let response = fetch_with_timeout(timeout, request, fetch).await?;

  if is_server_error(&response) {
    return Err(FetchError::Unusable {
      url: request.url().to_string(),
      status: response.status(),
    });
  }

  Ok(writer.write(request, response))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::ServeSource;
  use bytes::Bytes;
  use chrono::DateTime;
  use color_eyre::eyre::eyre;
  use futures::future::{BoxFuture, FutureExt};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::oneshot;
  use url::Url;

  type Fetch = BoxFuture<'static, Result<Response, FetchError>>;

  fn request() -> Request {
    Request::get(Url::parse("https://news.example.com/top.json").unwrap())
  }

  /// Minute-based deployment: old after 60s, outdated after 360s.
  fn layer() -> CacheLayer<SqliteStorage> {
    CacheLayer::new(
      SqliteStorage::open_in_memory().unwrap(),
      "hacker-tab-v1",
      Thresholds::from_secs(60, 360).unwrap(),
    )
  }

  /// Put an undated entry written `secs` seconds ago.
  fn seed(layer: &CacheLayer<SqliteStorage>, body: &str, secs: i64) {
    let written = Utc::now() - Age::seconds(secs);
    seed_at(layer, body, written);
  }

  fn seed_at(layer: &CacheLayer<SqliteStorage>, body: &str, written: DateTime<Utc>) {
    layer
      .storage
      .put(layer.cache_name(), &request(), Response::new(200, vec![], body.to_string()))
      .unwrap();
    layer
      .storage
      .set_timestamp(&request().cache_key(), written)
      .unwrap();
  }

  fn succeed(calls: &Arc<AtomicUsize>, body: &'static str) -> impl FnOnce() -> Fetch {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { Ok::<_, FetchError>(Response::new(200, vec![], body)) }.boxed()
    }
  }

  fn fail(calls: &Arc<AtomicUsize>) -> impl FnOnce() -> Fetch {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        Err::<Response, _>(FetchError::Transport {
          url: request().url().to_string(),
          message: "offline".to_string(),
        })
      }
      .boxed()
    }
  }

  fn cached_body(layer: &CacheLayer<SqliteStorage>) -> Option<Bytes> {
    layer
      .storage
      .get(layer.cache_name(), &request())
      .unwrap()
      .map(Response::into_body)
  }

  #[tokio::test]
  async fn test_fresh_serves_cache_without_network() {
    let layer = layer();
    seed(&layer, "cached", 10);
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();

    assert_eq!(served.state, FreshnessState::Fresh);
    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(served.response.into_body(), Bytes::from("cached"));
    layer.tasks().drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_old_serves_cache_and_refreshes_in_background() {
    let layer = layer();
    seed(&layer, "cached", 120);
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();

    assert_eq!(served.state, FreshnessState::Old);
    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(served.response.into_body(), Bytes::from("cached"));

    layer.tasks().drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cached_body(&layer), Some(Bytes::from("network")));
    assert_eq!(layer.inspect(&request()).unwrap().state, FreshnessState::Fresh);
  }

  #[tokio::test]
  async fn test_old_does_not_wait_for_network() {
    let layer = layer();
    seed(&layer, "cached", 120);
    let (release, released) = oneshot::channel::<()>();

    let fetcher = move || {
      async move {
        let _ = released.await;
        Err::<Response, _>(FetchError::Transport {
          url: request().url().to_string(),
          message: "connection reset".to_string(),
        })
      }
      .boxed()
    };

    // Would hang if serving awaited the refresh
    let served = tokio::time::timeout(Duration::from_secs(5), layer.serve(&request(), fetcher))
      .await
      .expect("old entries must be served without waiting on the network")
      .unwrap();
    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(layer.tasks().pending(), 1);

    release.send(()).unwrap();
    layer.tasks().drain().await;

    // The failed refresh changed neither the served response nor the cache
    assert_eq!(served.response.into_body(), Bytes::from("cached"));
    assert_eq!(cached_body(&layer), Some(Bytes::from("cached")));
  }

  #[tokio::test]
  async fn test_unknown_timestamp_is_served_as_old() {
    let layer = layer();
    layer
      .storage
      .put(layer.cache_name(), &request(), Response::new(200, vec![], "undated"))
      .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();

    assert_eq!(served.state, FreshnessState::Old);
    assert_eq!(served.response.into_body(), Bytes::from("undated"));
    layer.tasks().drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_outdated_prefers_network() {
    let layer = layer();
    seed(&layer, "cached", 400);
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();

    assert_eq!(served.state, FreshnessState::Outdated);
    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.into_body(), Bytes::from("network"));
    layer.tasks().drain().await;
    assert_eq!(cached_body(&layer), Some(Bytes::from("network")));
  }

  #[tokio::test]
  async fn test_outdated_falls_back_to_cache_when_network_fails() {
    let layer = layer();
    seed(&layer, "400 seconds old", 400);
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), fail(&calls)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(served.state, FreshnessState::Outdated);
    assert_eq!(served.source, ServeSource::StaleFallback);
    assert_eq!(served.response.into_body(), Bytes::from("400 seconds old"));
  }

  #[tokio::test]
  async fn test_outdated_falls_back_on_server_error() {
    let layer = layer();
    seed(&layer, "cached", 400);

    let fetcher = || async { Ok::<_, FetchError>(Response::new(503, vec![], "unavailable")) }.boxed();
    let served = layer.serve(&request(), fetcher).await.unwrap();

    assert_eq!(served.source, ServeSource::StaleFallback);
    layer.tasks().drain().await;
    assert_eq!(cached_body(&layer), Some(Bytes::from("cached")));
  }

  #[tokio::test]
  async fn test_missing_surfaces_network_failure() {
    let layer = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer.serve(&request(), fail(&calls)).await;

    assert!(matches!(result, Err(FetchError::Transport { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_missing_fetches_and_writes_through() {
    let layer = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();
    let fetched_at = Utc::now();

    assert_eq!(served.state, FreshnessState::Missing);
    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.into_body(), Bytes::from("network"));

    layer.tasks().drain().await;

    let inspection = layer.inspect(&request()).unwrap();
    assert_eq!(inspection.state, FreshnessState::Fresh);
    match inspection.timestamp {
      Some(Timestamp::Known(at)) => {
        assert!((fetched_at - at).num_milliseconds().abs() < 2_000);
      }
      other => panic!("expected a recorded timestamp, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_missing_passes_server_error_through_uncached() {
    let layer = layer();

    let fetcher = || async { Ok::<_, FetchError>(Response::new(502, vec![], "bad gateway")) }.boxed();
    let served = layer.serve(&request(), fetcher).await.unwrap();

    assert_eq!(served.state, FreshnessState::Missing);
    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.status(), 502);
    assert_eq!(served.response.into_body(), Bytes::from("bad gateway"));

    layer.tasks().drain().await;
    assert_eq!(cached_body(&layer), None);
  }

  #[tokio::test]
  async fn test_write_lands_after_layer_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let layer = CacheLayer::new(
      SqliteStorage::open(Some(&path)).unwrap(),
      "v1",
      Thresholds::from_secs(60, 360).unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();
    assert_eq!(served.source, ServeSource::Network);
    drop(layer);

    let reader = SqliteStorage::open(Some(&path)).unwrap();
    let mut stored = None;
    for _ in 0..100 {
      stored = reader.get("v1", &request()).unwrap();
      if stored.is_some() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.map(Response::into_body), Some(Bytes::from("network")));
  }

  #[tokio::test]
  async fn test_date_header_drives_classification() {
    let layer = layer();
    let date = (Utc::now() - Age::seconds(120)).to_rfc2822();
    layer
      .storage
      .put(
        layer.cache_name(),
        &request(),
        Response::new(200, vec![("Date".to_string(), date)], "dated"),
      )
      .unwrap();
    // A recent side-store entry must not override the header
    layer
      .storage
      .set_timestamp(&request().cache_key(), Utc::now())
      .unwrap();

    assert_eq!(layer.inspect(&request()).unwrap().state, FreshnessState::Old);
  }

  #[tokio::test]
  async fn test_fetch_timeout_surfaces_when_nothing_is_cached() {
    let layer = layer().with_fetch_timeout(Duration::from_millis(50));

    let fetcher = || {
      async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, FetchError>(Response::new(200, vec![], "late"))
      }
      .boxed()
    };
    let result = layer.serve(&request(), fetcher).await;

    assert!(matches!(result, Err(FetchError::Timeout { .. })));
  }

  #[tokio::test]
  async fn test_evict_and_clear() {
    let layer = layer();
    seed(&layer, "cached", 10);

    assert!(layer.evict(&request()).unwrap());
    let inspection = layer.inspect(&request()).unwrap();
    assert_eq!(inspection.state, FreshnessState::Missing);
    assert!(inspection.timestamp.is_none());
    assert!(layer
      .storage
      .get_timestamp(&request().cache_key())
      .unwrap()
      .is_none());

    seed(&layer, "cached", 10);
    assert_eq!(layer.clear().unwrap(), 1);
    assert_eq!(layer.inspect(&request()).unwrap().state, FreshnessState::Missing);
  }

  /// Storage whose every operation fails.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn get(&self, _cache_name: &str, _request: &Request) -> Result<Option<Response>> {
      Err(eyre!("disk full"))
    }

    fn put(&self, _cache_name: &str, _request: &Request, _response: Response) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn delete(&self, _cache_name: &str, _request: &Request) -> Result<bool> {
      Err(eyre!("disk full"))
    }

    fn clear(&self, _cache_name: &str) -> Result<usize> {
      Err(eyre!("disk full"))
    }
  }

  impl TimestampStore for BrokenStorage {
    fn get_timestamp(&self, _key: &str) -> Result<Option<DateTime<Utc>>> {
      Err(eyre!("disk full"))
    }

    fn set_timestamp(&self, _key: &str, _at: DateTime<Utc>) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn delete_timestamp(&self, _key: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }
  }

  #[tokio::test]
  async fn test_storage_failures_never_fail_the_response() {
    let layer = CacheLayer::new(
      BrokenStorage,
      "hacker-tab-v1",
      Thresholds::from_secs(60, 360).unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let served = layer.serve(&request(), succeed(&calls, "network")).await.unwrap();
    layer.tasks().drain().await;

    assert_eq!(served.state, FreshnessState::Missing);
    assert_eq!(served.response.into_body(), Bytes::from("network"));
    assert!(layer.inspect(&request()).is_err());
  }
}
