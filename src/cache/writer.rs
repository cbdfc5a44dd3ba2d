//! Non-blocking persistence of network responses.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CacheStorage, TimestampStore};
use super::tasks::BackgroundTasks;
use super::traits::{Request, Response};

/// Writes network responses into the cache store in the background.
pub struct CacheWriter<S: CacheStorage + TimestampStore> {
  storage: Arc<S>,
  cache_name: Arc<str>,
  /// Statuses worth persisting; `None` persists every response
  cacheable_statuses: Option<Arc<BTreeSet<u16>>>,
  tasks: BackgroundTasks,
}

impl<S: CacheStorage + TimestampStore + 'static> CacheWriter<S> {
  pub fn new(storage: Arc<S>, cache_name: &str, tasks: BackgroundTasks) -> Self {
    Self {
      storage,
      cache_name: Arc::from(cache_name),
      cacheable_statuses: None,
      tasks,
    }
  }

  /// Only persist responses with one of these statuses.
  pub fn with_cacheable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
    self.cacheable_statuses = Some(Arc::new(statuses.into_iter().collect()));
    self
  }

  /// Whether a response with this status would be persisted.
  pub fn is_cacheable(&self, status: u16) -> bool {
    self
      .cacheable_statuses
      .as_ref()
      .map_or(true, |statuses| statuses.contains(&status))
  }

  /// Persist `response` for `request` without blocking, returning the copy
  /// that belongs to the caller.
  ///
  /// The stored copy is written first, then the write time is recorded in the
  /// side-store. Failures are logged and dropped.
  pub fn write(&self, request: &Request, response: Response) -> Response {
    if !self.is_cacheable(response.status()) {
      debug!(
        request = %request.description(),
        status = response.status(),
        "Status is not cacheable, skipping cache write"
      );
      return response;
    }

    let (returned, stored) = response.tee();

    let storage = Arc::clone(&self.storage);
    let cache_name = Arc::clone(&self.cache_name);
    let request = request.clone();

    self.tasks.spawn(async move {
      if let Err(e) = storage.put(&cache_name, &request, stored) {
        warn!(request = %request.description(), "Failed to write cache entry: {}", e);
        return;
      }
      if let Err(e) = storage.set_timestamp(&request.cache_key(), Utc::now()) {
        warn!(request = %request.description(), "Failed to record write time: {}", e);
        return;
      }
      debug!(request = %request.description(), cache = %cache_name, "Cache entry written");
    });

    returned
  }
}

impl<S: CacheStorage + TimestampStore> Clone for CacheWriter<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      cache_name: Arc::clone(&self.cache_name),
      cacheable_statuses: self.cacheable_statuses.clone(),
      tasks: self.tasks.clone(),
    }
  }
}
