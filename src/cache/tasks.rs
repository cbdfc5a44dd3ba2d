//! Registry for detached background work.

use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

/// Tracks fire-and-forget tasks (background refreshes and cache writes).
///
/// Tasks run on the runtime via `tokio::spawn`; the registry only holds their
/// handles. Dropping the registry, or a `drain` future midway, detaches the
/// remaining tasks and lets them run to completion. The owner of the process
/// drains the registry before shutting down so that no started write is lost.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Spawn a detached task on the current runtime.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

    // Reap finished tasks so the list doesn't grow with every request
    handles.retain_mut(|handle| match handle.now_or_never() {
      Some(result) => {
        log_join_error(result);
        false
      }
      None => true,
    });

    handles.push(handle);
  }

  /// Number of tasks that have not been reaped yet.
  pub fn pending(&self) -> usize {
    self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Wait for every registered task, including tasks spawned while draining.
  /// Returns how many tasks were joined.
  pub async fn drain(&self) -> usize {
    let mut joined = 0;
    loop {
      let batch = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
      if batch.is_empty() {
        return joined;
      }
      for handle in batch {
        log_join_error(handle.await);
        joined += 1;
      }
    }
  }
}

fn log_join_error(result: Result<(), JoinError>) {
  if let Err(e) = result {
    warn!("Background task did not complete: {}", e);
  }
}
