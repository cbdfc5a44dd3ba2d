//! Typed errors at the policy boundary.

use std::time::Duration;
use thiserror::Error;

/// A network fetch that produced no usable response.
///
/// Recovered by the cache layer when an outdated entry can be served instead,
/// otherwise surfaced to the caller.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },

  #[error("{url} answered with unusable status {status}")]
  Unusable { url: String, status: u16 },

  #[error("request to {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },
}

/// A `date` header that is not a valid point in time.
#[derive(Debug, Error)]
#[error("unparseable date header {value:?}")]
pub struct TimestampParseError {
  pub value: String,
}
