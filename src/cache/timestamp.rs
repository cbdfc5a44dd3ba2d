//! Recovery of a cached response's freshness timestamp.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::error::TimestampParseError;
use super::freshness::Timestamp;
use super::storage::TimestampStore;
use super::traits::{Request, Response};

/// Resolve when a response was produced.
///
/// The response's own `date` header wins. Without one, the side-store entry
/// recorded at write time is used. Anything unrecoverable is `Unknown`,
/// including an absent response.
pub fn resolve<T>(request: &Request, response: Option<&Response>, side_store: &T) -> Timestamp
where
  T: TimestampStore + ?Sized,
{
  let Some(response) = response else {
    return Timestamp::Unknown;
  };

  if let Some(value) = response.date_header() {
    return match parse_http_date(value) {
      Ok(at) => Timestamp::Known(at),
      Err(e) => {
        debug!(request = %request.description(), "{}", e);
        Timestamp::Unknown
      }
    };
  }

  match side_store.get_timestamp(&request.cache_key()) {
    Ok(Some(at)) => Timestamp::Known(at),
    Ok(None) => Timestamp::Unknown,
    Err(e) => {
      warn!(request = %request.description(), "Failed to read recorded timestamp: {}", e);
      Timestamp::Unknown
    }
  }
}

/// Parse an HTTP date (IMF-fixdate / RFC 2822), accepting RFC 3339 as well.
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, TimestampParseError> {
  let value = value.trim();
  DateTime::parse_from_rfc2822(value)
    .or_else(|_| DateTime::parse_from_rfc3339(value))
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| TimestampParseError {
      value: value.to_string(),
    })
}
