//! Age-based classification of cache entries.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};

/// Freshness of a cache entry, computed per request and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessState {
  /// Young enough to serve without touching the network
  Fresh,
  /// Serve from cache, refresh in the background
  Old,
  /// Prefer the network, fall back to the cache entry
  Outdated,
  /// No cache entry
  Missing,
}

impl std::fmt::Display for FreshnessState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Fresh => f.pad("fresh"),
      Self::Old => f.pad("old"),
      Self::Outdated => f.pad("outdated"),
      Self::Missing => f.pad("missing"),
    }
  }
}

/// Freshness timestamp of a cache entry as far as it could be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
  Known(DateTime<Utc>),
  Unknown,
}

/// Age boundaries between fresh, old and outdated entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
  old: Duration,
  outdated: Duration,
}

impl Thresholds {
  /// Build thresholds; `old` must be strictly shorter than `outdated`.
  pub fn new(old: Duration, outdated: Duration) -> Result<Self> {
    if old < Duration::zero() {
      return Err(eyre!("Old duration must not be negative, got {}s", old.num_seconds()));
    }
    if old >= outdated {
      return Err(eyre!(
        "Old duration ({}s) must be shorter than outdated duration ({}s)",
        old.num_seconds(),
        outdated.num_seconds()
      ));
    }
    Ok(Self { old, outdated })
  }

  pub fn from_secs(old_secs: u64, outdated_secs: u64) -> Result<Self> {
    let to_duration = |secs: u64| {
      i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| eyre!("Duration of {}s is out of range", secs))
    };
    Self::new(to_duration(old_secs)?, to_duration(outdated_secs)?)
  }

  pub fn old(&self) -> Duration {
    self.old
  }

  pub fn outdated(&self) -> Duration {
    self.outdated
  }
}

/// Classify a cache entry.
///
/// `entry` is `None` when there is no cache entry at all. An entry whose
/// timestamp could not be recovered counts as old, so it is still served but
/// gets revalidated in the background. Comparisons are strict: an age equal to
/// a threshold lands in the fresher bucket.
pub fn classify(entry: Option<Timestamp>, now: DateTime<Utc>, thresholds: &Thresholds) -> FreshnessState {
  match entry {
    None => FreshnessState::Missing,
    Some(Timestamp::Unknown) => FreshnessState::Old,
    Some(Timestamp::Known(at)) => {
      let age = now - at;
      if age > thresholds.outdated {
        FreshnessState::Outdated
      } else if age > thresholds.old {
        FreshnessState::Old
      } else {
        FreshnessState::Fresh
      }
    }
  }
}
