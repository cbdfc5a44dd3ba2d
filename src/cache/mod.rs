//! Age-based caching policy for network resources.
//!
//! This module decides per request how to use a cached response:
//! - Classifies the entry as fresh, old, outdated or missing from its age
//! - Recovers the age from the `date` header or a side-store of write times
//! - Serves old entries immediately while refreshing them in the background
//! - Falls back to outdated entries when the network is unavailable

mod error;
mod freshness;
mod layer;
mod storage;
mod tasks;
mod timestamp;
mod traits;
mod writer;

pub use error::FetchError;
pub use freshness::{FreshnessState, Thresholds, Timestamp};
pub use layer::{CacheLayer, Inspection};
pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage, TimestampStore};
pub use traits::{Request, Response, Served, ServeSource};
