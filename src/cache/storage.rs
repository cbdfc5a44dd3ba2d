//! Cache storage traits and their SQLite implementation.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{Request, Response};

/// Trait for cache storage backends.
///
/// Entries are partitioned by cache name and keyed by request identity.
/// Writes replace any previous entry for the same key.
pub trait CacheStorage: Send + Sync {
  /// Get the cached response for a request.
  fn get(&self, cache_name: &str, request: &Request) -> Result<Option<Response>>;

  /// Store a response, replacing any previous entry.
  fn put(&self, cache_name: &str, request: &Request, response: Response) -> Result<()>;

  /// Delete a single entry. Returns whether an entry existed.
  fn delete(&self, cache_name: &str, request: &Request) -> Result<bool>;

  /// Delete every entry of a cache. Returns the number of removed entries.
  fn clear(&self, cache_name: &str) -> Result<usize>;
}

/// Auxiliary timestamp store, keyed by request cache key.
///
/// Records when a response was written so its age can be recovered even when
/// the response carries no `date` header.
pub trait TimestampStore: Send + Sync {
  fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

  fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> Result<()>;

  fn delete_timestamp(&self, key: &str) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _cache_name: &str, _request: &Request) -> Result<Option<Response>> {
    Ok(None) // Always miss
  }

  fn put(&self, _cache_name: &str, _request: &Request, _response: Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _cache_name: &str, _request: &Request) -> Result<bool> {
    Ok(false)
  }

  fn clear(&self, _cache_name: &str) -> Result<usize> {
    Ok(0)
  }
}

impl TimestampStore for NoopStorage {
  fn get_timestamp(&self, _key: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(None)
  }

  fn set_timestamp(&self, _key: &str, _at: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  fn delete_timestamp(&self, _key: &str) -> Result<()> {
    Ok(())
  }
}

/// Process-local storage backed by hash maps, gone when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
  /// Keyed by (cache name, request key)
  entries: Mutex<HashMap<(String, String), StoredResponse>>,
  timestamps: Mutex<HashMap<String, DateTime<Utc>>>,
}

struct StoredResponse {
  status: u16,
  headers: Vec<(String, String)>,
  body: Bytes,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

impl CacheStorage for MemoryStorage {
  fn get(&self, cache_name: &str, request: &Request) -> Result<Option<Response>> {
    let entries = lock(&self.entries)?;
    Ok(
      entries
        .get(&(cache_name.to_string(), request.cache_key()))
        .map(|stored| Response::new(stored.status, stored.headers.clone(), stored.body.clone())),
    )
  }

  fn put(&self, cache_name: &str, request: &Request, response: Response) -> Result<()> {
    let (status, headers, body) = response.into_parts();
    lock(&self.entries)?.insert(
      (cache_name.to_string(), request.cache_key()),
      StoredResponse {
        status,
        headers,
        body,
      },
    );
    Ok(())
  }

  fn delete(&self, cache_name: &str, request: &Request) -> Result<bool> {
    let removed = lock(&self.entries)?.remove(&(cache_name.to_string(), request.cache_key()));
    Ok(removed.is_some())
  }

  fn clear(&self, cache_name: &str) -> Result<usize> {
    let mut entries = lock(&self.entries)?;
    let before = entries.len();
    entries.retain(|(name, _), _| name != cache_name);
    let removed = before - entries.len();

    // Keys still cached under another name keep their timestamp
    lock(&self.timestamps)?.retain(|key, _| entries.keys().any(|(_, k)| k == key));

    Ok(removed)
  }
}

impl TimestampStore for MemoryStorage {
  fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(lock(&self.timestamps)?.get(key).copied())
  }

  fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
    lock(&self.timestamps)?.insert(key.to_string(), at);
    Ok(())
  }

  fn delete_timestamp(&self, key: &str) -> Result<()> {
    lock(&self.timestamps)?.remove(key);
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the given path, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database, gone when the storage is dropped.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("freshcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    lock(&self.conn)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cached responses, one row per request within a named cache
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    description TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

-- Write times, used when a response has no usable date header
CREATE TABLE IF NOT EXISTS response_timestamps (
    request_key TEXT PRIMARY KEY,
    recorded_at INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, cache_name: &str, request: &Request) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM response_cache
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(Response::new(status, headers, body)))
      }
      None => Ok(None),
    }
  }

  fn put(&self, cache_name: &str, request: &Request, response: Response) -> Result<()> {
    let (status, headers, body) = response.into_parts();
    let headers =
      serde_json::to_string(&headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (cache_name, request_key, description, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache_name,
          request.cache_key(),
          request.description(),
          status,
          headers,
          body.as_ref()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn delete(&self, cache_name: &str, request: &Request) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ? AND request_key = ?",
        params![cache_name, request.cache_key()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn clear(&self, cache_name: &str) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to clear cache {}: {}", cache_name, e))?;

    // Keys still cached under another name keep their timestamp
    conn
      .execute(
        "DELETE FROM response_timestamps WHERE request_key NOT IN
         (SELECT request_key FROM response_cache)",
        [],
      )
      .map_err(|e| eyre!("Failed to clear timestamps: {}", e))?;

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed)
  }
}

impl TimestampStore for SqliteStorage {
  fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;

    let millis: Option<i64> = conn
      .query_row(
        "SELECT recorded_at FROM response_timestamps WHERE request_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query timestamp: {}", e))?;

    millis
      .map(|ms| {
        Utc
          .timestamp_millis_opt(ms)
          .single()
          .ok_or_else(|| eyre!("Stored timestamp {} is out of range", ms))
      })
      .transpose()
  }

  fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO response_timestamps (request_key, recorded_at) VALUES (?, ?)",
        params![key, at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store timestamp: {}", e))?;
    Ok(())
  }

  fn delete_timestamp(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM response_timestamps WHERE request_key = ?",
        params![key],
      )
      .map_err(|e| eyre!("Failed to delete timestamp: {}", e))?;
    Ok(())
  }
}
