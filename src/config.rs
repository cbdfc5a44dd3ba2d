use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::Thresholds;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Name of the cache partition entries are written to (e.g. "new-hacker-tab-v1")
  pub cache_name: String,
  /// Entries older than this are served but refreshed in the background
  pub old_duration_secs: u64,
  /// Entries older than this are only served when the network fails
  pub outdated_duration_secs: u64,
  /// Give up on network fetches after this many seconds (no limit if unset)
  pub fetch_timeout_secs: Option<u64>,
  /// Only cache responses with these statuses (everything usable if unset)
  pub cacheable_statuses: Option<Vec<u16>>,
  /// User-Agent header sent with every request
  pub user_agent: Option<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Process-local maps, gone when the process exits
  Memory,
  /// Caching disabled
  None,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Database path (defaults to $XDG_DATA_HOME/freshcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write logs to a daily rolling file in this directory
  pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./freshcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/freshcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/freshcache/config.yaml\n\
                 It needs at least cache_name, old_duration_secs and outdated_duration_secs."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("freshcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("freshcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    if self.fetch_timeout_secs == Some(0) {
      return Err(eyre!("fetch_timeout_secs must be greater than zero"));
    }
    self.thresholds()?;
    Ok(())
  }

  /// Age thresholds between fresh, old and outdated entries.
  pub fn thresholds(&self) -> Result<Thresholds> {
    Thresholds::from_secs(self.old_duration_secs, self.outdated_duration_secs)
  }
}
