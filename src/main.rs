mod cache;
mod commands;
mod config;
mod http;
mod logging;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::debug;

use cache::{MemoryStorage, NoopStorage, SqliteStorage};
use config::StorageBackend;

#[derive(Parser, Debug)]
#[command(name = "freshcache")]
#[command(about = "Age-based HTTP response cache with background refresh and offline fallback")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/freshcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Held until exit so buffered file logs are flushed
  let _guard = logging::init(&config.logging)?;
  debug!(cache = %config.cache_name, backend = ?config.storage.backend, "Starting");

  match config.storage.backend {
    StorageBackend::Sqlite => {
      let storage = SqliteStorage::open(config.storage.path.as_deref())?;
      commands::run(args.command, &config, storage).await
    }
    StorageBackend::Memory => commands::run(args.command, &config, MemoryStorage::new()).await,
    StorageBackend::None => commands::run(args.command, &config, NoopStorage).await,
  }
}
