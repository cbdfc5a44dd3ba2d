/// Command-line subcommands and their execution
use chrono::Duration;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::cache::{
  CacheStorage, FreshnessState, Inspection, ServeSource, Served, Timestamp, TimestampStore,
};
use crate::config::Config;
use crate::http::{parse_request, CachedHttpClient};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch a URL through the cache and write its body to stdout
  Fetch {
    url: String,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Write the body to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Fetch several URLs concurrently and print one summary line each
  Warm {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Show how a cached URL would be classified, without fetching
  Inspect {
    url: String,
    /// HTTP method the entry was fetched with
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// Remove the cache entry for a URL
  Evict {
    url: String,
    /// HTTP method the entry was fetched with
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// Remove every entry of the configured cache
  Clear,
}

/// Execute a command against the given storage backend.
pub async fn run<S>(command: Command, config: &Config, storage: S) -> Result<()>
where
  S: CacheStorage + TimestampStore + 'static,
{
  let client = CachedHttpClient::new(config, storage)?;

  match command {
    Command::Fetch {
      url,
      method,
      output,
    } => fetch(&client, &method, &url, output).await,
    Command::Warm { urls } => warm(&client, &urls).await,
    Command::Inspect { url, method } => {
      let request = parse_request(&method, &url)?;
      let inspection = client.inspect(&request)?;
      println!("{}", describe_inspection(&inspection));
      Ok(())
    }
    Command::Evict { url, method } => {
      let request = parse_request(&method, &url)?;
      if client.evict(&request)? {
        println!("evicted {}", url);
      } else {
        println!("not cached {}", url);
      }
      Ok(())
    }
    Command::Clear => {
      let removed = client.clear()?;
      println!("removed {} entries from {}", removed, client.cache_name());
      Ok(())
    }
  }
}

async fn fetch<S>(
  client: &CachedHttpClient<S>,
  method: &str,
  url: &str,
  output: Option<PathBuf>,
) -> Result<()>
where
  S: CacheStorage + TimestampStore + 'static,
{
  let request = parse_request(method, url)?;
  let result = client.fetch(&request).await;

  // Let background refreshes and writes land before exiting
  let drained = client.finish().await;
  if drained > 0 {
    info!(tasks = drained, "Background work finished");
  }

  let served = result?;
  info!(
    request = %request.description(),
    state = %served.state,
    source = %served.source,
    status = served.response.status(),
    "Served"
  );
  match (served.state, served.source) {
    (_, ServeSource::StaleFallback) => {
      warn!(request = %request.description(), "Network unavailable, served an outdated entry")
    }
    (FreshnessState::Old, _) => {
      info!(request = %request.description(), "Entry is being refreshed in the background")
    }
    _ => {}
  }

  let body = served.response.into_body();
  match output {
    Some(path) => tokio::fs::write(&path, &body)
      .await
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => {
      let mut stdout = std::io::stdout().lock();
      stdout
        .write_all(&body)
        .and_then(|_| stdout.flush())
        .map_err(|e| eyre!("Failed to write body: {}", e))?;
    }
  }

  Ok(())
}

async fn warm<S>(client: &CachedHttpClient<S>, urls: &[String]) -> Result<()>
where
  S: CacheStorage + TimestampStore + 'static,
{
  let results = join_all(urls.iter().map(|url| async move {
    let result = match parse_request("GET", url) {
      Ok(request) => client.fetch(&request).await.map_err(|e| e.to_string()),
      Err(e) => Err(e.to_string()),
    };
    (url, result)
  }))
  .await;

  let mut failures = 0;
  for (url, result) in &results {
    println!("{}", summary_line(url, result));
    if result.is_err() {
      failures += 1;
    }
  }

  client.finish().await;

  if failures > 0 {
    return Err(eyre!("{} of {} requests failed", failures, urls.len()));
  }
  Ok(())
}

/// One line per URL: state, source, status, body size, URL.
fn summary_line(url: &str, result: &Result<Served, String>) -> String {
  match result {
    Ok(served) => format!(
      "{:<8} {:<14} {:>3} {:>9}  {}",
      served.state,
      served.source,
      served.response.status(),
      served.response.body().len(),
      url
    ),
    Err(e) => format!("{:<8} {}  {}", "error", e, url),
  }
}

fn describe_inspection(inspection: &Inspection) -> String {
  let mut lines = vec![format!("state:     {}", inspection.state)];

  match inspection.timestamp {
    Some(Timestamp::Known(at)) => lines.push(format!("timestamp: {}", at.to_rfc3339())),
    Some(Timestamp::Unknown) => lines.push("timestamp: unknown".to_string()),
    None => {}
  }
  if let Some(age) = inspection.age {
    lines.push(format!("age:       {}", format_age(age)));
  }
  if let Some(status) = inspection.status {
    lines.push(format!("status:    {}", status));
  }
  if let Some(size) = inspection.size {
    lines.push(format!("size:      {} bytes", size));
  }

  lines.join("\n")
}

/// Format an age as e.g. `2h 5m 3s`.
fn format_age(age: Duration) -> String {
  let (sign, secs) = if age < Duration::zero() {
    ("-", -age.num_seconds())
  } else {
    ("", age.num_seconds())
  };

  let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
  if hours > 0 {
    format!("{}{}h {}m {}s", sign, hours, minutes, seconds)
  } else if minutes > 0 {
    format!("{}{}m {}s", sign, minutes, seconds)
  } else {
    format!("{}{}s", sign, seconds)
  }
}
