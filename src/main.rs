mod cache;
mod config;
mod controller;
mod http;
mod net;
mod notify;
mod policy;
mod queue;
mod router;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::cache::{CacheStore, SqliteStore};
use crate::config::Config;
use crate::controller::Controller;
use crate::http::{FetchRequest, HttpMethod, RequestMode};
use crate::net::HttpClient;
use crate::notify::LogNotifier;
use crate::queue::SyncQueue;

#[derive(Parser, Debug)]
#[command(name = "shopflow-offline")]
#[command(about = "Offline caching and sync controller for the ShopFlow retail app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shopflow-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Use in-memory stores instead of the on-disk cache and queue
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured static assets (install event)
  Install,
  /// Drop superseded cache generations (activate event)
  Activate,
  /// Run one request through the router and policies
  Fetch {
    /// Path or absolute URL to fetch
    target: String,

    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,

    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: HttpMethod,

    /// Request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Deliver a reconnection signal ("sync-sales", "sync-inventory")
  Sync { tag: String },
  /// Show cache generations and pending queue depths
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let (store, queue) = if args.ephemeral {
    (SqliteStore::in_memory()?, SyncQueue::in_memory()?)
  } else {
    (SqliteStore::open()?, SyncQueue::open()?)
  };
  let store = Arc::new(store);
  let queue = Arc::new(queue);

  if let Command::Status = args.command {
    return print_status(&config, &store, &queue);
  }

  let (controller, handle) = Controller::new(
    config.clone(),
    Arc::clone(&store),
    Arc::clone(&queue),
    HttpClient::new(),
    Arc::new(LogNotifier),
  )?;
  let loop_task = tokio::spawn(controller.run());

  match args.command {
    Command::Install => {
      let cached = handle
        .install()
        .await
        .map_err(|e| eyre!("Install failed: {}", e))?;
      println!("Precached {} assets into {}", cached, config.static_generation());
    }

    Command::Activate => {
      handle
        .activate()
        .await
        .map_err(|e| eyre!("Activate failed: {}", e))?;
      println!(
        "Active generations: {}",
        config.current_generations().join(", ")
      );
    }

    Command::Fetch {
      target,
      navigate,
      method,
      body,
    } => {
      let url = resolve_target(&config, &target)?;
      let request = FetchRequest {
        url,
        method,
        headers: Vec::new(),
        body: body.map(String::into_bytes),
        mode: if navigate {
          RequestMode::Navigate
        } else {
          RequestMode::Subresource
        },
      };

      match handle.fetch(request).await {
        Ok(response) => {
          println!(
            "{} {}",
            response.status,
            response.content_type().unwrap_or("-")
          );
          println!("{}", String::from_utf8_lossy(&response.body));
        }
        Err(e) => return Err(eyre!("Fetch failed: {}", e)),
      }
    }

    Command::Sync { tag } => {
      let report = handle
        .sync(&tag)
        .await
        .map_err(|e| eyre!("Sync failed: {}", e))?;
      println!(
        "Replayed {} mutations, {} remaining",
        report.replayed, report.remaining
      );
    }

    Command::Status => unreachable!("handled above"),
  }

  drop(handle);
  loop_task.await?;

  Ok(())
}

/// Resolve a CLI target to an absolute URL against the configured origin.
fn resolve_target(config: &Config, target: &str) -> Result<Url> {
  if target.starts_with("http://") || target.starts_with("https://") {
    return Url::parse(target).map_err(|e| eyre!("Invalid URL {}: {}", target, e));
  }

  config
    .origin_url()?
    .join(target)
    .map_err(|e| eyre!("Invalid path {}: {}", target, e))
}

fn print_status(config: &Config, store: &SqliteStore, queue: &SyncQueue) -> Result<()> {
  println!("Origin: {}", config.origin);
  println!(
    "Current generations: {}",
    config.current_generations().join(", ")
  );

  let names = store.generation_names()?;
  if names.is_empty() {
    println!("No cache generations present (run `install` first)");
  } else {
    println!("Cache generations: {}", names.join(", "));
  }

  for class in &config.sync_classes {
    println!("Pending {} mutations: {}", class, queue.len(class)?);
  }

  Ok(())
}

/// Log to a daily-rotated file under the data directory; RUST_LOG controls
/// the filter. Returns the guard that flushes the writer on shutdown.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("shopflow-offline")
    .join("logs");

  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "shopflow-offline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
