mod cache;
mod clients;
mod config;
mod error;
mod event;
mod http;
mod manifest;
mod network;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheStorage, RegistrationStore, SqliteStorage};
use clients::LocalClients;
use event::EventHandler;
use http::{Request, RequestMode};
use network::{HttpNetwork, Network};
use worker::{FetchOutcome, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "quickmeal-sw")]
#[command(about = "Offline caching worker for the QuickMeal recipe app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/quickmeal-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the app is served from
  #[arg(long)]
  origin: Option<String>,

  /// Cache version to run as
  #[arg(long)]
  cache_version: Option<String>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest and activate the configured version
  Install,
  /// Activate a version that is installed and waiting
  Activate,
  /// Fetch paths through the worker
  Fetch {
    /// Paths or absolute URLs
    #[arg(required = true)]
    paths: Vec<String>,

    /// Treat the requests as page navigations
    #[arg(long)]
    navigate: bool,

    /// Write the body of a single response to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List cache versions and the registration state
  Versions,
  /// Post a JSON message to the worker, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// Request a deferred sync and run it as if connectivity just returned
  Sync { tag: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose)?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override with command line values
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.cache_version {
    config.cache_version = version;
  }

  let options = config.worker_options()?;
  let origin = options.origin.clone();
  let storage = Arc::new(SqliteStorage::open(config.cache_path.as_deref())?);
  let network = Arc::new(HttpNetwork::new(&origin, config.network_timeout())?);
  // This process is an open page of the version active at start
  let clients = Arc::new(LocalClients::with_page(storage.registration()?.active));

  let worker = Arc::new(ServiceWorker::new(
    options,
    Arc::clone(&storage),
    Arc::clone(&network),
    clients,
  )?);
  debug!(version = %worker.version(), state = ?worker.state(), "worker ready");

  let events = EventHandler::spawn(Arc::clone(&worker));

  match args.command {
    Command::Versions => print_versions(storage.as_ref())?,
    Command::Install => {
      let state = events.install().await?;
      println!("{}: {:?}", worker.version(), state);
    }
    Command::Activate => {
      let state = events.activate().await?;
      println!("{}: {:?}", worker.version(), state);
    }
    Command::Fetch {
      paths,
      navigate,
      output,
    } => {
      if output.is_some() && paths.len() != 1 {
        return Err(eyre!("--output needs exactly one path"));
      }

      let requests = paths
        .iter()
        .map(|p| {
          let url = origin.join(p).map_err(|e| eyre!("Invalid path '{}': {}", p, e))?;
          Ok(if navigate {
            Request::navigate(url)
          } else if url.origin() == origin.origin() {
            Request::asset(url)
          } else {
            Request::new("GET", url, RequestMode::Cors)
          })
        })
        .collect::<Result<Vec<_>>>()?;

      // Requests are handled concurrently by the worker
      let outcomes = join_all(requests.iter().map(|r| events.fetch(r.clone()))).await;

      for (request, outcome) in requests.iter().zip(outcomes) {
        let body = match outcome {
          Ok(FetchOutcome::Responded(result)) => {
            let cached = match result.cached_at {
              Some(at) => format!(", cached {}", at.format("%Y-%m-%d %H:%M:%S")),
              None => String::new(),
            };
            println!(
              "{} {} {} bytes [{}{}]",
              request.url,
              result.response.status,
              result.response.body.len(),
              result.source,
              cached
            );
            Some(result.response.body)
          }
          Ok(FetchOutcome::Passthrough) => match network.fetch(request).await {
            Ok(response) => {
              println!(
                "{} {} {} bytes [passthrough]",
                request.url,
                response.status,
                response.body.len()
              );
              Some(response.body)
            }
            Err(e) => {
              println!("{} failed: {}", request.url, e);
              None
            }
          },
          Err(e) => {
            println!("{} failed: {}", request.url, e);
            None
          }
        };

        if let (Some(path), Some(body)) = (output.as_deref(), body) {
          write_body(path, &body)?;
        }
      }
    }
    Command::Message { json } => {
      let data: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Message is not valid JSON: {}", e))?;
      let state = events.post_message(data).await?;
      println!("{}: {:?}", worker.version(), state);
    }
    Command::Sync { tag } => {
      events.request_sync(&tag)?;
      let ran = events.online().await?;
      if ran.is_empty() {
        warn!(%tag, "no sync routine for tag");
        println!("{}: nothing to sync", tag);
      } else {
        for tag in ran {
          println!("{}: synced", tag.as_str());
        }
      }
    }
  }

  events.shutdown().await;
  Ok(())
}

fn print_versions<S: CacheStorage + RegistrationStore>(storage: &S) -> Result<()> {
  let registration = storage.registration()?;
  let versions = storage.list_versions()?;

  if versions.is_empty() {
    println!("no cache versions");
  }
  for version in versions {
    let marker = if registration.active.as_ref() == Some(&version) {
      " (active)"
    } else if registration.waiting.as_ref() == Some(&version) {
      " (waiting)"
    } else {
      ""
    };
    println!(
      "{}{}: {} entries",
      version,
      marker,
      storage.entry_count(&version)?
    );
  }
  Ok(())
}

fn write_body(path: &Path, body: &[u8]) -> Result<()> {
  std::fs::write(path, body).map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))
}

/// Log to stderr at the requested verbosity, and everything at debug to a file
/// in the data directory. `RUST_LOG` overrides the stderr filter.
fn init_tracing(verbose: u8) -> Result<Option<WorkerGuard>> {
  let default = match verbose {
    0 => "quickmeal_sw=warn",
    1 => "quickmeal_sw=info",
    _ => "quickmeal_sw=debug",
  };
  let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .without_time()
    .with_filter(stderr_filter);

  let log_dir = dirs::data_dir().map(|d| d.join("quickmeal-sw"));
  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::never(dir, "quickmeal-sw.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new("quickmeal_sw=debug"));
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .init();

  Ok(guard)
}
