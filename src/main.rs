use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use r9s::cache::CacheStorage;
use r9s::config::Config;
use r9s::rally::{ApiError, CachedRallyClient, QueryBuilder, RallyApi, RallyClient};

#[derive(Parser, Debug)]
#[command(name = "r9s")]
#[command(about = "A terminal client for Rally, inspired by k9s")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/r9s/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Rally workspace name
  #[arg(short, long)]
  workspace: Option<String>,

  /// Rally project name
  #[arg(short, long)]
  project: Option<String>,

  /// Raw WSAPI query, e.g. '(ScheduleState = "Defined")'
  #[arg(short, long, conflicts_with_all = ["iteration", "owner", "state", "backlog"])]
  query: Option<String>,

  /// Only tickets in this iteration
  #[arg(long)]
  iteration: Option<String>,

  /// Only tickets owned by this user (display name)
  #[arg(long)]
  owner: Option<String>,

  /// Only tickets in this schedule state
  #[arg(long)]
  state: Option<String>,

  /// Only tickets without an iteration
  #[arg(long)]
  backlog: bool,

  /// Ignore the local snapshot and fetch from Rally
  #[arg(long)]
  refresh: bool,

  /// Disable the local cache for this run
  #[arg(long)]
  no_cache: bool,

  /// Delete the local cache before running
  #[arg(long)]
  clear_cache: bool,
}

impl Args {
  fn query(&self) -> Option<String> {
    if let Some(query) = &self.query {
      return Some(query.clone());
    }
    let mut builder = QueryBuilder::new();
    if let Some(iteration) = &self.iteration {
      builder = builder.iteration(iteration);
    }
    if self.backlog {
      builder = builder.backlog();
    }
    if let Some(owner) = &self.owner {
      builder = builder.owner(owner);
    }
    if let Some(state) = &self.state {
      builder = builder.state(state);
    }
    builder.build()
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(workspace) = &args.workspace {
    config.rally.workspace = Some(workspace.clone());
  }
  if let Some(project) = &args.project {
    config.rally.project = Some(project.clone());
  }
  if args.no_cache {
    config.cache.enabled = false;
  }

  let cache_dir = config.cache.resolve_dir()?;
  let _log_guard = init_logging(&cache_dir)?;

  let api_key = Config::get_api_key()?;
  let client = RallyClient::connect(&config, &api_key)
    .await
    .map_err(report)?;

  if config.cache.enabled {
    let client = CachedRallyClient::open(client, &config.cache)?;
    info!("Using ticket cache at {}", client.cache_dir().display());
    run(client, &args).await
  } else {
    run(CachedRallyClient::uncached(client), &args).await
  }
}

async fn run<S: CacheStorage>(client: CachedRallyClient<RallyClient, S>, args: &Args) -> Result<()> {
  if args.clear_cache {
    client.clear_cache()?;
    info!("Cache cleared");
  }

  let query = args.query();
  let result = if args.refresh && query.is_none() {
    client.refresh_cache().await
  } else {
    client.get_tickets_with_status(query.as_deref()).await
  }
  .map_err(report)?;

  let age = result
    .age_minutes
    .map(|m| format!(", {} min old", m))
    .unwrap_or_default();
  println!(
    "{} / {} [{}{}] {} ticket(s)",
    client.workspace(),
    client.project(),
    result.status,
    age,
    result.data.len()
  );

  for ticket in &result.data {
    println!(
      "{:<10} {:<12} {:<20} {:<16} {}",
      ticket.formatted_id,
      ticket.state,
      ticket.owner.as_deref().unwrap_or("-"),
      ticket.iteration.as_deref().unwrap_or("(backlog)"),
      ticket.name
    );
  }

  if result.is_stale && client.should_refresh() {
    eprintln!("Cached data is stale; run with --refresh to update it.");
  }
  Ok(())
}

fn report(e: ApiError) -> color_eyre::Report {
  eyre!("{}", e.user_message())
}

/// Log to `r9s.log` in the cache directory so stdout stays clean.
///
/// The filter comes from `R9S_LOG` (default `info`).
fn init_logging(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(dir, "r9s.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("R9S_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
