mod app;
mod cache;
mod config;
mod manga;
mod query;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mangashelf")]
#[command(about = "Browse MangaVerse from the terminal with an offline-friendly cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mangashelf/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Ignore fresh cached responses and fetch from the API
  #[arg(short, long)]
  refresh: bool,

  #[command(subcommand)]
  command: app::Command,
}

/// Initialize the tracing subscriber.
///
/// RUST_LOG overrides the configured level. The returned guard flushes the
/// log file and must live until the process exits.
fn init_tracing(config: &config::Config) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => EnvFilter::try_new(&config.log.level)
      .map_err(|e| eyre!("Invalid log level '{}': {}", config.log.level, e))?,
  };

  let Some(path) = &config.log.file else {
    tracing_subscriber::registry()
      .with(fmt::layer().with_writer(io::stderr))
      .with(filter)
      .init();
    return Ok(None);
  };

  let directory = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  };
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config)?;

  if let app::Command::Cache { action } = &args.command {
    return app::run_cache_action(&config, action);
  }

  let app = app::App::new(&config, args.refresh)?;
  app.run(args.command).await
}
