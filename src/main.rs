mod app;
mod cache;
mod config;
mod logging;
mod network;
mod server;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "folio-sw")]
#[command(about = "Offline cache controller for the portfolio site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/folio-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Address to listen on, overriding the config file
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
  /// Install, activate and serve the caching proxy (default)
  #[default]
  Serve,
  /// Populate the current cache generation and drop stale ones, then exit
  Install,
  /// Print cache generations and entry counts
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override listen address if specified on command line
  let config = if let Some(listen) = args.listen {
    config::Config { listen, ..config }
  } else {
    config
  };

  let _guard = logging::init(&config.log, &config.log_directory()?)?;

  let app = app::App::new(config)?;
  match args.command.unwrap_or_default() {
    Command::Serve => app.run().await?,
    Command::Install => print_status(&app.install().await?)?,
    Command::Status => print_status(&app.status()?)?,
  }

  Ok(())
}

fn print_status(status: &worker::ControllerStatus) -> Result<()> {
  let json =
    serde_json::to_string_pretty(status).map_err(|e| eyre!("Failed to render status: {}", e))?;
  println!("{}", json);
  Ok(())
}
