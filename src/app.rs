use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::network::{HttpNetwork, Network};
use crate::server;
use crate::worker::{ControllerConfig, ControllerStatus, OfflineCacheController};

type Controller = OfflineCacheController<SqliteStorage, HttpNetwork>;

/// Main application: one controller, its storage, and the proxy in front.
pub struct App {
  config: Config,
  controller: Arc<Controller>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let storage = SqliteStorage::open(&config.cache_path()?)?;
    let network = HttpNetwork::new()?;
    let controller_config = ControllerConfig::from_config(&config)?;

    let controller = Arc::new(OfflineCacheController::new(
      controller_config,
      Arc::new(storage),
      Arc::new(network),
    ));

    Ok(Self { config, controller })
  }

  /// Serve until Ctrl-C. Requests pass through untouched until the
  /// controller has installed and activated.
  pub async fn run(&self) -> Result<()> {
    let listener = server::bind(self.config.listen).await?;

    let retry = Duration::from_secs(self.config.install_retry_secs.max(1));
    let lifecycle = tokio::spawn(drive_lifecycle(Arc::clone(&self.controller), retry));

    let served = server::serve(listener, Arc::clone(&self.controller), shutdown_signal()).await;

    lifecycle.abort();
    self.controller.wait_for_pending_writes().await;
    info!("shut down");

    served
  }

  /// One install + activation pass, without serving.
  pub async fn install(&self) -> Result<ControllerStatus> {
    let deleted = start(&self.controller).await?;
    for name in &deleted {
      info!(generation = %name, "deleted");
    }
    self.controller.status()
  }

  pub fn status(&self) -> Result<ControllerStatus> {
    self.controller.status()
  }
}

/// Serve whatever generation is already on disk, then install and
/// activate, retrying failed installs every `retry`.
async fn drive_lifecycle<S, N>(controller: Arc<OfflineCacheController<S, N>>, retry: Duration)
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  if let Err(e) = controller.resume() {
    warn!("could not read cached generations: {}", e);
  }

  loop {
    match start(&controller).await {
      Ok(_) => break,
      Err(e) => {
        warn!(
          "controller not active, retrying install in {}s: {}",
          retry.as_secs(),
          e
        );
        tokio::time::sleep(retry).await;
      }
    }
  }
}

/// Install, then activate right away when skip-waiting was requested.
/// Returns the generations deleted on activation.
async fn start<S, N>(controller: &OfflineCacheController<S, N>) -> Result<Vec<String>>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  controller.install().await?;
  if controller.wants_activation() {
    controller.activate().await
  } else {
    Ok(Vec::new())
  }
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("failed to listen for Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
}
