use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qdispatch::{app::Services, config::Config, store::run_reaper, worker_pool::WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Config::from_env().context("invalid configuration")?;
  let services = Services::connect(&config).await.context("failed to start services")?;
  let runtime = Arc::new(services.runtime(&config));

  let mut pool = WorkerPool::new(
    config.pool_config(),
    services.broker.clone(),
    services.store.clone(),
    runtime,
    services.queues.clone(),
  );
  pool.start().context("failed to start worker pool")?;

  let (reaper_tx, reaper_rx) = broadcast::channel(1);
  let reaper = tokio::spawn(run_reaper(
    services.store.clone(),
    config.reaper_interval,
    config.reaper_grace,
    config.orphan_idle,
    reaper_rx,
  ));

  tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
  info!("Shutdown signal received");

  let _ = reaper_tx.send(());
  if let Err(e) = pool.shutdown().await {
    error!(error = %e, "Worker pool did not stop cleanly");
  }
  let _ = reaper.await;

  let stats = pool.stats();
  info!(
    completed = stats.completed,
    failed = stats.failed,
    retried = stats.retried,
    success_rate = stats.success_rate(),
    average_ms = stats.average_duration.as_millis() as u64,
    "Worker stopped"
  );
  Ok(())
}
