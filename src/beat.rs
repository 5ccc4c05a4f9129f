use anyhow::Context;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qdispatch::{app::Services, config::Config, scheduler::Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Config::from_env().context("invalid configuration")?;
  let services = Services::connect(&config).await.context("failed to start services")?;

  let entries = services.catalog.schedule_entries().context("invalid schedule")?;
  let scheduler = Scheduler::new(entries, services.dispatcher.clone(), services.store.clone())
    .context("schedule names an unknown task or queue")?;

  let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
  let beat = tokio::spawn(scheduler.run(config.beat_poll, shutdown_rx));

  tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
  info!("Shutdown signal received");
  let _ = shutdown_tx.send(());
  beat.await.context("scheduler task panicked")?;
  Ok(())
}
