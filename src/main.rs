use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;

use qdispatch::{app::Services, config::Config, routes::routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Config::from_env().context("invalid configuration")?;
  let services = Services::connect(&config).await.context("failed to start services")?;

  let api = routes(services).with(warp::trace::request());

  info!(port = config.server_port, "API listening");
  let (_, server) = warp::serve(api).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
  });
  server.await;
  Ok(())
}
