use std::time::Duration;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{reject, with_services};
use crate::app::Services;
use crate::monitor::HealthStatus;

#[derive(Deserialize)]
pub struct WindowQuery {
  pub window_secs: Option<u64>,
}

pub fn monitor_routes(services: Services) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  let health = warp::path!("health")
    .and(warp::get())
    .and(with_services(services.clone()))
    .and_then(handle_health);
  let queues = warp::path!("queues")
    .and(warp::get())
    .and(with_services(services.clone()))
    .and_then(handle_queues);
  let queue = warp::path!("queues" / String)
    .and(warp::get())
    .and(with_services(services.clone()))
    .and_then(handle_queue);
  let workers = warp::path!("workers")
    .and(warp::get())
    .and(with_services(services.clone()))
    .and_then(handle_workers);
  let performance = warp::path!("performance")
    .and(warp::get())
    .and(warp::query::<WindowQuery>())
    .and(with_services(services))
    .and_then(handle_performance);
  health.or(queues).unify().or(queue).unify().or(workers).unify().or(performance).unify()
}

/// Critical health answers 503 so load balancers can act on the status code alone.
async fn handle_health(services: Services) -> Result<warp::reply::Response, Rejection> {
  let health = services.monitor.system_health().await;
  let status = if health.overall_status == HealthStatus::Critical {
    StatusCode::SERVICE_UNAVAILABLE
  } else {
    StatusCode::OK
  };
  Ok(warp::reply::with_status(warp::reply::json(&health), status).into_response())
}

async fn handle_queues(services: Services) -> Result<warp::reply::Response, Rejection> {
  let stats = services.monitor.queue_stats().await.map_err(reject)?;
  Ok(warp::reply::json(&stats).into_response())
}

async fn handle_queue(name: String, services: Services) -> Result<warp::reply::Response, Rejection> {
  let stats = services.monitor.queue_health(&name).await.map_err(reject)?;
  Ok(warp::reply::json(&stats).into_response())
}

async fn handle_workers(services: Services) -> Result<warp::reply::Response, Rejection> {
  let workers = services.monitor.worker_stats().await.map_err(reject)?;
  Ok(warp::reply::json(&workers).into_response())
}

async fn handle_performance(query: WindowQuery, services: Services) -> Result<warp::reply::Response, Rejection> {
  let window = Duration::from_secs(query.window_secs.unwrap_or(3600).max(1));
  let report = services.monitor.performance_report(window).await.map_err(reject)?;
  Ok(warp::reply::json(&report).into_response())
}
