use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::{bad_request, reject, with_services};
use crate::app::Services;

/// Longest a result request may block.
const MAX_RESULT_WAIT: Duration = Duration::from_secs(30);

static TASK_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,127}$").expect("static regex"));

#[derive(Deserialize)]
pub struct NewTask {
  pub task_name: String,
  #[serde(default)]
  pub payload: Option<Value>,
}

#[derive(Serialize)]
pub struct TaskResponse {
  pub message_id: Uuid,
  pub status: String,
  pub result_url: String,
  pub sse_url: String,
}

#[derive(Deserialize)]
pub struct ResultQuery {
  #[serde(default)]
  pub timeout_ms: u64,
}

fn validate(new_task: &NewTask) -> Result<Value, String> {
  if !TASK_NAME_RE.is_match(&new_task.task_name) {
    return Err(format!("Invalid task name '{}'", new_task.task_name));
  }
  match &new_task.payload {
    None | Some(Value::Null) => Ok(json!({})),
    Some(payload @ Value::Object(_)) => Ok(payload.clone()),
    Some(_) => Err("payload must be a JSON object".into()),
  }
}

pub fn submit_route(services: Services) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path("submit")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_services(services))
    .and_then(handle_submit_task)
}

async fn handle_submit_task(new_task: NewTask, services: Services) -> Result<impl Reply, Rejection> {
  let payload = validate(&new_task).map_err(|e| {
    error!("Payload validation failed: {}", e);
    bad_request(e)
  })?;

  let message_id = services
    .dispatcher
    .submit(&new_task.task_name, payload)
    .await
    .map_err(reject)?;

  info!("Task {} submitted successfully", message_id);
  Ok(warp::reply::json(&TaskResponse {
    message_id,
    status: "submitted".into(),
    result_url: format!("/results/{}", message_id),
    sse_url: format!("/sse?task_id={}", message_id),
  }))
}

pub fn result_route(services: Services) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("results" / Uuid)
    .and(warp::get())
    .and(warp::query::<ResultQuery>())
    .and(with_services(services))
    .and_then(handle_get_result)
}

async fn handle_get_result(message_id: Uuid, query: ResultQuery, services: Services) -> Result<impl Reply, Rejection> {
  let timeout = Duration::from_millis(query.timeout_ms).min(MAX_RESULT_WAIT);
  let result = services
    .dispatcher
    .get_result(message_id, timeout)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&result))
}

pub fn progress_route(services: Services) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path!("progress" / Uuid)
    .and(warp::get())
    .and(with_services(services))
    .and_then(handle_progress)
}

async fn handle_progress(message_id: Uuid, services: Services) -> Result<impl Reply, Rejection> {
  let progress = services.monitor.task_progress(message_id).await.map_err(reject)?;
  Ok(warp::reply::json(&json!({ "task_id": message_id, "progress": progress })))
}
