use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use serde_json::json;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::error;
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{bad_request, with_services};
use crate::app::Services;
use crate::store::TaskStore;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

pub fn sse_route(services: Services) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_services(services))
    .and_then(handle_sse)
}

/// Current state of `message_id` as an event, and whether it is final.
async fn progress_event(store: &dyn TaskStore, message_id: Uuid) -> (Event, bool) {
  let progress = match store.progress(message_id).await {
    Ok(progress) => progress,
    Err(e) => {
      error!("Error fetching task progress: {:?}", e);
      None
    }
  };
  let (status, terminal) = match store.get_result(message_id).await {
    Ok(Some(result)) => (result.status.to_string(), result.status.is_terminal()),
    Ok(None) if progress.is_some() => ("running".to_string(), false),
    Ok(None) => ("pending".to_string(), false),
    Err(e) => {
      error!("Error fetching task status: {:?}", e);
      ("unknown".to_string(), false)
    }
  };
  let event = Event::default()
    .event("progress")
    .data(json!({"task_id": message_id, "status": status, "progress": progress}).to_string());
  (event, terminal)
}

async fn handle_sse(query: HashMap<String, String>, services: Services) -> Result<impl Reply, Rejection> {
  let task_id = query.get("task_id").ok_or_else(|| bad_request("Missing task_id"))?;
  let message_id = Uuid::parse_str(task_id).map_err(|_| bad_request(format!("Invalid task_id '{task_id}'")))?;

  let store = services.store.clone();
  let mut finished = false;
  let stream = IntervalStream::new(tokio::time::interval(PROGRESS_INTERVAL))
    .then(move |_| {
      let store = store.clone();
      async move { progress_event(store.as_ref(), message_id).await }
    })
    // Emit the terminal event, then end the stream.
    .take_while(move |(_, terminal)| {
      let keep = !finished;
      finished = *terminal;
      keep
    })
    .map(|(event, _)| Ok::<_, Infallible>(event));

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
