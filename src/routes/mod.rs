use std::convert::Infallible;

use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::app::Services;
use crate::error::DispatchError;

pub mod monitor;
pub mod sse;
pub mod tasks;

/// A dispatch-layer error carried through warp's rejection path.
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl warp::reject::Reject for ApiError {}

/// Malformed request detected before any broker call.
#[derive(Debug)]
pub struct BadRequest {
  pub message: String,
}

impl warp::reject::Reject for BadRequest {}

pub fn reject(e: DispatchError) -> Rejection {
  warp::reject::custom(ApiError(e))
}

pub fn bad_request(message: impl Into<String>) -> Rejection {
  warp::reject::custom(BadRequest { message: message.into() })
}

pub fn with_services(services: Services) -> impl Filter<Extract = (Services,), Error = Infallible> + Clone {
  warp::any().map(move || services.clone())
}

pub fn status_of(e: &DispatchError) -> StatusCode {
  match e {
    DispatchError::UnknownTask(_) | DispatchError::Config(_) => StatusCode::BAD_REQUEST,
    DispatchError::UnknownQueue(_) | DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
    DispatchError::ResultExpired(_) => StatusCode::GONE,
    DispatchError::BrokerUnavailable(_) | DispatchError::Broker(_) | DispatchError::Store(_) => {
      StatusCode::SERVICE_UNAVAILABLE
    }
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(ApiError(e)) = rejection.find::<ApiError>() {
    let status = status_of(e);
    if status.is_server_error() {
      error!(error = %e, "Request failed");
    }
    (status, e.to_string())
  } else if let Some(BadRequest { message }) = rejection.find::<BadRequest>() {
    (StatusCode::BAD_REQUEST, message.clone())
  } else if rejection.is_not_found() {
    (StatusCode::NOT_FOUND, "route not found".to_string())
  } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!(?rejection, "Unhandled rejection");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(
    warp::reply::json(&json!({ "error": message, "status": status.as_u16() })),
    status,
  ))
}

pub fn routes(services: Services) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  tasks::submit_route(services.clone())
    .or(tasks::result_route(services.clone()))
    .or(tasks::progress_route(services.clone()))
    .or(sse::sse_route(services.clone()))
    .or(monitor::monitor_routes(services))
    .recover(handle_rejection)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert_eq!(status_of(&DispatchError::UnknownTask("x".into())), StatusCode::BAD_REQUEST);
    assert_eq!(status_of(&DispatchError::UnknownQueue("nowhere".into())), StatusCode::NOT_FOUND);
    assert_eq!(status_of(&DispatchError::NotFound(uuid::Uuid::nil())), StatusCode::NOT_FOUND);
    assert_eq!(status_of(&DispatchError::ResultExpired(uuid::Uuid::nil())), StatusCode::GONE);
    assert_eq!(status_of(&DispatchError::Broker("down".into())), StatusCode::SERVICE_UNAVAILABLE);
  }
}
