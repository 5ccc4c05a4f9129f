use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the dispatch layer.
#[derive(Debug, Error)]
pub enum DispatchError {
  /// The broker transport could not be reached (after the adapter's own bounded retry).
  #[error("broker unavailable: {0}")]
  BrokerUnavailable(String),

  /// The broker answered, but rejected the operation.
  #[error("broker error: {0}")]
  Broker(String),

  #[error("unknown task: {0}")]
  UnknownTask(String),

  #[error("unknown queue: {0}")]
  UnknownQueue(String),

  #[error("task {0} registered more than once")]
  DuplicateTask(String),

  #[error("task execution failed: {0}")]
  TaskExecution(String),

  #[error("message {message_id} exhausted its retries after {attempts} attempts")]
  RetriesExhausted { message_id: Uuid, attempts: u32 },

  #[error("result for {0} has expired")]
  ResultExpired(Uuid),

  #[error("no result for {0}")]
  NotFound(Uuid),

  #[error("store error: {0}")]
  Store(String),

  #[error("serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("configuration error: {0}")]
  Config(String),
}

impl DispatchError {
  /// Whether a caller-level retry policy may reasonably try again.
  pub fn is_transient(&self) -> bool {
    matches!(self, DispatchError::BrokerUnavailable(_) | DispatchError::Store(_))
  }
}

impl From<sqlx::Error> for DispatchError {
  fn from(e: sqlx::Error) -> Self {
    DispatchError::Store(e.to_string())
  }
}

impl From<sqlx::migrate::MigrateError> for DispatchError {
  fn from(e: sqlx::migrate::MigrateError) -> Self {
    DispatchError::Store(e.to_string())
  }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_display() {
    let id = Uuid::new_v4();
    let err = DispatchError::RetriesExhausted { message_id: id, attempts: 4 };
    assert!(err.to_string().contains("4 attempts"));
    assert!(err.to_string().contains(&id.to_string()));

    let err = DispatchError::UnknownQueue("nope".into());
    assert_eq!(err.to_string(), "unknown queue: nope");
  }

  #[test]
  fn test_transient_classification() {
    assert!(DispatchError::BrokerUnavailable("down".into()).is_transient());
    assert!(!DispatchError::UnknownTask("x".into()).is_transient());
    assert!(!DispatchError::ResultExpired(Uuid::new_v4()).is_transient());
  }
}
