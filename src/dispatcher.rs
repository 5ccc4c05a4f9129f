//! Submission and result side of the dispatch layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::BrokerAdapter;
use crate::error::{DispatchError, Result};
use crate::models::{TaskMessage, TaskResult};
use crate::registry::{QueueRegistry, TaskRegistry};
use crate::router::TaskRouter;
use crate::store::TaskStore;

const RESULT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Dispatcher {
  broker: Arc<dyn BrokerAdapter>,
  store: Arc<dyn TaskStore>,
  queues: Arc<QueueRegistry>,
  router: Arc<TaskRouter>,
  tasks: Arc<TaskRegistry>,
}

impl Dispatcher {
  pub fn new(
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn TaskStore>,
    queues: Arc<QueueRegistry>,
    router: Arc<TaskRouter>,
    tasks: Arc<TaskRegistry>,
  ) -> Self {
    Self {
      broker,
      store,
      queues,
      router,
      tasks,
    }
  }

  pub fn queues(&self) -> &QueueRegistry {
    &self.queues
  }

  pub fn tasks(&self) -> &TaskRegistry {
    &self.tasks
  }

  /// Enqueues `task_name` on its routed queue.
  pub async fn submit(&self, task_name: &str, payload: Value) -> Result<Uuid> {
    self.submit_to(task_name, None, payload).await
  }

  /// Like [`Dispatcher::submit`], with an optional queue override (used by schedule entries).
  pub async fn submit_to(&self, task_name: &str, queue: Option<&str>, payload: Value) -> Result<Uuid> {
    self.tasks.get(task_name)?;
    let queue = match queue {
      Some(queue) => self.queues.get(queue)?.name.as_str(),
      None => self.router.route(task_name),
    };
    let message = TaskMessage::new(task_name, queue, payload);
    let id = self.broker.enqueue(queue, &message).await?;
    info!(message_id = %id, task = %task_name, queue = %queue, "Task submitted");
    Ok(id)
  }

  /// Waits up to `timeout` for the terminal result of `message_id`.
  ///
  /// A result past its TTL is reported as [`DispatchError::ResultExpired`]; nothing at all by the
  /// deadline is [`DispatchError::NotFound`].
  pub async fn get_result(&self, message_id: Uuid, timeout: Duration) -> Result<TaskResult> {
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(result) = self.store.get_result(message_id).await? {
        if result.is_expired(Utc::now()) {
          return Err(DispatchError::ResultExpired(message_id));
        }
        return Ok(result);
      }
      let now = Instant::now();
      if now >= deadline {
        debug!(message_id = %message_id, "No result before deadline");
        return Err(DispatchError::NotFound(message_id));
      }
      tokio::time::sleep((deadline - now).min(RESULT_POLL)).await;
    }
  }
}
