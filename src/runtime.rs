//! Executes one leased message and drives its retry state machine.
//!
//! `pending -> running -> {succeeded, retrying -> pending, failed}`. Every outcome is written to
//! the store before the broker is told (late ack); if that write fails the message is left leased
//! and comes back when the lease runs out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::broker::BrokerAdapter;
use crate::error::{DispatchError, Result};
use crate::models::{AttemptRecord, ResultStatus, TaskMessage, TaskResult};
use crate::registry::TaskRegistry;
use crate::store::TaskStore;
use crate::task::TaskContext;

pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30 * 60);

/// What happened to a message after one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Succeeded { attempt: u32 },
  Retrying { attempt: u32, delay: Duration },
  Failed { attempt: u32, error: String },
}

impl Outcome {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, Outcome::Retrying { .. })
  }
}

pub struct TaskRuntime {
  broker: Arc<dyn BrokerAdapter>,
  store: Arc<dyn TaskStore>,
  tasks: Arc<TaskRegistry>,
  result_ttl: Duration,
  lease: Duration,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

impl TaskRuntime {
  pub fn new(broker: Arc<dyn BrokerAdapter>, store: Arc<dyn TaskStore>, tasks: Arc<TaskRegistry>) -> Self {
    Self {
      broker,
      store,
      tasks,
      result_ttl: DEFAULT_RESULT_TTL,
      lease: DEFAULT_LEASE,
    }
  }

  pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
    self.result_ttl = ttl;
    self
  }

  pub fn with_lease(mut self, lease: Duration) -> Self {
    self.lease = lease;
    self
  }

  pub fn lease(&self) -> Duration {
    self.lease
  }

  pub fn tasks(&self) -> &TaskRegistry {
    &self.tasks
  }

  fn expires_at(&self, completed_at: DateTime<Utc>) -> DateTime<Utc> {
    completed_at + chrono::Duration::from_std(self.result_ttl).unwrap_or(chrono::Duration::hours(1))
  }

  /// Runs `message` once. The caller must hold its lease.
  pub async fn execute(&self, mut message: TaskMessage, worker_id: Option<&str>) -> Result<Outcome> {
    message.attempt_count += 1;
    let attempt = message.attempt_count;
    let started_at = Utc::now();

    let def = match self.tasks.get(&message.task_name) {
      Ok(def) => def,
      Err(e) => {
        error!(message_id = %message.message_id, task = %message.task_name, "No work function registered");
        let error = e.to_string();
        self
          .finish_failed(&message, worker_id, started_at, error.clone(), error.clone())
          .await?;
        return Ok(Outcome::Failed { attempt, error });
      }
    };

    info!(
      message_id = %message.message_id,
      task = %def.name,
      queue = %message.queue,
      attempt,
      "Executing task"
    );
    let ctx = TaskContext::new(
      message.message_id,
      def.name.clone(),
      attempt,
      worker_id.map(str::to_string),
      self.store.clone(),
    );
    let outcome = self.run_with_lease(&message, def.work.execute(message.payload.clone(), ctx)).await;

    match outcome {
      Ok(value) => {
        self.finish_succeeded(&message, worker_id, started_at, value).await?;
        Ok(Outcome::Succeeded { attempt })
      }
      Err(error) if !def.auto_retry => {
        warn!(message_id = %message.message_id, task = %def.name, error = %error, "Task failed, automatic retry disabled");
        self
          .finish_failed(&message, worker_id, started_at, error.clone(), error.clone())
          .await?;
        Ok(Outcome::Failed { attempt, error })
      }
      Err(error) if attempt <= def.max_retries => {
        let delay = def.backoff.delay(attempt);
        warn!(
          message_id = %message.message_id,
          task = %def.name,
          attempt,
          max_retries = def.max_retries,
          delay_ms = delay.as_millis() as u64,
          error = %error,
          "Task failed, retrying"
        );
        self
          .store
          .record_attempt(&AttemptRecord {
            message_id: message.message_id,
            attempt,
            status: ResultStatus::Retrying,
            error: Some(error),
            backoff_ms: Some(delay.as_millis() as u64),
            worker_id: worker_id.map(str::to_string),
            started_at,
            finished_at: Utc::now(),
          })
          .await?;
        self.broker.retry_later(&message, delay).await?;
        Ok(Outcome::Retrying { attempt, delay })
      }
      Err(error) => {
        let exhausted = DispatchError::RetriesExhausted {
          message_id: message.message_id,
          attempts: attempt,
        };
        error!(message_id = %message.message_id, task = %def.name, error = %error, "{exhausted}");
        self
          .finish_failed(&message, worker_id, started_at, error.clone(), format!("{exhausted}: {error}"))
          .await?;
        Ok(Outcome::Failed { attempt, error })
      }
    }
  }

  /// Drives the work future to completion, renewing the lease every half period.
  /// Panics and errors both come back as the error string.
  async fn run_with_lease<F>(&self, message: &TaskMessage, work: F) -> std::result::Result<Value, String>
  where
    F: std::future::Future<Output = anyhow::Result<Value>>,
  {
    let work = AssertUnwindSafe(work).catch_unwind();
    tokio::pin!(work);
    let mut renew = tokio::time::interval((self.lease / 2).max(Duration::from_millis(1)));
    renew.tick().await;
    loop {
      tokio::select! {
        res = &mut work => {
          return match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("work function panicked: {}", panic_message(panic))),
          };
        }
        _ = renew.tick() => {
          if let Err(e) = self.broker.renew_lease(message.message_id, self.lease).await {
            warn!(message_id = %message.message_id, error = %e, "Lease renewal failed");
          }
        }
      }
    }
  }

  async fn finish_succeeded(
    &self,
    message: &TaskMessage,
    worker_id: Option<&str>,
    started_at: DateTime<Utc>,
    value: Value,
  ) -> Result<()> {
    let completed_at = Utc::now();
    self
      .store
      .record_attempt(&AttemptRecord {
        message_id: message.message_id,
        attempt: message.attempt_count,
        status: ResultStatus::Success,
        error: None,
        backoff_ms: None,
        worker_id: worker_id.map(str::to_string),
        started_at,
        finished_at: completed_at,
      })
      .await?;
    self
      .store
      .put_result(&TaskResult {
        message_id: message.message_id,
        task_name: message.task_name.clone(),
        queue: message.queue.clone(),
        status: ResultStatus::Success,
        result_payload: Some(value),
        error_detail: None,
        attempts: message.attempt_count,
        enqueued_at: message.enqueued_at,
        started_at: Some(started_at),
        completed_at,
        expires_at: self.expires_at(completed_at),
        history: Vec::new(),
      })
      .await?;
    if let Err(e) = self.store.set_progress(message.message_id, 100).await {
      warn!(message_id = %message.message_id, error = %e, "Failed to record final progress");
    }
    self.broker.ack(message.message_id).await?;
    info!(message_id = %message.message_id, task = %message.task_name, "Task processed successfully");
    Ok(())
  }

  async fn finish_failed(
    &self,
    message: &TaskMessage,
    worker_id: Option<&str>,
    started_at: DateTime<Utc>,
    attempt_error: String,
    detail: String,
  ) -> Result<()> {
    let completed_at = Utc::now();
    self
      .store
      .record_attempt(&AttemptRecord {
        message_id: message.message_id,
        attempt: message.attempt_count,
        status: ResultStatus::Failed,
        error: Some(attempt_error),
        backoff_ms: None,
        worker_id: worker_id.map(str::to_string),
        started_at,
        finished_at: completed_at,
      })
      .await?;
    self
      .store
      .put_result(&TaskResult {
        message_id: message.message_id,
        task_name: message.task_name.clone(),
        queue: message.queue.clone(),
        status: ResultStatus::Failed,
        result_payload: None,
        error_detail: Some(detail),
        attempts: message.attempt_count,
        enqueued_at: message.enqueued_at,
        started_at: Some(started_at),
        completed_at,
        expires_at: self.expires_at(completed_at),
        history: Vec::new(),
      })
      .await?;
    self.broker.ack(message.message_id).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::MemoryBroker;
  use crate::models::{PriorityTier, QueuePolicy};
  use crate::registry::{QueueRegistry, TaskSpec};
  use crate::router::TaskRouter;
  use crate::store::MemoryTaskStore;
  use crate::task::work_fn;
  use serde_json::json;

  const LEASE: Duration = Duration::from_secs(30);

  struct Fixture {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryTaskStore>,
    runtime: TaskRuntime,
  }

  fn fixture(specs: Vec<TaskSpec>) -> Fixture {
    let queues = QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal).with_retries(3, 1, 4),
      QueuePolicy::new("system", PriorityTier::Low).with_retries(3, 1, 4),
    ])
    .unwrap();
    let router = TaskRouter::new([("backup_course_data", "system")], &queues).unwrap();
    let tasks = Arc::new(
      crate::registry::TaskRegistry::builder()
        .tasks(specs)
        .build(&queues, &router)
        .unwrap(),
    );
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryTaskStore::new());
    let runtime = TaskRuntime::new(broker.clone(), store.clone(), tasks).with_lease(LEASE);
    Fixture { broker, store, runtime }
  }

  async fn next(broker: &MemoryBroker, queue: &str) -> TaskMessage {
    broker
      .dequeue(queue, LEASE, Duration::from_secs(1))
      .await
      .unwrap()
      .expect("message should be visible")
  }

  #[tokio::test]
  async fn test_success_persists_result_then_acks() {
    let f = fixture(vec![TaskSpec::new("echo", work_fn(|p: Value, _| async move { Ok(p) }))]);
    let id = f.broker.enqueue("default", &TaskMessage::new("echo", "default", json!({"a": 1}))).await.unwrap();

    let outcome = f.runtime.execute(next(&f.broker, "default").await, Some("w1")).await.unwrap();
    assert_eq!(outcome, Outcome::Succeeded { attempt: 1 });

    let result = f.store.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.result_payload, Some(json!({"a": 1})));
    assert_eq!(result.expires_at - result.completed_at, chrono::Duration::hours(1));
    assert_eq!(f.store.progress(id).await.unwrap(), Some(100));
    assert_eq!(f.broker.queue_depth("default").await.unwrap().total(), 0);
  }

  #[tokio::test]
  async fn test_always_failing_task_retries_exactly_max_retries() {
    let f = fixture(vec![TaskSpec::new(
      "flaky",
      work_fn(|_: Value, _| async { Err(anyhow::anyhow!("model backend down")) }),
    )]);
    let id = f.broker.enqueue("default", &TaskMessage::new("flaky", "default", json!({}))).await.unwrap();

    let mut retries = 0;
    let mut delays = Vec::new();
    loop {
      match f.runtime.execute(next(&f.broker, "default").await, None).await.unwrap() {
        Outcome::Retrying { delay, .. } => {
          retries += 1;
          delays.push(delay);
        }
        Outcome::Failed { attempt, .. } => {
          assert_eq!(attempt, 4);
          break;
        }
        other => panic!("unexpected outcome {other:?}"),
      }
    }
    assert_eq!(retries, 3);
    assert_eq!(delays, vec![Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(4)]);

    let result = f.store.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.history.len(), 4);
    assert!(result.error_detail.unwrap().contains("exhausted its retries"));
    assert_eq!(f.broker.queue_depth("default").await.unwrap().total(), 0);
  }

  #[tokio::test]
  async fn test_no_auto_retry_fails_immediately() {
    let f = fixture(vec![TaskSpec::new(
      "backup_course_data",
      work_fn(|_: Value, _| async { Err(anyhow::anyhow!("disk full")) }),
    )
    .no_auto_retry()]);
    let id = f
      .broker
      .enqueue("system", &TaskMessage::new("backup_course_data", "system", json!({})))
      .await
      .unwrap();

    let outcome = f.runtime.execute(next(&f.broker, "system").await, None).await.unwrap();
    assert!(matches!(outcome, Outcome::Failed { attempt: 1, .. }));
    let result = f.store.get_result(id).await.unwrap().unwrap();
    assert_eq!(result.error_detail.as_deref(), Some("disk full"));
    assert_eq!(result.history.len(), 1);
  }

  #[tokio::test]
  async fn test_panic_is_a_failure() {
    let f = fixture(vec![TaskSpec::new(
      "boom",
      work_fn(|_: Value, _| async {
        if true {
          panic!("index out of range");
        }
        Ok(Value::Null)
      }),
    )
    .no_auto_retry()]);
    f.broker.enqueue("default", &TaskMessage::new("boom", "default", json!({}))).await.unwrap();
    let outcome = f.runtime.execute(next(&f.broker, "default").await, None).await.unwrap();
    match outcome {
      Outcome::Failed { error, .. } => assert!(error.contains("index out of range")),
      other => panic!("unexpected outcome {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_unknown_task_is_failed_and_acked() {
    let f = fixture(vec![]);
    let id = f.broker.enqueue("default", &TaskMessage::new("ghost", "default", json!({}))).await.unwrap();
    let outcome = f.runtime.execute(next(&f.broker, "default").await, None).await.unwrap();
    assert!(outcome.is_terminal());
    assert_eq!(f.store.get_result(id).await.unwrap().unwrap().status, ResultStatus::Failed);
    assert_eq!(f.broker.queue_depth("default").await.unwrap().total(), 0);
  }
}
