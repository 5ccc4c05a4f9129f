//! The work-function seam: what the dispatch core invokes for each message.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::store::TaskStore;

/// Handed to a work function for the duration of one attempt.
#[derive(Clone)]
pub struct TaskContext {
  pub message_id: Uuid,
  pub task_name: String,
  pub attempt: u32,
  pub worker_id: Option<String>,
  store: Arc<dyn TaskStore>,
}

impl TaskContext {
  pub fn new(
    message_id: Uuid,
    task_name: impl Into<String>,
    attempt: u32,
    worker_id: Option<String>,
    store: Arc<dyn TaskStore>,
  ) -> Self {
    Self {
      message_id,
      task_name: task_name.into(),
      attempt,
      worker_id,
      store,
    }
  }

  /// Publishes the latest progress (clamped to 100). Failures are logged, never fatal to the task.
  pub async fn report_progress(&self, progress: u8) {
    let progress = progress.min(100);
    if let Err(e) = self.store.set_progress(self.message_id, progress).await {
      warn!(message_id = %self.message_id, error = %e, "Failed to record progress");
    }
  }
}

/// A registered unit of work. Errors drive the retry state machine.
#[async_trait]
pub trait WorkFunction: Send + Sync {
  async fn execute(&self, payload: Value, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`WorkFunction`].
pub struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> WorkFunction for FnWork<F>
where
  F: Fn(Value, TaskContext) -> Fut + Send + Sync,
  Fut: Future<Output = anyhow::Result<Value>> + Send,
{
  async fn execute(&self, payload: Value, ctx: TaskContext) -> anyhow::Result<Value> {
    (self.0)(payload, ctx).await
  }
}

pub fn work_fn<F, Fut>(f: F) -> Arc<dyn WorkFunction>
where
  F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
  Arc::new(FnWork(f))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryTaskStore;
  use serde_json::json;

  #[tokio::test]
  async fn test_closure_work_and_progress_clamp() {
    let store = Arc::new(MemoryTaskStore::new());
    let work = work_fn(|payload: Value, ctx: TaskContext| async move {
      ctx.report_progress(250).await;
      Ok(json!({"echo": payload}))
    });
    let id = Uuid::new_v4();
    let ctx = TaskContext::new(id, "echo", 1, None, store.clone());
    let out = work.execute(json!(7), ctx).await.unwrap();
    assert_eq!(out, json!({"echo": 7}));
    assert_eq!(store.progress(id).await.unwrap(), Some(100));
  }
}
