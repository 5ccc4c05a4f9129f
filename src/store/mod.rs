//! Durable side of the runtime: attempt history, terminal results, progress and worker heartbeats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AttemptRecord, TaskResult, WorkerDescriptor};

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryTaskStore;
pub use self::postgres::PgTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
  fn kind(&self) -> &'static str;

  /// Inserts or replaces the record for `(message_id, attempt)`.
  async fn record_attempt(&self, record: &AttemptRecord) -> Result<()>;

  /// Attempts of one message, ordered by attempt number.
  async fn attempts(&self, message_id: Uuid) -> Result<Vec<AttemptRecord>>;

  /// Attempts that finished at or after `since`, across all messages.
  async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>>;

  /// Stores a terminal result. `history` is not persisted here; it is rebuilt from the attempts.
  async fn put_result(&self, result: &TaskResult) -> Result<()>;

  /// The stored result with `history` attached, expired or not.
  async fn get_result(&self, message_id: Uuid) -> Result<Option<TaskResult>>;

  /// Results completed at or after `since`, without history.
  async fn recent_results(&self, since: DateTime<Utc>) -> Result<Vec<TaskResult>>;

  /// Deletes results (and their attempts and progress) whose `expires_at` is before `cutoff`.
  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

  /// Deletes attempts and progress of messages that have no result and no activity since
  /// `idle_before`, such as messages purged or lost between retries. Returns the number of
  /// messages cleared.
  async fn purge_orphans(&self, idle_before: DateTime<Utc>) -> Result<u64>;

  async fn set_progress(&self, message_id: Uuid, progress: u8) -> Result<()>;

  async fn progress(&self, message_id: Uuid) -> Result<Option<u8>>;

  async fn heartbeat(&self, worker: &WorkerDescriptor) -> Result<()>;

  async fn remove_worker(&self, worker_id: &str) -> Result<()>;

  async fn workers(&self) -> Result<Vec<WorkerDescriptor>>;
}

/// Opens the Postgres store when a database URL is configured, the in-memory one otherwise.
pub async fn connect(database_url: Option<&str>) -> Result<Arc<dyn TaskStore>> {
  let store: Arc<dyn TaskStore> = match database_url {
    Some(url) => Arc::new(PgTaskStore::connect(url).await?),
    None => Arc::new(MemoryTaskStore::new()),
  };
  info!(kind = store.kind(), "Task store ready");
  Ok(store)
}

/// Deletes expired results every `interval` until shutdown. Results stay readable (as expired)
/// for `grace` past their TTL before they are removed. Attempt history and progress of messages
/// that never got a result are removed once idle for `orphan_idle`.
pub async fn run_reaper(
  store: Arc<dyn TaskStore>,
  interval: Duration,
  grace: Duration,
  orphan_idle: Duration,
  mut shutdown: broadcast::Receiver<()>,
) {
  let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
  let orphan_idle = chrono::Duration::from_std(orphan_idle).unwrap_or(chrono::Duration::zero());
  let mut ticker = tokio::time::interval(interval);
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        let now = Utc::now();
        match store.purge_expired(now - grace).await {
          Ok(0) => {}
          Ok(n) => info!(removed = n, "Reaped expired results"),
          Err(e) => error!(error = %e, "Result reaper failed"),
        }
        match store.purge_orphans(now - orphan_idle).await {
          Ok(0) => {}
          Ok(n) => info!(messages = n, "Reaped orphaned attempt history"),
          Err(e) => error!(error = %e, "Orphan reaper failed"),
        }
      }
      _ = shutdown.recv() => {
        info!("Result reaper stopping");
        break;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::ResultStatus;

  #[tokio::test]
  async fn test_reaper_removes_expired_and_stops() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let now = Utc::now();
    let id = Uuid::new_v4();
    store
      .put_result(&TaskResult {
        message_id: id,
        task_name: "cleanup_expired_sessions".into(),
        queue: "system".into(),
        status: ResultStatus::Success,
        result_payload: None,
        error_detail: None,
        attempts: 1,
        enqueued_at: now - chrono::Duration::hours(3),
        started_at: None,
        completed_at: now - chrono::Duration::hours(2),
        expires_at: now - chrono::Duration::hours(1),
        history: Vec::new(),
      })
      .await
      .unwrap();

    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(run_reaper(
      store.clone(),
      Duration::from_millis(10),
      Duration::ZERO,
      Duration::from_secs(3600),
      rx,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(()).unwrap();
    handle.await.unwrap();

    assert!(store.get_result(id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_connect_without_database_uses_memory() {
    let store = connect(None).await.unwrap();
    assert_eq!(store.kind(), "memory");
  }
}
