use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use super::TaskStore;
use crate::error::{DispatchError, Result};
use crate::models::{AttemptRecord, ResultStatus, TaskResult, WorkerDescriptor, WorkerStatus};

static MIGRATOR: Migrator = sqlx::migrate!();

const RESULT_COLUMNS: &str = "message_id, task_name, queue, status, result_payload, error_detail, attempts, \
                              enqueued_at, started_at, completed_at, expires_at";

const ATTEMPT_COLUMNS: &str = "message_id, attempt, status, error, backoff_ms, worker_id, started_at, finished_at";

fn status_of(row: &PgRow) -> Result<ResultStatus> {
  let raw: String = row.try_get("status")?;
  ResultStatus::parse(&raw).ok_or_else(|| DispatchError::Store(format!("unknown result status '{raw}'")))
}

fn result_from_row(row: &PgRow) -> Result<TaskResult> {
  Ok(TaskResult {
    message_id: row.try_get("message_id")?,
    task_name: row.try_get("task_name")?,
    queue: row.try_get("queue")?,
    status: status_of(row)?,
    result_payload: row.try_get("result_payload")?,
    error_detail: row.try_get("error_detail")?,
    attempts: row.try_get::<i32, _>("attempts")? as u32,
    enqueued_at: row.try_get("enqueued_at")?,
    started_at: row.try_get("started_at")?,
    completed_at: row.try_get("completed_at")?,
    expires_at: row.try_get("expires_at")?,
    history: Vec::new(),
  })
}

fn attempt_from_row(row: &PgRow) -> Result<AttemptRecord> {
  Ok(AttemptRecord {
    message_id: row.try_get("message_id")?,
    attempt: row.try_get::<i32, _>("attempt")? as u32,
    status: status_of(row)?,
    error: row.try_get("error")?,
    backoff_ms: row.try_get::<Option<i64>, _>("backoff_ms")?.map(|ms| ms as u64),
    worker_id: row.try_get("worker_id")?,
    started_at: row.try_get("started_at")?,
    finished_at: row.try_get("finished_at")?,
  })
}

fn worker_from_row(row: &PgRow) -> Result<WorkerDescriptor> {
  let status: String = row.try_get("status")?;
  Ok(WorkerDescriptor {
    worker_id: row.try_get("worker_id")?,
    status: WorkerStatus::parse(&status),
    active: row.try_get::<i32, _>("active")? as u32,
    scheduled: row.try_get::<i32, _>("scheduled")? as u32,
    reserved: row.try_get::<i32, _>("reserved")? as u32,
    processed: row.try_get::<i64, _>("processed")? as u64,
    last_seen: row.try_get("last_seen")?,
  })
}

/// PostgreSQL store. Schema lives in `migrations/` and is applied on connect.
pub struct PgTaskStore {
  pool: Pool<Postgres>,
}

impl PgTaskStore {
  pub async fn connect(database_url: &str) -> Result<Self> {
    let pool = Pool::<Postgres>::connect(database_url).await?;
    MIGRATOR.run(&pool).await?;
    info!("Database migrations complete");
    Ok(Self { pool })
  }

  pub fn pool(&self) -> &Pool<Postgres> {
    &self.pool
  }
}

#[async_trait]
impl TaskStore for PgTaskStore {
  fn kind(&self) -> &'static str {
    "postgres"
  }

  async fn record_attempt(&self, record: &AttemptRecord) -> Result<()> {
    sqlx::query(
      "INSERT INTO task_attempts (message_id, attempt, status, error, backoff_ms, worker_id, started_at, finished_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
       ON CONFLICT (message_id, attempt) DO UPDATE
       SET status = EXCLUDED.status, error = EXCLUDED.error, backoff_ms = EXCLUDED.backoff_ms,
           worker_id = EXCLUDED.worker_id, started_at = EXCLUDED.started_at, finished_at = EXCLUDED.finished_at",
    )
    .bind(record.message_id)
    .bind(record.attempt as i32)
    .bind(record.status.as_str())
    .bind(&record.error)
    .bind(record.backoff_ms.map(|ms| ms as i64))
    .bind(&record.worker_id)
    .bind(record.started_at)
    .bind(record.finished_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn attempts(&self, message_id: Uuid) -> Result<Vec<AttemptRecord>> {
    let rows = sqlx::query(&format!(
      "SELECT {ATTEMPT_COLUMNS} FROM task_attempts WHERE message_id = $1 ORDER BY attempt"
    ))
    .bind(message_id)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(attempt_from_row).collect()
  }

  async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>> {
    let rows = sqlx::query(&format!(
      "SELECT {ATTEMPT_COLUMNS} FROM task_attempts WHERE finished_at >= $1 ORDER BY finished_at"
    ))
    .bind(since)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(attempt_from_row).collect()
  }

  async fn put_result(&self, result: &TaskResult) -> Result<()> {
    sqlx::query(
      "INSERT INTO task_results (message_id, task_name, queue, status, result_payload, error_detail, attempts,
                                 enqueued_at, started_at, completed_at, expires_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
       ON CONFLICT (message_id) DO UPDATE
       SET status = EXCLUDED.status, result_payload = EXCLUDED.result_payload,
           error_detail = EXCLUDED.error_detail, attempts = EXCLUDED.attempts,
           started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at,
           expires_at = EXCLUDED.expires_at",
    )
    .bind(result.message_id)
    .bind(&result.task_name)
    .bind(&result.queue)
    .bind(result.status.as_str())
    .bind(&result.result_payload)
    .bind(&result.error_detail)
    .bind(result.attempts as i32)
    .bind(result.enqueued_at)
    .bind(result.started_at)
    .bind(result.completed_at)
    .bind(result.expires_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_result(&self, message_id: Uuid) -> Result<Option<TaskResult>> {
    let row = sqlx::query(&format!("SELECT {RESULT_COLUMNS} FROM task_results WHERE message_id = $1"))
      .bind(message_id)
      .fetch_optional(&self.pool)
      .await?;
    let Some(row) = row else {
      return Ok(None);
    };
    let mut result = result_from_row(&row)?;
    result.history = self.attempts(message_id).await?;
    Ok(Some(result))
  }

  async fn recent_results(&self, since: DateTime<Utc>) -> Result<Vec<TaskResult>> {
    let rows = sqlx::query(&format!(
      "SELECT {RESULT_COLUMNS} FROM task_results WHERE completed_at >= $1 ORDER BY completed_at"
    ))
    .bind(since)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(result_from_row).collect()
  }

  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
    let mut tx = self.pool.begin().await?;
    let expired: Vec<Uuid> = sqlx::query("DELETE FROM task_results WHERE expires_at < $1 RETURNING message_id")
      .bind(cutoff)
      .fetch_all(&mut *tx)
      .await?
      .iter()
      .map(|row| row.try_get::<Uuid, _>("message_id"))
      .collect::<std::result::Result<_, _>>()?;
    if !expired.is_empty() {
      sqlx::query("DELETE FROM task_attempts WHERE message_id = ANY($1)")
        .bind(&expired)
        .execute(&mut *tx)
        .await?;
      sqlx::query("DELETE FROM task_progress WHERE message_id = ANY($1)")
        .bind(&expired)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(expired.len() as u64)
  }

  async fn purge_orphans(&self, idle_before: DateTime<Utc>) -> Result<u64> {
    let mut tx = self.pool.begin().await?;
    let orphans: Vec<Uuid> = sqlx::query(
      "WITH activity AS (
         SELECT message_id, finished_at AS seen_at FROM task_attempts
         UNION ALL
         SELECT message_id, updated_at FROM task_progress
       )
       SELECT a.message_id FROM activity a
       WHERE NOT EXISTS (SELECT 1 FROM task_results r WHERE r.message_id = a.message_id)
       GROUP BY a.message_id
       HAVING MAX(a.seen_at) < $1",
    )
    .bind(idle_before)
    .fetch_all(&mut *tx)
    .await?
    .iter()
    .map(|row| row.try_get::<Uuid, _>("message_id"))
    .collect::<std::result::Result<_, _>>()?;
    if !orphans.is_empty() {
      sqlx::query("DELETE FROM task_attempts WHERE message_id = ANY($1)")
        .bind(&orphans)
        .execute(&mut *tx)
        .await?;
      sqlx::query("DELETE FROM task_progress WHERE message_id = ANY($1)")
        .bind(&orphans)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(orphans.len() as u64)
  }

  async fn set_progress(&self, message_id: Uuid, progress: u8) -> Result<()> {
    sqlx::query(
      "INSERT INTO task_progress (message_id, progress, updated_at) VALUES ($1, $2, NOW())
       ON CONFLICT (message_id) DO UPDATE SET progress = EXCLUDED.progress, updated_at = NOW()",
    )
    .bind(message_id)
    .bind(progress.min(100) as i16)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn progress(&self, message_id: Uuid) -> Result<Option<u8>> {
    let row = sqlx::query("SELECT progress FROM task_progress WHERE message_id = $1")
      .bind(message_id)
      .fetch_optional(&self.pool)
      .await?;
    match row {
      Some(row) => Ok(Some(row.try_get::<i16, _>("progress")?.clamp(0, 100) as u8)),
      None => Ok(None),
    }
  }

  async fn heartbeat(&self, worker: &WorkerDescriptor) -> Result<()> {
    sqlx::query(
      "INSERT INTO worker_nodes (worker_id, status, active, scheduled, reserved, processed, last_seen)
       VALUES ($1, $2, $3, $4, $5, $6, $7)
       ON CONFLICT (worker_id) DO UPDATE
       SET status = EXCLUDED.status, active = EXCLUDED.active, scheduled = EXCLUDED.scheduled,
           reserved = EXCLUDED.reserved, processed = EXCLUDED.processed, last_seen = EXCLUDED.last_seen",
    )
    .bind(&worker.worker_id)
    .bind(worker.status.as_str())
    .bind(worker.active as i32)
    .bind(worker.scheduled as i32)
    .bind(worker.reserved as i32)
    .bind(worker.processed as i64)
    .bind(worker.last_seen)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn remove_worker(&self, worker_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM worker_nodes WHERE worker_id = $1")
      .bind(worker_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn workers(&self) -> Result<Vec<WorkerDescriptor>> {
    let rows = sqlx::query(
      "SELECT worker_id, status, active, scheduled, reserved, processed, last_seen
       FROM worker_nodes ORDER BY worker_id",
    )
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(worker_from_row).collect()
  }
}
