//! Operational view over the broker and the task store: queue backlog, worker liveness,
//! composite health, performance figures, plus the two destructive operator actions.
//!
//! Everything here is a read against the broker or the store; nothing holds a lock a worker
//! would wait on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, Removal};
use crate::error::{DispatchError, Result};
use crate::models::{
  CancelOutcome, QueueDepth, QueuePolicy, ResultStatus, TaskResult, WorkerStatus,
};
use crate::registry::QueueRegistry;
use crate::runtime::DEFAULT_RESULT_TTL;
use crate::store::TaskStore;

pub const CANCELLED_ERROR: &str = "cancelled before execution";

/// Results written by `cancel_task` rather than by a failed execution.
fn is_cancellation(result: &TaskResult) -> bool {
  result.status == ResultStatus::Failed && result.error_detail.as_deref() == Some(CANCELLED_ERROR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  Warning,
  Critical,
}

impl HealthStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      HealthStatus::Healthy => "healthy",
      HealthStatus::Warning => "warning",
      HealthStatus::Critical => "critical",
    }
  }
}

impl fmt::Display for HealthStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
  pub queue_warning: u64,
  pub queue_critical: u64,
  /// Above this many pending messages across all queues the system needs scaling.
  pub system_backlog_critical: u64,
  pub min_workers: usize,
  pub failure_critical: usize,
  pub worker_stale_after: Duration,
  /// How far back `system_health` looks for failed tasks.
  pub health_window: Duration,
  /// Retention of the result written for a cancelled message.
  pub result_ttl: Duration,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      queue_warning: 500,
      queue_critical: 1000,
      system_backlog_critical: 5000,
      min_workers: 1,
      failure_critical: 25,
      worker_stale_after: Duration::from_secs(60),
      health_window: Duration::from_secs(3600),
      result_ttl: DEFAULT_RESULT_TTL,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
  pub pending_count: u64,
  pub depth: QueueDepth,
  pub policy: QueuePolicy,
  pub health: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
  pub status: WorkerStatus,
  pub active: u32,
  pub scheduled: u32,
  pub reserved: u32,
  pub processed: u64,
  pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
  pub status: HealthStatus,
  pub message: String,
}

impl ComponentHealth {
  fn new(status: HealthStatus, message: impl Into<String>) -> Self {
    Self { status, message: message.into() }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
  pub overall_status: HealthStatus,
  pub components: BTreeMap<String, ComponentHealth>,
  pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
  pub priority: String,
  pub queue: String,
  pub issue: String,
  pub suggestion: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
  pub window_secs: u64,
  pub generated_at: DateTime<Utc>,
  pub completed: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Cancelled before execution; not part of `completed`.
  pub cancelled: usize,
  pub retries: usize,
  pub success_rate: f64,
  pub throughput_per_minute: f64,
  pub average_latency_ms: Option<f64>,
  pub average_execution_ms: Option<f64>,
  pub total_pending: u64,
  pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
  pub queue: String,
  pub purged: u64,
  pub purged_at: DateTime<Utc>,
}

/// Proof that the operator confirmed purging one specific queue.
#[derive(Debug, Clone)]
pub struct PurgeConfirmation {
  queue: String,
}

impl PurgeConfirmation {
  pub fn for_queue(queue: impl Into<String>) -> Self {
    Self { queue: queue.into() }
  }
}

fn average_ms(durations: impl Iterator<Item = Duration>) -> Option<f64> {
  let (sum, n) = durations.fold((0.0, 0usize), |(sum, n), d| (sum + d.as_secs_f64() * 1000.0, n + 1));
  (n > 0).then(|| sum / n as f64)
}

#[derive(Clone)]
pub struct Monitor {
  broker: Arc<dyn BrokerAdapter>,
  store: Arc<dyn TaskStore>,
  queues: Arc<QueueRegistry>,
  config: MonitorConfig,
}

impl Monitor {
  pub fn new(
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn TaskStore>,
    queues: Arc<QueueRegistry>,
    config: MonitorConfig,
  ) -> Self {
    Self {
      broker,
      store,
      queues,
      config,
    }
  }

  pub fn config(&self) -> &MonitorConfig {
    &self.config
  }

  pub fn queues(&self) -> &QueueRegistry {
    &self.queues
  }

  fn classify(&self, pending: u64) -> HealthStatus {
    if pending > self.config.queue_critical {
      HealthStatus::Critical
    } else if pending > self.config.queue_warning {
      HealthStatus::Warning
    } else {
      HealthStatus::Healthy
    }
  }

  pub async fn queue_health(&self, name: &str) -> Result<QueueStats> {
    let policy = self.queues.get(name)?.clone();
    let depth = self.broker.queue_depth(name).await?;
    let pending_count = depth.total();
    Ok(QueueStats {
      pending_count,
      depth,
      policy,
      health: self.classify(pending_count),
    })
  }

  /// Pending (not yet acked) messages per declared queue.
  pub async fn queue_stats(&self) -> Result<BTreeMap<String, QueueStats>> {
    let mut stats = BTreeMap::new();
    for name in self.queues.names() {
      stats.insert(name.to_string(), self.queue_health(name).await?);
    }
    Ok(stats)
  }

  /// Last heartbeat of every known worker. Workers silent for longer than the stale limit are
  /// reported offline.
  pub async fn worker_stats(&self) -> Result<BTreeMap<String, WorkerStats>> {
    let stale = chrono::Duration::from_std(self.config.worker_stale_after).unwrap_or(chrono::Duration::seconds(60));
    let cutoff = Utc::now() - stale;
    Ok(
      self
        .store
        .workers()
        .await?
        .into_iter()
        .map(|w| {
          let status = if w.last_seen < cutoff { WorkerStatus::Offline } else { w.status };
          (
            w.worker_id,
            WorkerStats {
              status,
              active: w.active,
              scheduled: w.scheduled,
              reserved: w.reserved,
              processed: w.processed,
              last_seen: w.last_seen,
            },
          )
        })
        .collect(),
    )
  }

  async fn broker_component(&self) -> ComponentHealth {
    if self.broker.ping().await {
      ComponentHealth::new(HealthStatus::Healthy, format!("{} broker reachable", self.broker.kind()))
    } else {
      ComponentHealth::new(HealthStatus::Critical, format!("{} broker unreachable", self.broker.kind()))
    }
  }

  async fn queues_component(&self) -> ComponentHealth {
    let stats = match self.queue_stats().await {
      Ok(stats) => stats,
      Err(e) => return ComponentHealth::new(HealthStatus::Critical, format!("Queue depth unavailable: {e}")),
    };
    let names_with = |status: HealthStatus| {
      stats
        .iter()
        .filter(|(_, s)| s.health == status)
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
    };
    let critical = names_with(HealthStatus::Critical);
    if !critical.is_empty() {
      return ComponentHealth::new(HealthStatus::Critical, format!("Critical queue load detected: {critical:?}"));
    }
    let high = names_with(HealthStatus::Warning);
    if !high.is_empty() {
      return ComponentHealth::new(HealthStatus::Warning, format!("High queue load detected: {high:?}"));
    }
    ComponentHealth::new(HealthStatus::Healthy, "All queues operating normally")
  }

  async fn workers_component(&self) -> ComponentHealth {
    let workers = match self.worker_stats().await {
      Ok(workers) => workers,
      Err(e) => return ComponentHealth::new(HealthStatus::Critical, format!("Worker status unavailable: {e}")),
    };
    let live = workers.values().filter(|w| w.status != WorkerStatus::Offline).count();
    if live == 0 {
      ComponentHealth::new(HealthStatus::Critical, "No active workers detected")
    } else if live < self.config.min_workers {
      ComponentHealth::new(HealthStatus::Warning, format!("Low worker count: {live}"))
    } else {
      ComponentHealth::new(HealthStatus::Healthy, format!("{live} workers active"))
    }
  }

  async fn tasks_component(&self) -> ComponentHealth {
    let window = chrono::Duration::from_std(self.config.health_window).unwrap_or(chrono::Duration::hours(1));
    let recent = match self.store.recent_results(Utc::now() - window).await {
      Ok(recent) => recent,
      Err(e) => return ComponentHealth::new(HealthStatus::Warning, format!("Task results unavailable: {e}")),
    };
    let failed = recent
      .iter()
      .filter(|r| r.status == ResultStatus::Failed && !is_cancellation(r))
      .count();
    let minutes = self.config.health_window.as_secs() / 60;
    if failed == 0 {
      ComponentHealth::new(HealthStatus::Healthy, format!("No failed tasks in the last {minutes} minutes"))
    } else if failed >= self.config.failure_critical {
      ComponentHealth::new(HealthStatus::Critical, format!("{failed} failed tasks in the last {minutes} minutes"))
    } else {
      ComponentHealth::new(HealthStatus::Warning, format!("{failed} failed tasks in the last {minutes} minutes"))
    }
  }

  /// Healthy only when every component is; otherwise the worst component wins.
  pub async fn system_health(&self) -> SystemHealth {
    let mut components = BTreeMap::new();
    components.insert("broker".to_string(), self.broker_component().await);
    components.insert("queues".to_string(), self.queues_component().await);
    components.insert("workers".to_string(), self.workers_component().await);
    components.insert("tasks".to_string(), self.tasks_component().await);
    let overall_status = components
      .values()
      .map(|c| c.status)
      .max()
      .unwrap_or(HealthStatus::Healthy);
    SystemHealth {
      overall_status,
      components,
      checked_at: Utc::now(),
    }
  }

  /// Drops every ready and delayed message of `name`. Irreversible.
  pub async fn purge_queue(&self, name: &str, confirmation: PurgeConfirmation) -> Result<PurgeReport> {
    if confirmation.queue != name {
      return Err(DispatchError::Config(format!(
        "purge of '{name}' was confirmed for '{}'",
        confirmation.queue
      )));
    }
    let queue = self.queues.get(name)?;
    let purged = self.broker.purge(&queue.name).await?;
    warn!(queue = %name, purged, "Queue purged");
    Ok(PurgeReport {
      queue: name.to_string(),
      purged,
      purged_at: Utc::now(),
    })
  }

  /// Removes `message_id` if no worker holds it yet. A removed message gets a failed result so
  /// anyone waiting on it stops waiting.
  pub async fn cancel_task(&self, message_id: Uuid) -> Result<CancelOutcome> {
    match self.broker.remove_pending(message_id).await? {
      Removal::Removed(message) => {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.result_ttl).unwrap_or(chrono::Duration::hours(1));
        self
          .store
          .put_result(&TaskResult {
            message_id,
            task_name: message.task_name.clone(),
            queue: message.queue.clone(),
            status: ResultStatus::Failed,
            result_payload: None,
            error_detail: Some(CANCELLED_ERROR.to_string()),
            attempts: message.attempt_count,
            enqueued_at: message.enqueued_at,
            started_at: None,
            completed_at: now,
            expires_at: now + ttl,
            history: Vec::new(),
          })
          .await?;
        info!(message_id = %message_id, task = %message.task_name, queue = %message.queue, "Task cancelled");
        Ok(CancelOutcome::Cancelled)
      }
      Removal::Leased => Ok(CancelOutcome::NotCancellable {
        reason: "message is already leased by a worker".into(),
      }),
      Removal::Unsupported(reason) => Ok(CancelOutcome::NotCancellable { reason: reason.into() }),
      Removal::Missing => match self.store.get_result(message_id).await? {
        Some(result) => Ok(CancelOutcome::NotCancellable {
          reason: format!("task already finished with status {}", result.status),
        }),
        None => Ok(CancelOutcome::NotFound),
      },
    }
  }

  pub async fn task_progress(&self, message_id: Uuid) -> Result<Option<u8>> {
    self.store.progress(message_id).await
  }

  /// Throughput and latency over results completed in the last `window`, with backlog advice.
  pub async fn performance_report(&self, window: Duration) -> Result<PerformanceReport> {
    let now = Utc::now();
    let since = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
    let (cancelled, results): (Vec<TaskResult>, Vec<TaskResult>) =
      self.store.recent_results(since).await?.into_iter().partition(is_cancellation);
    let retries = self
      .store
      .attempts_since(since)
      .await?
      .iter()
      .filter(|a| a.status == ResultStatus::Retrying)
      .count();

    let succeeded = results.iter().filter(|r| r.status == ResultStatus::Success).count();
    let failed = results.iter().filter(|r| r.status == ResultStatus::Failed).count();
    let completed = results.len();
    let minutes = (window.as_secs_f64() / 60.0).max(1.0 / 60.0);

    let stats = self.queue_stats().await?;
    let mut recommendations = Vec::new();
    for (name, s) in &stats {
      if s.pending_count > self.config.queue_critical {
        recommendations.push(Recommendation {
          priority: "high".into(),
          queue: name.clone(),
          issue: "High queue backlog".into(),
          suggestion: "Increase worker concurrency or add more workers".into(),
        });
      } else if s.pending_count > self.config.queue_warning {
        recommendations.push(Recommendation {
          priority: "medium".into(),
          queue: name.clone(),
          issue: "Moderate queue backlog".into(),
          suggestion: "Monitor queue and consider scaling if trend continues".into(),
        });
      }
    }
    let total_pending: u64 = stats.values().map(|s| s.pending_count).sum();
    if total_pending > self.config.system_backlog_critical {
      recommendations.push(Recommendation {
        priority: "critical".into(),
        queue: "system".into(),
        issue: "Critical system load".into(),
        suggestion: "Immediate scaling required - add workers and review task efficiency".into(),
      });
    }

    Ok(PerformanceReport {
      window_secs: window.as_secs(),
      generated_at: now,
      completed,
      succeeded,
      failed,
      cancelled: cancelled.len(),
      retries,
      success_rate: if completed == 0 { 0.0 } else { succeeded as f64 / completed as f64 },
      throughput_per_minute: completed as f64 / minutes,
      average_latency_ms: average_ms(results.iter().map(TaskResult::latency)),
      average_execution_ms: average_ms(results.iter().filter_map(TaskResult::execution_time)),
      total_pending,
      recommendations,
    })
  }
}
