use std::fmt;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Coarse service class of a queue. Workers drain `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
  Low,
  Normal,
  High,
}

impl fmt::Display for PriorityTier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PriorityTier::Low => write!(f, "low"),
      PriorityTier::Normal => write!(f, "normal"),
      PriorityTier::High => write!(f, "high"),
    }
  }
}

fn default_max_retries() -> u32 {
  3
}

fn default_min_backoff_ms() -> u64 {
  1_000
}

fn default_max_backoff_ms() -> u64 {
  900_000
}

fn default_priority() -> PriorityTier {
  PriorityTier::Normal
}

/// Static per-queue policy. Loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
  pub name: String,
  #[serde(default)]
  pub exchange: String,
  #[serde(default)]
  pub routing_key: String,
  #[serde(default)]
  pub description: String,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_min_backoff_ms")]
  pub min_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
  #[serde(default = "default_priority")]
  pub priority: PriorityTier,
}

impl QueuePolicy {
  pub fn new(name: impl Into<String>, priority: PriorityTier) -> Self {
    let name = name.into();
    Self {
      exchange: name.clone(),
      routing_key: name.clone(),
      name,
      description: String::new(),
      max_retries: default_max_retries(),
      min_backoff_ms: default_min_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
      priority,
    }
  }

  pub fn with_retries(mut self, max_retries: u32, min_backoff_ms: u64, max_backoff_ms: u64) -> Self {
    self.max_retries = max_retries;
    self.min_backoff_ms = min_backoff_ms;
    self.max_backoff_ms = max_backoff_ms;
    self
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Fills exchange/routing key from the queue name when a config file left them out.
  pub(crate) fn normalized(mut self) -> Self {
    if self.exchange.is_empty() {
      self.exchange = self.name.clone();
    }
    if self.routing_key.is_empty() {
      self.routing_key = self.name.clone();
    }
    self
  }

  pub fn min_backoff(&self) -> Duration {
    Duration::from_millis(self.min_backoff_ms)
  }

  pub fn max_backoff(&self) -> Duration {
    Duration::from_millis(self.max_backoff_ms)
  }
}

/// A unit of work travelling through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
  pub message_id: Uuid,
  pub task_name: String,
  pub queue: String,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  /// Number of executions started so far. Zero until the first execution begins.
  pub attempt_count: u32,
  /// Set on retried messages; brokers keep the message invisible until then.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_before: Option<DateTime<Utc>>,
}

impl TaskMessage {
  pub fn new(task_name: impl Into<String>, queue: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      message_id: Uuid::new_v4(),
      task_name: task_name.into(),
      queue: queue.into(),
      payload,
      enqueued_at: Utc::now(),
      attempt_count: 0,
      not_before: None,
    }
  }

  pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
    self.not_before.map_or(true, |at| at <= now)
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(self)
  }

  pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(data)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
  Success,
  Failed,
  Retrying,
}

impl ResultStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, ResultStatus::Retrying)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ResultStatus::Success => "success",
      ResultStatus::Failed => "failed",
      ResultStatus::Retrying => "retrying",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "success" => Some(ResultStatus::Success),
      "failed" => Some(ResultStatus::Failed),
      "retrying" => Some(ResultStatus::Retrying),
      _ => None,
    }
  }
}

impl fmt::Display for ResultStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One execution of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
  pub message_id: Uuid,
  pub attempt: u32,
  pub status: ResultStatus,
  pub error: Option<String>,
  /// Delay chosen before the next attempt, when this attempt led to a retry.
  pub backoff_ms: Option<u64>,
  pub worker_id: Option<String>,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
}

/// Terminal outcome of a message, retained until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
  pub message_id: Uuid,
  pub task_name: String,
  pub queue: String,
  pub status: ResultStatus,
  pub result_payload: Option<serde_json::Value>,
  pub error_detail: Option<String>,
  pub attempts: u32,
  pub enqueued_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  #[serde(default)]
  pub history: Vec<AttemptRecord>,
}

impl TaskResult {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }

  /// Enqueue to completion.
  pub fn latency(&self) -> Duration {
    (self.completed_at - self.enqueued_at).to_std().unwrap_or_default()
  }

  /// Start of the final attempt to completion.
  pub fn execution_time(&self) -> Option<Duration> {
    self.started_at.map(|started| (self.completed_at - started).to_std().unwrap_or_default())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
  Idle,
  Busy,
  Offline,
}

impl WorkerStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerStatus::Idle => "idle",
      WorkerStatus::Busy => "busy",
      WorkerStatus::Offline => "offline",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "idle" => WorkerStatus::Idle,
      "busy" => WorkerStatus::Busy,
      _ => WorkerStatus::Offline,
    }
  }
}

impl fmt::Display for WorkerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Heartbeat of one executor, as published to the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
  pub worker_id: String,
  pub status: WorkerStatus,
  pub active: u32,
  pub scheduled: u32,
  pub reserved: u32,
  pub processed: u64,
  pub last_seen: DateTime<Utc>,
}

/// Not-yet-acked messages of one queue, by visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
  pub ready: u64,
  pub delayed: u64,
  pub leased: u64,
}

impl QueueDepth {
  pub fn total(&self) -> u64 {
    self.ready + self.delayed + self.leased
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
  Cancelled,
  NotCancellable { reason: String },
  NotFound,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_policy_from_partial_toml_fields() {
    let policy: QueuePolicy = serde_json::from_value(json!({"name": "search", "priority": "low"})).unwrap();
    let policy = policy.normalized();
    assert_eq!(policy.exchange, "search");
    assert_eq!(policy.routing_key, "search");
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.priority, PriorityTier::Low);
  }

  #[test]
  fn test_priority_order() {
    assert!(PriorityTier::High > PriorityTier::Normal);
    assert!(PriorityTier::Normal > PriorityTier::Low);
  }

  #[test]
  fn test_message_readiness() {
    let now = Utc::now();
    let mut msg = TaskMessage::new("summarize", "ai_content", json!({}));
    assert!(msg.is_ready(now));
    msg.not_before = Some(now + chrono::Duration::seconds(5));
    assert!(!msg.is_ready(now));
  }

  #[test]
  fn test_cancel_outcome_shape() {
    let v = serde_json::to_value(CancelOutcome::NotCancellable { reason: "leased".into() }).unwrap();
    assert_eq!(v["outcome"], "not_cancellable");
    assert_eq!(v["reason"], "leased");
  }
}
