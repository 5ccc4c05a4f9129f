use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::DEFAULT_PREFIX;
use crate::error::{DispatchError, Result};
use crate::monitor::MonitorConfig;
use crate::runtime::{DEFAULT_LEASE, DEFAULT_RESULT_TTL};
use crate::worker_pool::WorkerPoolConfig;

/// Process settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
  pub broker_url: String,
  /// Results live in memory when unset.
  pub database_url: Option<String>,
  pub server_port: u16,
  pub key_prefix: String,
  pub catalog_path: Option<PathBuf>,
  pub worker_id: String,
  pub concurrency: usize,
  pub prefetch: usize,
  pub max_tasks_per_executor: u64,
  pub worker_queues: Option<Vec<String>>,
  pub lease: Duration,
  pub result_ttl: Duration,
  pub reaper_interval: Duration,
  pub reaper_grace: Duration,
  /// Attempt history of messages that never got a result is dropped after this long idle.
  pub orphan_idle: Duration,
  pub beat_poll: Duration,
  /// Pause between the processing stages of the built-in work functions.
  pub task_step_delay: Duration,
  pub queue_warning: u64,
  pub queue_critical: u64,
  pub min_workers: usize,
  pub failure_critical: usize,
  pub worker_stale_after: Duration,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse()
      .map_err(|_| DispatchError::Config(format!("{key} has an invalid value '{raw}'"))),
    None => Ok(default),
  }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
  parsed(lookup, key, default.as_secs()).map(Duration::from_secs)
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let lookup = &lookup;
    let worker_queues = lookup("WORKER_QUEUES").map(|raw| {
      raw
        .split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>()
    });

    let config = Self {
      broker_url: lookup("BROKER_URL")
        .or_else(|| lookup("RABBITMQ_URL"))
        .unwrap_or_else(|| "memory://".into()),
      database_url: lookup("DATABASE_URL"),
      server_port: parsed(lookup, "SERVER_PORT", 8080)?,
      key_prefix: lookup("QDISPATCH_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.into()),
      catalog_path: lookup("QDISPATCH_CATALOG").map(PathBuf::from),
      worker_id: lookup("WORKER_ID")
        .or_else(|| lookup("HOSTNAME"))
        .unwrap_or_else(|| "worker".into()),
      concurrency: parsed(lookup, "WORKER_CONCURRENCY", 4)?,
      prefetch: parsed(lookup, "WORKER_PREFETCH", 4)?,
      max_tasks_per_executor: parsed(lookup, "WORKER_MAX_TASKS", 1000)?,
      worker_queues: worker_queues.filter(|q| !q.is_empty()),
      lease: secs(lookup, "TASK_LEASE_SECS", DEFAULT_LEASE)?,
      result_ttl: secs(lookup, "RESULT_TTL_SECS", DEFAULT_RESULT_TTL)?,
      reaper_interval: secs(lookup, "REAPER_INTERVAL_SECS", Duration::from_secs(60))?,
      reaper_grace: secs(lookup, "REAPER_GRACE_SECS", Duration::from_secs(3600))?,
      orphan_idle: secs(lookup, "ORPHAN_IDLE_SECS", Duration::from_secs(86_400))?,
      beat_poll: secs(lookup, "BEAT_POLL_SECS", Duration::from_secs(1))?,
      task_step_delay: parsed(lookup, "TASK_STEP_DELAY_MS", 500).map(Duration::from_millis)?,
      queue_warning: parsed(lookup, "QUEUE_WARNING_THRESHOLD", 500)?,
      queue_critical: parsed(lookup, "QUEUE_CRITICAL_THRESHOLD", 1000)?,
      min_workers: parsed(lookup, "MIN_WORKERS", 1)?,
      failure_critical: parsed(lookup, "FAILURE_CRITICAL_THRESHOLD", 25)?,
      worker_stale_after: secs(lookup, "WORKER_STALE_SECS", Duration::from_secs(60))?,
    };

    if config.concurrency == 0 {
      return Err(DispatchError::Config("WORKER_CONCURRENCY must be at least 1".into()));
    }
    if config.prefetch == 0 {
      return Err(DispatchError::Config("WORKER_PREFETCH must be at least 1".into()));
    }
    if config.queue_warning >= config.queue_critical {
      return Err(DispatchError::Config(
        "QUEUE_WARNING_THRESHOLD must be below QUEUE_CRITICAL_THRESHOLD".into(),
      ));
    }
    Ok(config)
  }

  /// True when the broker lives inside this process, so separate binaries do not share queues.
  pub fn process_local_broker(&self) -> bool {
    self.broker_url.starts_with("memory://")
  }

  pub fn pool_config(&self) -> WorkerPoolConfig {
    WorkerPoolConfig {
      worker_id: self.worker_id.clone(),
      concurrency: self.concurrency,
      prefetch: self.prefetch,
      max_tasks_per_executor: self.max_tasks_per_executor,
      queues: self.worker_queues.clone(),
      ..WorkerPoolConfig::default()
    }
  }

  pub fn monitor_config(&self) -> MonitorConfig {
    MonitorConfig {
      queue_warning: self.queue_warning,
      queue_critical: self.queue_critical,
      min_workers: self.min_workers,
      failure_critical: self.failure_critical,
      worker_stale_after: self.worker_stale_after,
      result_ttl: self.result_ttl,
      ..MonitorConfig::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(vars: &[(&str, &str)]) -> Result<Config> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(|key| vars.get(key).cloned())
  }

  #[test]
  fn test_defaults() {
    let c = config(&[]).unwrap();
    assert_eq!(c.broker_url, "memory://");
    assert!(c.process_local_broker());
    assert_eq!(c.orphan_idle, Duration::from_secs(86_400));
    assert_eq!(c.database_url, None);
    assert_eq!(c.server_port, 8080);
    assert_eq!(c.key_prefix, "qdispatch");
    assert_eq!(c.result_ttl, Duration::from_secs(3600));
    assert_eq!(c.pool_config().concurrency, 4);
    assert_eq!(c.monitor_config().queue_critical, 1000);
  }

  #[test]
  fn test_overrides() {
    let c = config(&[
      ("RABBITMQ_URL", "amqp://localhost:5672"),
      ("WORKER_QUEUES", "ai_content, search,"),
      ("WORKER_CONCURRENCY", "8"),
      ("RESULT_TTL_SECS", "60"),
    ])
    .unwrap();
    assert_eq!(c.broker_url, "amqp://localhost:5672");
    assert!(!c.process_local_broker());
    assert_eq!(c.worker_queues, Some(vec!["ai_content".to_string(), "search".to_string()]));
    assert_eq!(c.pool_config().concurrency, 8);
    assert_eq!(c.monitor_config().result_ttl, Duration::from_secs(60));
  }

  #[test]
  fn test_invalid_values_are_rejected() {
    assert!(matches!(config(&[("SERVER_PORT", "http")]), Err(DispatchError::Config(_))));
    assert!(matches!(config(&[("WORKER_CONCURRENCY", "0")]), Err(DispatchError::Config(_))));
    assert!(matches!(
      config(&[("QUEUE_WARNING_THRESHOLD", "900"), ("QUEUE_CRITICAL_THRESHOLD", "800")]),
      Err(DispatchError::Config(_))
    ));
  }
}
