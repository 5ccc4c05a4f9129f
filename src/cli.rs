//! Operator command line over the [`Monitor`]: argument model, validation, action execution and
//! the three output formats.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use uuid::Uuid;

use crate::models::CancelOutcome;
use crate::monitor::{
  HealthStatus, Monitor, PerformanceReport, PurgeConfirmation, PurgeReport, QueueStats, SystemHealth, WorkerStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
  Status,
  Health,
  Performance,
  Workers,
  Purge,
  Cancel,
}

impl Action {
  pub fn is_destructive(&self) -> bool {
    matches!(self, Action::Purge | Action::Cancel)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
  Json,
  Table,
  Summary,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "qdispatch_cli", about = "Inspect and operate the task dispatch queues")]
pub struct Cli {
  #[arg(long, value_enum)]
  pub action: Action,

  /// Queue to inspect (`status`) or purge (`purge`).
  #[arg(long)]
  pub queue: Option<String>,

  /// Message id to cancel.
  #[arg(long = "task-id")]
  pub task_id: Option<Uuid>,

  #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
  pub format: OutputFormat,

  /// Refresh continuously (read-only actions).
  #[arg(long)]
  pub watch: bool,

  /// Seconds between refreshes in watch mode.
  #[arg(long, default_value_t = 5)]
  pub interval: u64,

  /// Look-back window of `performance`, in seconds.
  #[arg(long, default_value_t = 3600)]
  pub window: u64,
}

impl Cli {
  /// Rejects argument combinations that cannot work, before anything is contacted.
  pub fn validate(&self) -> Result<()> {
    if self.interval < 1 {
      bail!("--interval must be at least 1 second");
    }
    if self.window < 1 {
      bail!("--window must be at least 1 second");
    }
    match self.action {
      Action::Purge if self.queue.is_none() => bail!("purge requires --queue"),
      Action::Cancel if self.task_id.is_none() => bail!("cancel requires --task-id"),
      _ => {}
    }
    if self.watch && self.action.is_destructive() {
      bail!("--watch cannot be combined with {:?}", self.action);
    }
    Ok(())
  }

  pub fn refresh(&self) -> Duration {
    Duration::from_secs(self.interval)
  }

  /// The question asked before a destructive action.
  pub fn confirmation_prompt(&self) -> Option<String> {
    match self.action {
      Action::Purge => Some(format!(
        "Purge every pending message of queue '{}'? This cannot be undone.",
        self.queue.as_deref().unwrap_or_default()
      )),
      Action::Cancel => Some(format!(
        "Cancel task {}?",
        self.task_id.map(|id| id.to_string()).unwrap_or_default()
      )),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Report {
  Queues(BTreeMap<String, QueueStats>),
  Health(SystemHealth),
  Performance(PerformanceReport),
  Workers(BTreeMap<String, WorkerStats>),
  Purged(PurgeReport),
  Cancelled { task_id: Uuid, result: CancelOutcome },
}

/// Runs the action of `cli`. Destructive actions must have been confirmed by the caller.
pub async fn run_action(cli: &Cli, monitor: &Monitor) -> Result<Report> {
  Ok(match cli.action {
    Action::Status => match &cli.queue {
      Some(queue) => {
        let stats = monitor
          .queue_health(queue)
          .await
          .with_context(|| format!("failed to read queue {queue}"))?;
        Report::Queues(BTreeMap::from([(queue.clone(), stats)]))
      }
      None => Report::Queues(monitor.queue_stats().await.context("failed to read queue stats")?),
    },
    Action::Health => Report::Health(monitor.system_health().await),
    Action::Performance => Report::Performance(
      monitor
        .performance_report(Duration::from_secs(cli.window))
        .await
        .context("failed to build performance report")?,
    ),
    Action::Workers => Report::Workers(monitor.worker_stats().await.context("failed to read workers")?),
    Action::Purge => {
      let queue = cli.queue.as_deref().context("purge requires --queue")?;
      Report::Purged(
        monitor
          .purge_queue(queue, PurgeConfirmation::for_queue(queue))
          .await
          .with_context(|| format!("failed to purge {queue}"))?,
      )
    }
    Action::Cancel => {
      let task_id = cli.task_id.context("cancel requires --task-id")?;
      let result = monitor
        .cancel_task(task_id)
        .await
        .with_context(|| format!("failed to cancel {task_id}"))?;
      Report::Cancelled { task_id, result }
    }
  })
}

fn cancel_text(result: &CancelOutcome) -> String {
  match result {
    CancelOutcome::Cancelled => "cancelled".to_string(),
    CancelOutcome::NotCancellable { reason } => format!("not cancellable: {reason}"),
    CancelOutcome::NotFound => "not found".to_string(),
  }
}

fn ms(value: Option<f64>) -> String {
  value.map_or_else(|| "-".to_string(), |v| format!("{v:.0}ms"))
}

pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
  match format {
    OutputFormat::Json => serde_json::to_string_pretty(report).context("failed to encode report"),
    OutputFormat::Table => Ok(render_table(report)),
    OutputFormat::Summary => Ok(render_summary(report)),
  }
}

fn render_table(report: &Report) -> String {
  let mut out = String::new();
  match report {
    Report::Queues(stats) => {
      let _ = writeln!(
        out,
        "{:<20} {:>8} {:>8} {:>8} {:>8} {:<8} {:<9}",
        "QUEUE", "PENDING", "READY", "DELAYED", "LEASED", "PRIORITY", "HEALTH"
      );
      for (name, s) in stats {
        let _ = writeln!(
          out,
          "{:<20} {:>8} {:>8} {:>8} {:>8} {:<8} {:<9}",
          name,
          s.pending_count,
          s.depth.ready,
          s.depth.delayed,
          s.depth.leased,
          s.policy.priority.to_string(),
          s.health.as_str()
        );
      }
    }
    Report::Workers(workers) => {
      let _ = writeln!(
        out,
        "{:<28} {:<8} {:>6} {:>9} {:>8} {:>9}  LAST SEEN",
        "WORKER", "STATUS", "ACTIVE", "SCHEDULED", "RESERVED", "PROCESSED"
      );
      for (id, w) in workers {
        let _ = writeln!(
          out,
          "{:<28} {:<8} {:>6} {:>9} {:>8} {:>9}  {}",
          id,
          w.status.as_str(),
          w.active,
          w.scheduled,
          w.reserved,
          w.processed,
          w.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    Report::Health(health) => {
      let _ = writeln!(out, "{:<10} {:<9} MESSAGE", "COMPONENT", "STATUS");
      for (name, c) in &health.components {
        let _ = writeln!(out, "{:<10} {:<9} {}", name, c.status.as_str(), c.message);
      }
      let _ = writeln!(out, "{:<10} {}", "overall", health.overall_status);
    }
    Report::Performance(p) => {
      let rows = [
        ("window", format!("{}s", p.window_secs)),
        ("completed", p.completed.to_string()),
        ("succeeded", p.succeeded.to_string()),
        ("failed", p.failed.to_string()),
        ("cancelled", p.cancelled.to_string()),
        ("retries", p.retries.to_string()),
        ("success rate", format!("{:.1}%", p.success_rate * 100.0)),
        ("throughput", format!("{:.2}/min", p.throughput_per_minute)),
        ("avg latency", ms(p.average_latency_ms)),
        ("avg execution", ms(p.average_execution_ms)),
        ("pending", p.total_pending.to_string()),
      ];
      for (label, value) in rows {
        let _ = writeln!(out, "{label:<14} {value}");
      }
      for r in &p.recommendations {
        let _ = writeln!(out, "[{}] {}: {} - {}", r.priority, r.queue, r.issue, r.suggestion);
      }
    }
    Report::Purged(p) => {
      let _ = writeln!(out, "{:<20} {:>8}", "QUEUE", "PURGED");
      let _ = writeln!(out, "{:<20} {:>8}", p.queue, p.purged);
    }
    Report::Cancelled { task_id, result } => {
      let _ = writeln!(out, "{task_id}  {}", cancel_text(result));
    }
  }
  out
}

fn render_summary(report: &Report) -> String {
  match report {
    Report::Queues(stats) => {
      let pending: u64 = stats.values().map(|s| s.pending_count).sum();
      let count = |h: HealthStatus| stats.values().filter(|s| s.health == h).count();
      format!(
        "{} queues, {} pending ({} warning, {} critical)",
        stats.len(),
        pending,
        count(HealthStatus::Warning),
        count(HealthStatus::Critical)
      )
    }
    Report::Workers(workers) => {
      let live = workers.values().filter(|w| w.status != crate::models::WorkerStatus::Offline).count();
      format!("{} workers known, {} live", workers.len(), live)
    }
    Report::Health(health) => {
      let degraded: Vec<&str> = health
        .components
        .iter()
        .filter(|(_, c)| c.status != HealthStatus::Healthy)
        .map(|(name, _)| name.as_str())
        .collect();
      if degraded.is_empty() {
        format!("overall {}", health.overall_status)
      } else {
        format!("overall {} (degraded: {})", health.overall_status, degraded.join(", "))
      }
    }
    Report::Performance(p) => format!(
      "{} tasks in {}s, {:.2}/min, {:.1}% success, avg latency {}",
      p.completed,
      p.window_secs,
      p.throughput_per_minute,
      p.success_rate * 100.0,
      ms(p.average_latency_ms)
    ),
    Report::Purged(p) => format!("purged {} messages from {}", p.purged, p.queue),
    Report::Cancelled { task_id, result } => format!("{task_id}: {}", cancel_text(result)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::{BrokerAdapter, MemoryBroker};
  use crate::models::{PriorityTier, QueuePolicy, TaskMessage};
  use crate::monitor::MonitorConfig;
  use crate::registry::QueueRegistry;
  use crate::store::MemoryTaskStore;
  use serde_json::json;
  use std::sync::Arc;

  fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("qdispatch_cli").chain(args.iter().copied())).unwrap()
  }

  #[test]
  fn test_validation_happens_before_any_call() {
    assert!(parse(&["--action", "purge"]).validate().is_err());
    assert!(parse(&["--action", "cancel"]).validate().is_err());
    assert!(parse(&["--action", "status", "--interval", "0"]).validate().is_err());
    assert!(parse(&["--action", "purge", "--queue", "search", "--watch"]).validate().is_err());
    assert!(parse(&["--action", "purge", "--queue", "search"]).validate().is_ok());
    assert!(parse(&["--action", "health", "--watch", "--interval", "2"]).validate().is_ok());
  }

  #[test]
  fn test_bad_arguments_fail_to_parse() {
    assert!(Cli::try_parse_from(["qdispatch_cli", "--action", "explode"]).is_err());
    assert!(Cli::try_parse_from(["qdispatch_cli", "--action", "cancel", "--task-id", "nope"]).is_err());
  }

  #[test]
  fn test_confirmation_prompt_only_for_destructive() {
    assert!(parse(&["--action", "status"]).confirmation_prompt().is_none());
    let prompt = parse(&["--action", "purge", "--queue", "search"]).confirmation_prompt().unwrap();
    assert!(prompt.contains("'search'"));
  }

  #[tokio::test]
  async fn test_status_renders_in_every_format() {
    let queues = Arc::new(
      QueueRegistry::new(vec![
        QueuePolicy::new("default", PriorityTier::Normal),
        QueuePolicy::new("search", PriorityTier::Low),
      ])
      .unwrap(),
    );
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue("search", &TaskMessage::new("update_search_index", "search", json!({}))).await.unwrap();
    let monitor = Monitor::new(broker, Arc::new(MemoryTaskStore::new()), queues, MonitorConfig::default());

    let report = run_action(&parse(&["--action", "status"]), &monitor).await.unwrap();
    let table = render(&report, OutputFormat::Table).unwrap();
    assert!(table.starts_with("QUEUE"));
    assert!(table.contains("search"));
    assert_eq!(render(&report, OutputFormat::Summary).unwrap(), "2 queues, 1 pending (0 warning, 0 critical)");
    let json: serde_json::Value = serde_json::from_str(&render(&report, OutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json["search"]["pending_count"], 1);

    let err = run_action(&parse(&["--action", "status", "--queue", "nope"]), &monitor).await.unwrap_err();
    assert!(format!("{err:#}").contains("unknown queue"));
  }
}
