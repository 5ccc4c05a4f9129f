//! Recurring tasks on calendar schedules.
//!
//! Cron format: `MIN HOUR DOM MON DOW` (5 fields, no seconds, UTC).
//! Each field accepts `*`, `*/N`, `N`, `A-B`, `A-B/N` and comma-separated lists of those.
//! When both day fields are restricted a day matches if either does. `0` and `7` are Sunday.
//!
//! Ticks are deduplicated per minute and never backfilled: if the scheduler was down across a
//! due minute, that run is skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::models::ResultStatus;
use crate::store::TaskStore;

/// Bitset of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field(u64);

impl Field {
  fn contains(&self, v: u32) -> bool {
    v < 64 && self.0 & (1u64 << v) != 0
  }

  fn parse(spec: &str, min: u32, max: u32) -> Option<Self> {
    let mut bits = 0u64;
    for part in spec.split(',') {
      let part = part.trim();
      let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, step.parse::<u32>().ok().filter(|s| *s > 0)?),
        None => (part, 1),
      };
      let (lo, hi) = if range == "*" {
        (min, max)
      } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
      } else {
        let n: u32 = range.parse().ok()?;
        // `N/S` runs from N to the end of the field
        if part.contains('/') { (n, max) } else { (n, n) }
      };
      if lo < min || hi > max || lo > hi {
        return None;
      }
      for v in (lo..=hi).step_by(step as usize) {
        bits |= 1u64 << v;
      }
    }
    Some(Field(bits))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
  expression: String,
  minutes: Field,
  hours: Field,
  days_of_month: Field,
  months: Field,
  days_of_week: Field,
  dom_restricted: bool,
  dow_restricted: bool,
}

impl CronSchedule {
  pub fn parse(expression: &str) -> Result<Self> {
    let invalid = || DispatchError::Config(format!("invalid cron expression '{expression}'"));
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
      return Err(invalid());
    }
    let mut days_of_week = Field::parse(parts[4], 0, 7).ok_or_else(invalid)?;
    if days_of_week.contains(7) {
      days_of_week.0 = (days_of_week.0 | 1) & !(1u64 << 7);
    }
    Ok(Self {
      expression: expression.to_string(),
      minutes: Field::parse(parts[0], 0, 59).ok_or_else(invalid)?,
      hours: Field::parse(parts[1], 0, 23).ok_or_else(invalid)?,
      days_of_month: Field::parse(parts[2], 1, 31).ok_or_else(invalid)?,
      months: Field::parse(parts[3], 1, 12).ok_or_else(invalid)?,
      days_of_week,
      // a field starting with `*` (including `*/n`) does not restrict the day
      dom_restricted: !parts[2].starts_with('*'),
      dow_restricted: !parts[4].starts_with('*'),
    })
  }

  pub fn expression(&self) -> &str {
    &self.expression
  }

  fn day_matches(&self, at: &DateTime<Utc>) -> bool {
    let dom = self.days_of_month.contains(at.day());
    let dow = self.days_of_week.contains(at.weekday().num_days_from_sunday());
    match (self.dom_restricted, self.dow_restricted) {
      (true, true) => dom || dow,
      (true, false) => dom,
      (false, true) => dow,
      (false, false) => true,
    }
  }

  /// Whether the minute containing `at` is a due minute.
  pub fn matches(&self, at: DateTime<Utc>) -> bool {
    self.months.contains(at.month())
      && self.day_matches(&at)
      && self.hours.contains(at.hour())
      && self.minutes.contains(at.minute())
  }

  /// First due minute strictly after `after`.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = truncate_to_minute(after) + chrono::Duration::minutes(1);
    let mut day = Utc
      .with_ymd_and_hms(start.year(), start.month(), start.day(), 0, 0, 0)
      .single()?;
    // four years covers every leap-day schedule
    for _ in 0..(366 * 4 + 1) {
      if self.months.contains(day.month()) && self.day_matches(&day) {
        for hour in 0..24 {
          if !self.hours.contains(hour) {
            continue;
          }
          for minute in 0..60 {
            if !self.minutes.contains(minute) {
              continue;
            }
            let candidate = day + chrono::Duration::minutes((hour * 60 + minute) as i64);
            if candidate >= start {
              return Some(candidate);
            }
          }
        }
      }
      day += chrono::Duration::days(1);
    }
    None
  }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
  at.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(at)
}

fn default_payload() -> Value {
  json!({})
}

/// Schedule table row as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
  pub name: String,
  pub task: String,
  pub cron: String,
  #[serde(default)]
  pub queue: Option<String>,
  #[serde(default = "default_payload")]
  pub payload: Value,
}

impl ScheduleConfig {
  pub fn new(name: &str, task: &str, cron: &str, queue: Option<&str>) -> Self {
    Self {
      name: name.to_string(),
      task: task.to_string(),
      cron: cron.to_string(),
      queue: queue.map(str::to_string),
      payload: default_payload(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
  pub name: String,
  pub task_name: String,
  pub schedule: CronSchedule,
  pub queue: Option<String>,
  pub payload: Value,
}

impl ScheduleEntry {
  pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
    Ok(Self {
      name: config.name.clone(),
      task_name: config.task.clone(),
      schedule: CronSchedule::parse(&config.cron)?,
      queue: config.queue.clone(),
      payload: config.payload.clone(),
    })
  }
}

/// A scheduled run that did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
  pub entry: String,
  pub task_name: String,
  pub message_id: Option<Uuid>,
  pub error: String,
  pub recorded_at: DateTime<Utc>,
}

/// Outcome of one scheduled submission.
#[derive(Debug)]
pub struct Fired {
  pub entry: String,
  pub result: Result<Uuid>,
}

struct Pending {
  entry: String,
  task_name: String,
  message_id: Uuid,
}

pub struct Scheduler {
  entries: Vec<ScheduleEntry>,
  dispatcher: Arc<Dispatcher>,
  store: Arc<dyn TaskStore>,
  last_tick: Option<DateTime<Utc>>,
  pending: Vec<Pending>,
  failures: Vec<FailureRecord>,
}

impl Scheduler {
  /// Validates every entry against the registered tasks and queues.
  pub fn new(entries: Vec<ScheduleEntry>, dispatcher: Arc<Dispatcher>, store: Arc<dyn TaskStore>) -> Result<Self> {
    for entry in &entries {
      dispatcher.tasks().get(&entry.task_name)?;
      if let Some(queue) = &entry.queue {
        dispatcher.queues().get(queue)?;
      }
    }
    Ok(Self {
      entries,
      dispatcher,
      store,
      last_tick: None,
      pending: Vec::new(),
      failures: Vec::new(),
    })
  }

  pub fn entries(&self) -> &[ScheduleEntry] {
    &self.entries
  }

  pub fn failures(&self) -> &[FailureRecord] {
    &self.failures
  }

  fn record_failure(&mut self, entry: &str, task_name: &str, message_id: Option<Uuid>, error: String) {
    error!(entry = %entry, task = %task_name, message_id = ?message_id, error = %error, "Scheduled task failed");
    self.failures.push(FailureRecord {
      entry: entry.to_string(),
      task_name: task_name.to_string(),
      message_id,
      error,
      recorded_at: Utc::now(),
    });
  }

  /// Submits every entry due in the minute of `now`. A minute fires at most once.
  pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<Fired> {
    let minute = truncate_to_minute(now);
    if self.last_tick.is_some_and(|last| last >= minute) {
      return Vec::new();
    }
    self.last_tick = Some(minute);

    let due: Vec<ScheduleEntry> = self
      .entries
      .iter()
      .filter(|e| e.schedule.matches(minute))
      .cloned()
      .collect();
    let mut fired = Vec::with_capacity(due.len());
    for entry in due {
      let result = self
        .dispatcher
        .submit_to(&entry.task_name, entry.queue.as_deref(), entry.payload.clone())
        .await;
      match &result {
        Ok(id) => {
          info!(entry = %entry.name, task = %entry.task_name, message_id = %id, "Scheduled task submitted");
          self.pending.push(Pending {
            entry: entry.name.clone(),
            task_name: entry.task_name.clone(),
            message_id: *id,
          });
        }
        Err(e) => self.record_failure(&entry.name, &entry.task_name, None, e.to_string()),
      }
      fired.push(Fired {
        entry: entry.name,
        result,
      });
    }
    fired
  }

  /// Checks submitted runs for terminal results; failed ones go to the failure log.
  pub async fn collect_failures(&mut self) -> Result<usize> {
    let mut still_pending = Vec::new();
    let mut new_failures = 0;
    for pending in std::mem::take(&mut self.pending) {
      match self.store.get_result(pending.message_id).await {
        Ok(Some(result)) if result.status == ResultStatus::Failed => {
          let error = result.error_detail.unwrap_or_else(|| "task failed".to_string());
          self.record_failure(&pending.entry, &pending.task_name, Some(pending.message_id), error);
          new_failures += 1;
        }
        Ok(Some(_)) => {}
        Ok(None) => still_pending.push(pending),
        Err(e) => {
          warn!(message_id = %pending.message_id, error = %e, "Could not read scheduled task result");
          still_pending.push(pending);
        }
      }
    }
    self.pending = still_pending;
    Ok(new_failures)
  }

  /// Ticks every `poll` until shutdown.
  pub async fn run(mut self, poll: Duration, mut shutdown: broadcast::Receiver<()>) {
    for entry in &self.entries {
      info!(
        entry = %entry.name,
        task = %entry.task_name,
        cron = %entry.schedule.expression(),
        next = ?entry.schedule.next_after(Utc::now()),
        "Schedule loaded"
      );
    }
    let mut ticker = tokio::time::interval(poll);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.tick(Utc::now()).await;
          if let Err(e) = self.collect_failures().await {
            warn!(error = %e, "Failure collection failed");
          }
        }
        _ = shutdown.recv() => {
          info!(failures = self.failures.len(), "Scheduler stopping");
          break;
        }
      }
    }
  }
}
