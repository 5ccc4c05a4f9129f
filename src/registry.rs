//! Startup-time registries: queue policies and task definitions.
//!
//! Both are built once, validated, and then shared read-only (`Arc`) by every component.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::backoff::Backoff;
use crate::error::{DispatchError, Result};
use crate::models::{PriorityTier, QueuePolicy};
use crate::router::TaskRouter;
use crate::task::WorkFunction;

pub const DEFAULT_QUEUE: &str = "default";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex"));

pub fn is_valid_queue_name(name: &str) -> bool {
  NAME_RE.is_match(name)
}

#[derive(Debug, Clone)]
pub struct QueueRegistry {
  policies: BTreeMap<String, QueuePolicy>,
}

impl QueueRegistry {
  pub fn new(policies: impl IntoIterator<Item = QueuePolicy>) -> Result<Self> {
    let mut map = BTreeMap::new();
    for policy in policies {
      let policy = policy.normalized();
      if !is_valid_queue_name(&policy.name) {
        return Err(DispatchError::Config(format!("invalid queue name '{}'", policy.name)));
      }
      if policy.min_backoff_ms == 0 || policy.max_backoff_ms < policy.min_backoff_ms {
        return Err(DispatchError::Config(format!(
          "queue '{}' has invalid backoff bounds [{}, {}]",
          policy.name, policy.min_backoff_ms, policy.max_backoff_ms
        )));
      }
      if map.insert(policy.name.clone(), policy.clone()).is_some() {
        return Err(DispatchError::Config(format!("queue '{}' declared twice", policy.name)));
      }
    }
    if !map.contains_key(DEFAULT_QUEUE) {
      return Err(DispatchError::Config(format!("the '{DEFAULT_QUEUE}' queue must be declared")));
    }
    Ok(Self { policies: map })
  }

  pub fn get(&self, name: &str) -> Result<&QueuePolicy> {
    self.policies.get(name).ok_or_else(|| DispatchError::UnknownQueue(name.to_string()))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.policies.contains_key(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &QueuePolicy> {
    self.policies.values()
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.policies.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.policies.len()
  }

  pub fn is_empty(&self) -> bool {
    self.policies.is_empty()
  }

  /// Queue names grouped by tier, highest tier first, names in declaration-independent (sorted) order.
  pub fn by_tier(&self) -> Vec<(PriorityTier, Vec<String>)> {
    let mut tiers: BTreeMap<PriorityTier, Vec<String>> = BTreeMap::new();
    for policy in self.policies.values() {
      tiers.entry(policy.priority).or_default().push(policy.name.clone());
    }
    tiers.into_iter().rev().collect()
  }
}

/// Registration input: a name, its work function and optional overrides of the queue policy.
pub struct TaskSpec {
  name: String,
  work: Arc<dyn WorkFunction>,
  max_retries: Option<u32>,
  backoff: Option<(Duration, Duration)>,
  auto_retry: bool,
}

impl TaskSpec {
  pub fn new(name: impl Into<String>, work: Arc<dyn WorkFunction>) -> Self {
    Self {
      name: name.into(),
      work,
      max_retries: None,
      backoff: None,
      auto_retry: true,
    }
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
    self.backoff = Some((min, max));
    self
  }

  /// Failures surface immediately instead of entering the retry loop.
  pub fn no_auto_retry(mut self) -> Self {
    self.auto_retry = false;
    self
  }
}

/// Immutable, resolved definition of a task.
#[derive(Clone)]
pub struct TaskDefinition {
  pub name: String,
  pub queue: String,
  pub max_retries: u32,
  pub backoff: Backoff,
  pub priority: PriorityTier,
  pub auto_retry: bool,
  pub work: Arc<dyn WorkFunction>,
}

impl std::fmt::Debug for TaskDefinition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskDefinition")
      .field("name", &self.name)
      .field("queue", &self.queue)
      .field("max_retries", &self.max_retries)
      .field("backoff", &self.backoff)
      .field("priority", &self.priority)
      .field("auto_retry", &self.auto_retry)
      .finish()
  }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
  specs: Vec<TaskSpec>,
}

impl TaskRegistryBuilder {
  pub fn task(mut self, spec: TaskSpec) -> Self {
    self.specs.push(spec);
    self
  }

  pub fn tasks(mut self, specs: impl IntoIterator<Item = TaskSpec>) -> Self {
    self.specs.extend(specs);
    self
  }

  /// Resolves every task through the router and the queue policies.
  ///
  /// Fails on duplicate names and on routes naming tasks that were never registered.
  pub fn build(self, queues: &QueueRegistry, router: &TaskRouter) -> Result<TaskRegistry> {
    let mut tasks = BTreeMap::new();
    for spec in self.specs {
      if tasks.contains_key(&spec.name) {
        return Err(DispatchError::DuplicateTask(spec.name));
      }
      let queue = router.route(&spec.name).to_string();
      let policy = queues.get(&queue)?;
      let backoff = match spec.backoff {
        Some((min, max)) => Backoff::new(min, max),
        None => Backoff::from_policy(policy),
      };
      let def = TaskDefinition {
        name: spec.name.clone(),
        queue,
        max_retries: spec.max_retries.unwrap_or(policy.max_retries),
        backoff,
        priority: policy.priority,
        auto_retry: spec.auto_retry,
        work: spec.work,
      };
      tasks.insert(spec.name, def);
    }

    let registered: HashSet<&str> = tasks.keys().map(String::as_str).collect();
    if let Some((task, _)) = router.routes().find(|(task, _)| !registered.contains(task)) {
      return Err(DispatchError::UnknownTask(format!("{task} is routed but not registered")));
    }

    info!(tasks = tasks.len(), queues = queues.len(), "Task registry built");
    Ok(TaskRegistry { tasks })
  }
}

pub struct TaskRegistry {
  tasks: BTreeMap<String, TaskDefinition>,
}

impl TaskRegistry {
  pub fn builder() -> TaskRegistryBuilder {
    TaskRegistryBuilder::default()
  }

  pub fn get(&self, name: &str) -> Result<&TaskDefinition> {
    self.tasks.get(name).ok_or_else(|| DispatchError::UnknownTask(name.to_string()))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.tasks.contains_key(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &TaskDefinition> {
    self.tasks.values()
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::work_fn;
  use serde_json::Value;

  fn noop() -> Arc<dyn WorkFunction> {
    work_fn(|_: Value, _| async { Ok(Value::Null) })
  }

  fn queues() -> QueueRegistry {
    QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("ai_content", PriorityTier::Normal).with_retries(3, 1000, 900_000),
      QueuePolicy::new("system", PriorityTier::Low).with_retries(0, 1000, 1000),
    ])
    .unwrap()
  }

  #[test]
  fn test_queue_registry_requires_default() {
    let err = QueueRegistry::new(vec![QueuePolicy::new("search", PriorityTier::Low)]).unwrap_err();
    assert!(matches!(err, DispatchError::Config(_)));
  }

  #[test]
  fn test_queue_registry_rejects_duplicates_and_bad_names() {
    let dup = QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("default", PriorityTier::High),
    ]);
    assert!(dup.is_err());
    let bad = QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("Bad-Name", PriorityTier::High),
    ]);
    assert!(bad.is_err());
  }

  #[test]
  fn test_unknown_queue_lookup() {
    assert!(matches!(queues().get("nope"), Err(DispatchError::UnknownQueue(_))));
  }

  #[test]
  fn test_by_tier_highest_first() {
    let reg = QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("search", PriorityTier::Low),
      QueuePolicy::new("ai_assessment", PriorityTier::High),
    ])
    .unwrap();
    let tiers: Vec<PriorityTier> = reg.by_tier().into_iter().map(|(t, _)| t).collect();
    assert_eq!(tiers, vec![PriorityTier::High, PriorityTier::Normal, PriorityTier::Low]);
  }

  #[test]
  fn test_task_resolution_uses_route_and_policy() {
    let queues = queues();
    let router = TaskRouter::new([("summarize", "ai_content")], &queues).unwrap();
    let reg = TaskRegistry::builder()
      .task(TaskSpec::new("summarize", noop()))
      .task(TaskSpec::new("ping", noop()).max_retries(7))
      .build(&queues, &router)
      .unwrap();

    let summarize = reg.get("summarize").unwrap();
    assert_eq!(summarize.queue, "ai_content");
    assert_eq!(summarize.max_retries, 3);
    assert!(summarize.auto_retry);

    let ping = reg.get("ping").unwrap();
    assert_eq!(ping.queue, DEFAULT_QUEUE);
    assert_eq!(ping.max_retries, 7);
  }

  #[test]
  fn test_duplicate_and_unregistered_routes_rejected() {
    let queues = queues();
    let router = TaskRouter::new([("summarize", "ai_content")], &queues).unwrap();
    let dup = TaskRegistry::builder()
      .task(TaskSpec::new("summarize", noop()))
      .task(TaskSpec::new("summarize", noop()))
      .build(&queues, &router);
    assert!(matches!(dup, Err(DispatchError::DuplicateTask(_))));

    let missing = TaskRegistry::builder().task(TaskSpec::new("other", noop())).build(&queues, &router);
    assert!(matches!(missing, Err(DispatchError::UnknownTask(_))));
  }
}
