use std::collections::BTreeMap;

use crate::error::{DispatchError, Result};
use crate::registry::{QueueRegistry, DEFAULT_QUEUE};

/// Static task-name → queue mapping. Unmapped tasks go to [`DEFAULT_QUEUE`].
#[derive(Debug, Clone)]
pub struct TaskRouter {
  routes: BTreeMap<String, String>,
}

impl TaskRouter {
  pub fn new<I, T, Q>(routes: I, queues: &QueueRegistry) -> Result<Self>
  where
    I: IntoIterator<Item = (T, Q)>,
    T: Into<String>,
    Q: Into<String>,
  {
    let mut map = BTreeMap::new();
    for (task, queue) in routes {
      let (task, queue) = (task.into(), queue.into());
      if !queues.contains(&queue) {
        return Err(DispatchError::UnknownQueue(format!("{queue} (routed from {task})")));
      }
      map.insert(task, queue);
    }
    Ok(Self { routes: map })
  }

  pub fn route(&self, task_name: &str) -> &str {
    self.routes.get(task_name).map(String::as_str).unwrap_or(DEFAULT_QUEUE)
  }

  pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
    self.routes.iter().map(|(t, q)| (t.as_str(), q.as_str()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{PriorityTier, QueuePolicy};

  fn queues() -> QueueRegistry {
    QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("search", PriorityTier::Low),
    ])
    .unwrap()
  }

  #[test]
  fn test_route_and_fallback() {
    let router = TaskRouter::new([("update_search_index", "search")], &queues()).unwrap();
    assert_eq!(router.route("update_search_index"), "search");
    assert_eq!(router.route("anything_else"), "default");
  }

  #[test]
  fn test_route_to_undeclared_queue_is_fatal() {
    let err = TaskRouter::new([("x", "missing")], &queues()).unwrap_err();
    assert!(matches!(err, DispatchError::UnknownQueue(_)));
  }
}
