//! Decides which queue an executor polls next.
//!
//! Tiers are strictly ordered (`high` before `normal` before `low`); inside a tier the queues
//! rotate, so the queue served last moves to the back of its tier.

use crate::models::PriorityTier;
use crate::registry::QueueRegistry;

#[derive(Debug, Clone)]
struct Tier {
  priority: PriorityTier,
  queues: Vec<String>,
  cursor: usize,
}

#[derive(Debug, Clone)]
pub struct PollScheduler {
  tiers: Vec<Tier>,
}

impl PollScheduler {
  /// `only` restricts polling to a subset of the declared queues.
  pub fn new(queues: &QueueRegistry, only: Option<&[String]>) -> Self {
    let tiers = queues
      .by_tier()
      .into_iter()
      .map(|(priority, names)| Tier {
        priority,
        queues: names
          .into_iter()
          .filter(|q| only.map_or(true, |only| only.iter().any(|o| o == q)))
          .collect(),
        cursor: 0,
      })
      .filter(|t| !t.queues.is_empty())
      .collect();
    Self { tiers }
  }

  /// Every queue once, in the order it should be tried right now.
  pub fn poll_order(&self) -> Vec<&str> {
    let mut order = Vec::new();
    for tier in &self.tiers {
      let n = tier.queues.len();
      for i in 0..n {
        order.push(tier.queues[(tier.cursor + i) % n].as_str());
      }
    }
    order
  }

  /// Records that a message was taken from `queue`; its tier now starts after it.
  pub fn mark_served(&mut self, queue: &str) {
    for tier in &mut self.tiers {
      if let Some(pos) = tier.queues.iter().position(|q| q == queue) {
        tier.cursor = (pos + 1) % tier.queues.len();
        return;
      }
    }
  }

  pub fn tier_of(&self, queue: &str) -> Option<PriorityTier> {
    self
      .tiers
      .iter()
      .find(|t| t.queues.iter().any(|q| q == queue))
      .map(|t| t.priority)
  }

  pub fn is_empty(&self) -> bool {
    self.tiers.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::QueuePolicy;

  fn registry() -> QueueRegistry {
    QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("search", PriorityTier::Low),
      QueuePolicy::new("analytics", PriorityTier::Low),
      QueuePolicy::new("ai_assessment", PriorityTier::High),
      QueuePolicy::new("notifications", PriorityTier::High),
    ])
    .unwrap()
  }

  #[test]
  fn test_tiers_drained_in_priority_order() {
    let sched = PollScheduler::new(&registry(), None);
    assert_eq!(
      sched.poll_order(),
      vec!["ai_assessment", "notifications", "default", "analytics", "search"]
    );
  }

  #[test]
  fn test_round_robin_within_tier() {
    let mut sched = PollScheduler::new(&registry(), None);
    sched.mark_served("ai_assessment");
    assert_eq!(&sched.poll_order()[..2], &["notifications", "ai_assessment"]);
    sched.mark_served("notifications");
    assert_eq!(&sched.poll_order()[..2], &["ai_assessment", "notifications"]);
    // other tiers keep their own rotation
    assert_eq!(&sched.poll_order()[3..], &["analytics", "search"]);
  }

  #[test]
  fn test_queue_subset() {
    let only = vec!["search".to_string(), "default".to_string()];
    let sched = PollScheduler::new(&registry(), Some(&only));
    assert_eq!(sched.poll_order(), vec!["default", "search"]);
    assert_eq!(sched.tier_of("search"), Some(PriorityTier::Low));
    assert_eq!(sched.tier_of("ai_assessment"), None);
  }
}
