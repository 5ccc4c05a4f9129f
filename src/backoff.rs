//! Retry delay policy.
//!
//! The delay after attempt `k` (1-based) is `min × 2^(k-1)`, clamped into `[min, max]`.
//! It depends only on the attempt number, so successive delays of one message never shrink.

use std::time::Duration;

use crate::models::QueuePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub min: Duration,
  pub max: Duration,
}

impl Backoff {
  pub fn new(min: Duration, max: Duration) -> Self {
    Self { min, max: max.max(min) }
  }

  pub fn from_policy(policy: &QueuePolicy) -> Self {
    Self::new(policy.min_backoff(), policy.max_backoff())
  }

  /// Delay to wait before re-running a message whose `attempt`-th execution just failed.
  pub fn delay(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    let factor = 1u128 << exp;
    let millis = self.min.as_millis().saturating_mul(factor);
    let capped = millis.min(self.max.as_millis()).max(self.min.as_millis());
    Duration::from_millis(capped.min(u64::MAX as u128) as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_retry_uses_min() {
    let b = Backoff::new(Duration::from_millis(1000), Duration::from_millis(900_000));
    assert_eq!(b.delay(1), Duration::from_millis(1000));
    assert_eq!(b.delay(2), Duration::from_millis(2000));
    assert_eq!(b.delay(3), Duration::from_millis(4000));
  }

  #[test]
  fn test_delays_non_decreasing_and_bounded() {
    let b = Backoff::new(Duration::from_millis(500), Duration::from_millis(300_000));
    let mut prev = Duration::ZERO;
    for attempt in 1..200 {
      let d = b.delay(attempt);
      assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
      assert!(d >= b.min && d <= b.max);
      prev = d;
    }
    assert_eq!(b.delay(199), b.max);
  }

  #[test]
  fn test_inverted_bounds_collapse_to_min() {
    let b = Backoff::new(Duration::from_millis(50), Duration::from_millis(10));
    assert_eq!(b.delay(1), Duration::from_millis(50));
    assert_eq!(b.delay(10), Duration::from_millis(50));
  }
}
