//! Uniform interface over the durable message queue.
//!
//! Every implementation namespaces its keys/queues under a fixed prefix, leases dequeued
//! messages to exactly one consumer, and reports transport failure as
//! [`DispatchError::BrokerUnavailable`] after a small bounded retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{QueueDepth, TaskMessage};
use crate::registry::QueueRegistry;

pub mod amqp;
pub mod memory;
pub mod redis;

pub use self::amqp::AmqpBroker;
pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

pub const DEFAULT_PREFIX: &str = "qdispatch";

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Result of [`BrokerAdapter::remove_pending`].
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
  Removed(TaskMessage),
  Leased,
  Unsupported(&'static str),
  Missing,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
  fn kind(&self) -> &'static str;

  async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<Uuid>;

  /// Leases the next visible message of `queue`, waiting at most `timeout` for one.
  async fn dequeue(&self, queue: &str, lease: Duration, timeout: Duration) -> Result<Option<TaskMessage>>;

  async fn ack(&self, message_id: Uuid) -> Result<()>;

  async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<()>;

  /// Replaces the leased copy of `message` with `message` itself, invisible for `delay`.
  /// The retried message re-enters at the back of its queue.
  async fn retry_later(&self, message: &TaskMessage, delay: Duration) -> Result<()>;

  async fn renew_lease(&self, message_id: Uuid, lease: Duration) -> Result<()>;

  async fn queue_depth(&self, queue: &str) -> Result<QueueDepth>;

  /// Drops every ready and delayed message of `queue`. Leased messages are untouched.
  async fn purge(&self, queue: &str) -> Result<u64>;

  /// Removes a message that no consumer holds yet.
  async fn remove_pending(&self, message_id: Uuid) -> Result<Removal>;

  async fn ping(&self) -> bool;
}

/// Runs `action` with the adapter-level bounded retry, retrying only when `transient` says so.
pub(crate) async fn with_retry<T, E, A, Fut, C>(action: A, transient: C) -> std::result::Result<T, E>
where
  A: FnMut() -> Fut,
  Fut: Future<Output = std::result::Result<T, E>>,
  C: FnMut(&E) -> bool,
{
  // 100ms, 200ms, 400ms, ...
  let strategy = ExponentialBackoff::from_millis(2)
    .factor(DELAY / 2)
    .max_delay(Duration::from_secs(2))
    .take(MAX_RETRIES);
  RetryIf::spawn(strategy, action, transient).await
}

/// Opens the broker named by `url`'s scheme: `memory://`, `redis://`/`rediss://` or `amqp://`/`amqps://`.
pub async fn connect(url: &str, prefix: &str, queues: &QueueRegistry) -> Result<Arc<dyn BrokerAdapter>> {
  let scheme = url.split("://").next().unwrap_or_default();
  let broker: Arc<dyn BrokerAdapter> = match scheme {
    "memory" => Arc::new(MemoryBroker::new()),
    "redis" | "rediss" => Arc::new(RedisBroker::connect(url, prefix).await?),
    "amqp" | "amqps" => Arc::new(AmqpBroker::connect(url, prefix, queues).await?),
    other => {
      return Err(DispatchError::Config(format!("unsupported broker scheme '{other}'")));
    }
  };
  info!(kind = broker.kind(), "Broker connected");
  Ok(broker)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test(start_paused = true)]
  async fn test_with_retry_gives_up_after_bound() {
    let calls = AtomicUsize::new(0);
    let res: std::result::Result<(), &str> = with_retry(
      || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err("down") }
      },
      |_| true,
    )
    .await;
    assert!(res.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES + 1);
  }

  #[tokio::test]
  async fn test_with_retry_skips_permanent_errors() {
    let calls = AtomicUsize::new(0);
    let res: std::result::Result<(), &str> = with_retry(
      || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err("bad request") }
      },
      |_| false,
    )
    .await;
    assert!(res.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_connect_rejects_unknown_scheme() {
    let queues = QueueRegistry::new(vec![crate::models::QueuePolicy::new(
      "default",
      crate::models::PriorityTier::Normal,
    )])
    .unwrap();
    let err = connect("kafka://localhost", DEFAULT_PREFIX, &queues).await.err().unwrap();
    assert!(matches!(err, DispatchError::Config(_)));
    assert!(connect("memory://", DEFAULT_PREFIX, &queues).await.is_ok());
  }
}
