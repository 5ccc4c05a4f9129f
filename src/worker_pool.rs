//! Pool of executors pulling from the declared queues.
//!
//! Each executor keeps up to `prefetch` leased messages in a private reserve, runs them one at a
//! time, and publishes a heartbeat to the task store. After `max_tasks_per_executor` messages it
//! hands its unstarted reserve back to the broker and is replaced by a fresh executor.
//!
//! The reserve is ordered by tier, so a high-tier message fetched after buffered low-tier ones
//! still runs first.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerAdapter;
use crate::error::{DispatchError, Result};
use crate::models::{PriorityTier, TaskMessage, WorkerDescriptor, WorkerStatus};
use crate::registry::QueueRegistry;
use crate::runtime::{Outcome, TaskRuntime};
use crate::store::TaskStore;
use crate::worker_scheduler::PollScheduler;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
  /// Prefix of every executor id (`<worker_id>-<slot>.<generation>`).
  pub worker_id: String,
  pub concurrency: usize,
  pub prefetch: usize,
  pub max_tasks_per_executor: u64,
  /// Blocking wait of a dequeue when the pool serves a single queue.
  pub dequeue_timeout: Duration,
  pub idle_poll: Duration,
  pub heartbeat_interval: Duration,
  pub shutdown_timeout: Duration,
  /// Serve only these queues. `None` serves every declared queue.
  pub queues: Option<Vec<String>>,
}

impl Default for WorkerPoolConfig {
  fn default() -> Self {
    Self {
      worker_id: "worker".to_string(),
      concurrency: 4,
      prefetch: 4,
      max_tasks_per_executor: 1000,
      dequeue_timeout: Duration::from_secs(1),
      idle_poll: Duration::from_millis(200),
      heartbeat_interval: Duration::from_secs(10),
      shutdown_timeout: Duration::from_secs(60),
      queues: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
  pub executors: usize,
  pub active: usize,
  pub completed: u64,
  pub failed: u64,
  pub retried: u64,
  pub retired_executors: u64,
  pub average_duration: Duration,
}

impl PoolStats {
  pub fn total_processed(&self) -> u64 {
    self.completed + self.failed + self.retried
  }

  pub fn success_rate(&self) -> f64 {
    let total = self.completed + self.failed;
    if total == 0 {
      return 0.0;
    }
    (self.completed as f64 / total as f64) * 100.0
  }
}

#[derive(Default)]
struct SharedPoolStats {
  completed: AtomicU64,
  failed: AtomicU64,
  retried: AtomicU64,
  retired: AtomicU64,
  total_duration_ms: AtomicU64,
  active: AtomicU64,
}

impl SharedPoolStats {
  fn record(&self, outcome: &Outcome, duration: Duration) {
    let counter = match outcome {
      Outcome::Succeeded { .. } => &self.completed,
      Outcome::Retrying { .. } => &self.retried,
      Outcome::Failed { .. } => &self.failed,
    };
    counter.fetch_add(1, Ordering::SeqCst);
    self.total_duration_ms.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
  }

  fn to_pool_stats(&self, executors: usize) -> PoolStats {
    let completed = self.completed.load(Ordering::SeqCst);
    let failed = self.failed.load(Ordering::SeqCst);
    let retried = self.retried.load(Ordering::SeqCst);
    let runs = completed + failed + retried;
    let average_duration = if runs > 0 {
      Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / runs)
    } else {
      Duration::ZERO
    };
    PoolStats {
      executors,
      active: self.active.load(Ordering::SeqCst) as usize,
      completed,
      failed,
      retried,
      retired_executors: self.retired.load(Ordering::SeqCst),
      average_duration,
    }
  }
}

/// Live counters of one executor, read by its heartbeat task.
#[derive(Default)]
struct Gauge {
  active: AtomicU32,
  reserved: AtomicU32,
  processed: AtomicU64,
  retry_due: Mutex<Vec<Instant>>,
}

impl Gauge {
  async fn descriptor(&self, worker_id: &str) -> WorkerDescriptor {
    let now = Instant::now();
    let scheduled = {
      let mut due = self.retry_due.lock().await;
      due.retain(|at| *at > now);
      due.len() as u32
    };
    let active = self.active.load(Ordering::SeqCst);
    WorkerDescriptor {
      worker_id: worker_id.to_string(),
      status: if active > 0 { WorkerStatus::Busy } else { WorkerStatus::Idle },
      active,
      scheduled,
      reserved: self.reserved.load(Ordering::SeqCst),
      processed: self.processed.load(Ordering::SeqCst),
      last_seen: Utc::now(),
    }
  }
}

async fn run_heartbeat(
  worker_id: String,
  gauge: Arc<Gauge>,
  store: Arc<dyn TaskStore>,
  interval: Duration,
  mut stop: oneshot::Receiver<()>,
) {
  let mut ticker = tokio::time::interval(interval);
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        let descriptor = gauge.descriptor(&worker_id).await;
        if let Err(e) = store.heartbeat(&descriptor).await {
          warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
        }
      }
      _ = &mut stop => break,
    }
  }
  if let Err(e) = store.remove_worker(&worker_id).await {
    warn!(worker_id = %worker_id, error = %e, "Failed to remove worker heartbeat");
  }
}

/// A leased message waiting in an executor's reserve.
#[derive(Debug)]
struct Reserved {
  tier: PriorityTier,
  seq: u64,
  message: TaskMessage,
}

impl PartialEq for Reserved {
  fn eq(&self, other: &Self) -> bool {
    self.tier == other.tier && self.seq == other.seq
  }
}

impl Eq for Reserved {}

impl PartialOrd for Reserved {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Ord for Reserved {
  // higher tier first, then arrival order
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.tier.cmp(&other.tier).then_with(|| other.seq.cmp(&self.seq))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
  Retired,
  Shutdown,
}

struct Executor {
  id: String,
  config: Arc<WorkerPoolConfig>,
  broker: Arc<dyn BrokerAdapter>,
  store: Arc<dyn TaskStore>,
  runtime: Arc<TaskRuntime>,
  scheduler: PollScheduler,
  stats: Arc<SharedPoolStats>,
  shutdown: watch::Receiver<bool>,
  gauge: Arc<Gauge>,
  reserve: BinaryHeap<Reserved>,
  next_seq: u64,
  last_renewal: Instant,
}

impl Executor {
  fn shutdown_requested(&self) -> bool {
    *self.shutdown.borrow()
  }

  fn reserve_message(&mut self, message: TaskMessage) {
    let tier = self.scheduler.tier_of(&message.queue).unwrap_or(PriorityTier::Low);
    self.next_seq += 1;
    self.reserve.push(Reserved {
      tier,
      seq: self.next_seq,
      message,
    });
  }

  /// Tops the reserve up to `prefetch`, polling queues in scheduler order.
  async fn fill_reserve(&mut self) -> Result<()> {
    let lease = self.runtime.lease();
    while self.reserve.len() < self.config.prefetch {
      let order: Vec<String> = self.scheduler.poll_order().into_iter().map(str::to_string).collect();
      let wait = if order.len() == 1 && self.reserve.is_empty() {
        self.config.dequeue_timeout
      } else {
        Duration::ZERO
      };
      let mut got = None;
      for queue in &order {
        if let Some(message) = self.broker.dequeue(queue, lease, wait).await? {
          self.scheduler.mark_served(queue);
          got = Some(message);
          break;
        }
      }
      match got {
        Some(message) => {
          debug!(worker_id = %self.id, message_id = %message.message_id, queue = %message.queue, "Reserved message");
          self.reserve_message(message);
        }
        None => break,
      }
    }
    self.gauge.reserved.store(self.reserve.len() as u32, Ordering::SeqCst);
    Ok(())
  }

  /// Keeps leases of buffered messages alive while they wait for their turn.
  async fn renew_reserve(&mut self) {
    let lease = self.runtime.lease();
    if self.last_renewal.elapsed() < lease / 2 {
      return;
    }
    self.last_renewal = Instant::now();
    for Reserved { message, .. } in self.reserve.iter() {
      if let Err(e) = self.broker.renew_lease(message.message_id, lease).await {
        warn!(worker_id = %self.id, message_id = %message.message_id, error = %e, "Reserve lease renewal failed");
      }
    }
  }

  async fn process(&mut self, message: TaskMessage) {
    let message_id = message.message_id;
    self.stats.active.fetch_add(1, Ordering::SeqCst);
    self.gauge.active.fetch_add(1, Ordering::SeqCst);
    let started = std::time::Instant::now();

    match self.runtime.execute(message, Some(&self.id)).await {
      Ok(outcome) => {
        if let Outcome::Retrying { delay, .. } = &outcome {
          self.gauge.retry_due.lock().await.push(Instant::now() + *delay);
        }
        self.stats.record(&outcome, started.elapsed());
      }
      Err(e) => {
        error!(worker_id = %self.id, message_id = %message_id, error = %e, "Could not record task outcome");
        if let Err(e) = self.broker.nack(message_id, true).await {
          warn!(worker_id = %self.id, message_id = %message_id, error = %e, "Nack failed, message returns when its lease expires");
        }
      }
    }

    self.gauge.processed.fetch_add(1, Ordering::SeqCst);
    self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    self.stats.active.fetch_sub(1, Ordering::SeqCst);
  }

  /// Hands every unstarted message back to its queue.
  async fn release_reserve(&mut self) {
    for Reserved { message, .. } in std::mem::take(&mut self.reserve).into_vec() {
      if let Err(e) = self.broker.nack(message.message_id, true).await {
        warn!(worker_id = %self.id, message_id = %message.message_id, error = %e, "Failed to release reserved message");
      }
    }
    self.gauge.reserved.store(0, Ordering::SeqCst);
  }

  async fn run(mut self) -> Exit {
    let (stop_tx, stop_rx) = oneshot::channel();
    let heartbeat = tokio::spawn(run_heartbeat(
      self.id.clone(),
      self.gauge.clone(),
      self.store.clone(),
      self.config.heartbeat_interval,
      stop_rx,
    ));
    info!(worker_id = %self.id, "Executor started");

    let mut processed = 0u64;
    let exit = loop {
      if self.shutdown_requested() {
        break Exit::Shutdown;
      }
      if processed >= self.config.max_tasks_per_executor {
        break Exit::Retired;
      }

      if let Err(e) = self.fill_reserve().await {
        warn!(worker_id = %self.id, error = %e, "Dequeue failed");
      }
      self.renew_reserve().await;

      match self.reserve.pop() {
        Some(Reserved { message, .. }) => {
          self.gauge.reserved.store(self.reserve.len() as u32, Ordering::SeqCst);
          self.process(message).await;
          processed += 1;
        }
        None => {
          tokio::select! {
            _ = self.shutdown.changed() => break Exit::Shutdown,
            _ = tokio::time::sleep(self.config.idle_poll) => {}
          }
        }
      }
    };

    self.release_reserve().await;
    let _ = stop_tx.send(());
    if let Err(e) = heartbeat.await {
      error!(worker_id = %self.id, error = %e, "Heartbeat task panicked");
    }
    match exit {
      Exit::Retired => info!(worker_id = %self.id, processed, "Executor retired"),
      Exit::Shutdown => info!(worker_id = %self.id, processed, "Executor stopped"),
    }
    exit
  }
}

pub struct WorkerPool {
  config: Arc<WorkerPoolConfig>,
  broker: Arc<dyn BrokerAdapter>,
  store: Arc<dyn TaskStore>,
  runtime: Arc<TaskRuntime>,
  queues: Arc<QueueRegistry>,
  shutdown_tx: watch::Sender<bool>,
  handles: Vec<JoinHandle<()>>,
  stats: Arc<SharedPoolStats>,
  is_running: AtomicBool,
}

impl WorkerPool {
  pub fn new(
    config: WorkerPoolConfig,
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn TaskStore>,
    runtime: Arc<TaskRuntime>,
    queues: Arc<QueueRegistry>,
  ) -> Self {
    let (shutdown_tx, _) = watch::channel(false);
    Self {
      config: Arc::new(config),
      broker,
      store,
      runtime,
      queues,
      shutdown_tx,
      handles: Vec::new(),
      stats: Arc::new(SharedPoolStats::default()),
      is_running: AtomicBool::new(false),
    }
  }

  /// Spawns one supervised executor per concurrency slot.
  pub fn start(&mut self) -> Result<()> {
    if self.is_running.load(Ordering::SeqCst) {
      return Err(DispatchError::Config("worker pool is already running".into()));
    }
    if let Some(only) = &self.config.queues {
      for queue in only {
        self.queues.get(queue)?;
      }
    }
    let scheduler = PollScheduler::new(&self.queues, self.config.queues.as_deref());
    if scheduler.is_empty() {
      return Err(DispatchError::Config("worker pool has no queues to serve".into()));
    }

    self.shutdown_tx.send_replace(false);
    for slot in 0..self.config.concurrency {
      let config = self.config.clone();
      let broker = self.broker.clone();
      let store = self.store.clone();
      let runtime = self.runtime.clone();
      let stats = self.stats.clone();
      let scheduler = scheduler.clone();
      // subscribed before spawning, so a stop sent before the first poll is still seen
      let shutdown = self.shutdown_tx.subscribe();

      self.handles.push(tokio::spawn(async move {
        let mut generation = 0u64;
        loop {
          if *shutdown.borrow() {
            break;
          }
          let executor = Executor {
            id: format!("{}-{}.{}", config.worker_id, slot, generation),
            config: config.clone(),
            broker: broker.clone(),
            store: store.clone(),
            runtime: runtime.clone(),
            scheduler: scheduler.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            gauge: Arc::new(Gauge::default()),
            reserve: BinaryHeap::new(),
            next_seq: 0,
            last_renewal: Instant::now(),
          };
          match executor.run().await {
            Exit::Shutdown => break,
            Exit::Retired => {
              stats.retired.fetch_add(1, Ordering::SeqCst);
              generation += 1;
            }
          }
        }
      }));
    }

    self.is_running.store(true, Ordering::SeqCst);
    info!(
      executors = self.config.concurrency,
      prefetch = self.config.prefetch,
      max_tasks = self.config.max_tasks_per_executor,
      "Worker pool started"
    );
    Ok(())
  }

  /// Signals every executor and waits for in-flight work, up to the shutdown timeout.
  pub async fn shutdown(&mut self) -> Result<()> {
    if !self.is_running.load(Ordering::SeqCst) {
      return Err(DispatchError::Config("worker pool is not running".into()));
    }
    info!("Initiating worker pool shutdown");
    self.shutdown_tx.send_replace(true);

    let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
    let wait_all = async {
      for handle in handles {
        if let Err(e) = handle.await {
          error!(error = %e, "Executor panicked during shutdown");
        }
      }
    };
    self.is_running.store(false, Ordering::SeqCst);
    match tokio::time::timeout(self.config.shutdown_timeout, wait_all).await {
      Ok(()) => {
        info!("Worker pool shutdown complete");
        Ok(())
      }
      Err(_) => Err(DispatchError::Config(format!(
        "worker pool did not stop within {:?}",
        self.config.shutdown_timeout
      ))),
    }
  }

  pub fn stats(&self) -> PoolStats {
    self.stats.to_pool_stats(self.config.concurrency)
  }

  pub fn is_running(&self) -> bool {
    self.is_running.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::MemoryBroker;
  use crate::models::{PriorityTier, QueuePolicy, ResultStatus};
  use crate::registry::{TaskRegistry, TaskSpec};
  use crate::router::TaskRouter;
  use crate::store::MemoryTaskStore;
  use crate::task::work_fn;
  use serde_json::{json, Value};
  use std::sync::Mutex as StdMutex;

  struct Fixture {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryTaskStore>,
    pool: WorkerPool,
  }

  fn fixture(config: WorkerPoolConfig, order: Arc<StdMutex<Vec<String>>>) -> Fixture {
    fixture_with_search_delay(config, order, Duration::ZERO)
  }

  fn fixture_with_search_delay(
    config: WorkerPoolConfig,
    order: Arc<StdMutex<Vec<String>>>,
    search_delay: Duration,
  ) -> Fixture {
    let queues = Arc::new(
      QueueRegistry::new(vec![
        QueuePolicy::new("default", PriorityTier::Normal).with_retries(1, 1, 1),
        QueuePolicy::new("search", PriorityTier::Low),
        QueuePolicy::new("notifications", PriorityTier::High),
      ])
      .unwrap(),
    );
    let router = TaskRouter::new([("update_search_index", "search"), ("notify", "notifications")], &queues).unwrap();
    let record = move |name: &'static str, delay: Duration| {
      let order = order.clone();
      work_fn(move |_: Value, _| {
        let order = order.clone();
        async move {
          order.lock().unwrap().push(name.to_string());
          tokio::time::sleep(delay).await;
          Ok(json!(name))
        }
      })
    };
    let tasks = Arc::new(
      TaskRegistry::builder()
        .task(TaskSpec::new("update_search_index", record("search", search_delay)))
        .task(TaskSpec::new("notify", record("notify", Duration::ZERO)))
        .task(TaskSpec::new("plain", record("plain", Duration::ZERO)))
        .build(&queues, &router)
        .unwrap(),
    );
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryTaskStore::new());
    let runtime = Arc::new(TaskRuntime::new(broker.clone(), store.clone(), tasks));
    let pool = WorkerPool::new(config, broker.clone(), store.clone(), runtime, queues);
    Fixture { broker, store, pool }
  }

  fn fast_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
      worker_id: "test".into(),
      concurrency: 1,
      prefetch: 1,
      idle_poll: Duration::from_millis(10),
      heartbeat_interval: Duration::from_millis(20),
      shutdown_timeout: Duration::from_secs(5),
      ..Default::default()
    }
  }

  async fn wait_until_drained(broker: &MemoryBroker, queues: &[&str]) {
    for _ in 0..200 {
      let mut total = 0;
      for q in queues {
        total += broker.queue_depth(q).await.unwrap().total();
      }
      if total == 0 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queues were not drained");
  }

  #[tokio::test]
  async fn test_high_tier_served_first() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let mut f = fixture(fast_config(), order.clone());
    f.broker
      .enqueue("search", &TaskMessage::new("update_search_index", "search", json!({})))
      .await
      .unwrap();
    f.broker.enqueue("default", &TaskMessage::new("plain", "default", json!({}))).await.unwrap();
    f.broker
      .enqueue("notifications", &TaskMessage::new("notify", "notifications", json!({})))
      .await
      .unwrap();

    f.pool.start().unwrap();
    wait_until_drained(&f.broker, &["search", "default", "notifications"]).await;
    f.pool.shutdown().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["notify", "plain", "search"]);
    let stats = f.pool.stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.success_rate(), 100.0);
  }

  #[tokio::test]
  async fn test_reserve_runs_late_high_tier_message_first() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let config = WorkerPoolConfig {
      prefetch: 4,
      ..fast_config()
    };
    let mut f = fixture_with_search_delay(config, order.clone(), Duration::from_millis(100));
    for _ in 0..4 {
      f.broker
        .enqueue("search", &TaskMessage::new("update_search_index", "search", json!({})))
        .await
        .unwrap();
    }

    f.pool.start().unwrap();
    // the first search is running, three more sit in the reserve
    tokio::time::sleep(Duration::from_millis(30)).await;
    f.broker
      .enqueue("notifications", &TaskMessage::new("notify", "notifications", json!({})))
      .await
      .unwrap();
    wait_until_drained(&f.broker, &["search", "notifications"]).await;
    f.pool.shutdown().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["search", "notify", "search", "search", "search"]);
  }

  #[tokio::test]
  async fn test_shutdown_right_after_start() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let config = WorkerPoolConfig {
      concurrency: 3,
      shutdown_timeout: Duration::from_millis(500),
      ..fast_config()
    };
    let mut f = fixture(config, order);
    f.pool.start().unwrap();
    f.pool.shutdown().await.unwrap();
    assert!(!f.pool.is_running());

    // the pool can be started again after a stop
    f.pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    f.pool.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_executor_retires_and_is_replaced() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let config = WorkerPoolConfig {
      max_tasks_per_executor: 2,
      ..fast_config()
    };
    let mut f = fixture(config, order.clone());
    let mut ids = Vec::new();
    for _ in 0..5 {
      ids.push(f.broker.enqueue("default", &TaskMessage::new("plain", "default", json!({}))).await.unwrap());
    }

    f.pool.start().unwrap();
    wait_until_drained(&f.broker, &["default"]).await;
    // the last message may still be recording its result
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.pool.shutdown().await.unwrap();

    for id in ids {
      let result = f.store.get_result(id).await.unwrap().unwrap();
      assert_eq!(result.status, ResultStatus::Success);
    }
    assert!(f.pool.stats().retired_executors >= 2);
  }

  #[tokio::test]
  async fn test_heartbeat_published_and_removed() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let mut f = fixture(fast_config(), order);
    f.pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let workers = f.store.workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, "test-0.0");
    assert_eq!(workers[0].status, WorkerStatus::Idle);

    f.pool.shutdown().await.unwrap();
    assert!(f.store.workers().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_reserve_released_on_shutdown() {
    let slow = work_fn(|_: Value, _| async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok(Value::Null)
    });
    let queues = Arc::new(QueueRegistry::new(vec![QueuePolicy::new("default", PriorityTier::Normal)]).unwrap());
    let router = TaskRouter::new(Vec::<(String, String)>::new(), &queues).unwrap();
    let tasks = Arc::new(
      TaskRegistry::builder()
        .task(TaskSpec::new("slow", slow))
        .build(&queues, &router)
        .unwrap(),
    );
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryTaskStore::new());
    let runtime = Arc::new(TaskRuntime::new(broker.clone(), store.clone(), tasks));
    let config = WorkerPoolConfig {
      prefetch: 3,
      ..fast_config()
    };
    let mut pool = WorkerPool::new(config, broker.clone(), store.clone(), runtime, queues);
    for _ in 0..3 {
      broker.enqueue("default", &TaskMessage::new("slow", "default", json!({}))).await.unwrap();
    }
    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.shutdown().await.unwrap();

    // one ran to completion, the two buffered ones are visible again
    let depth = broker.queue_depth("default").await.unwrap();
    assert_eq!(depth.ready, 2);
    assert_eq!(depth.leased, 0);
  }
}
