use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use qdispatch::app::Services;
use qdispatch::broker::{BrokerAdapter, MemoryBroker};
use qdispatch::catalog::Catalog;
use qdispatch::config::Config;
use qdispatch::models::{CancelOutcome, PriorityTier, QueuePolicy, ResultStatus, TaskMessage};
use qdispatch::monitor::{HealthStatus, PurgeConfirmation, CANCELLED_ERROR};
use qdispatch::registry::{QueueRegistry, TaskRegistry, TaskSpec};
use qdispatch::router::TaskRouter;
use qdispatch::runtime::TaskRuntime;
use qdispatch::scheduler::{ScheduleConfig, ScheduleEntry, Scheduler};
use qdispatch::store::{run_reaper, MemoryTaskStore, TaskStore};
use qdispatch::task::work_fn;
use qdispatch::worker_pool::{WorkerPool, WorkerPoolConfig};
use qdispatch::worker_processing::standard_tasks;

const WAIT: Duration = Duration::from_secs(5);

fn pool_config() -> WorkerPoolConfig {
  WorkerPoolConfig {
    worker_id: "itest".into(),
    concurrency: 1,
    prefetch: 1,
    dequeue_timeout: Duration::from_millis(20),
    idle_poll: Duration::from_millis(5),
    heartbeat_interval: Duration::from_millis(20),
    shutdown_timeout: Duration::from_secs(5),
    ..WorkerPoolConfig::default()
  }
}

/// The deployed catalog on in-memory backends.
fn standard_services() -> (Services, Arc<MemoryBroker>) {
  let config = Config::from_lookup(|_| None).unwrap();
  let catalog = Catalog::standard();
  let queues = Arc::new(catalog.queue_registry().unwrap());
  let router = Arc::new(catalog.router(&queues).unwrap());
  let tasks = Arc::new(
    TaskRegistry::builder()
      .tasks(standard_tasks(Duration::ZERO))
      .build(&queues, &router)
      .unwrap(),
  );
  let broker = Arc::new(MemoryBroker::new());
  let store = Arc::new(MemoryTaskStore::new());
  let services = Services::assemble(&config, catalog, queues, router, tasks, broker.clone(), store);
  (services, broker)
}

fn start_pool(services: &Services) -> WorkerPool {
  let runtime = Arc::new(TaskRuntime::new(
    services.broker.clone(),
    services.store.clone(),
    services.tasks.clone(),
  ));
  let mut pool = WorkerPool::new(
    pool_config(),
    services.broker.clone(),
    services.store.clone(),
    runtime,
    services.queues.clone(),
  );
  pool.start().unwrap();
  pool
}

fn six_hundred_words() -> String {
  vec!["lorem"; 600].join(" ")
}

#[tokio::test]
async fn always_failing_summarize_retries_three_times() {
  let queues = Arc::new(
    QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("ai_content", PriorityTier::Normal).with_retries(3, 2, 5),
    ])
    .unwrap(),
  );
  let router = Arc::new(TaskRouter::new([("summarize", "ai_content")], &queues).unwrap());
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  let failing = work_fn(move |_: Value, _| {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Err(anyhow::anyhow!("model backend unavailable"))
    }
  });
  let tasks = Arc::new(
    TaskRegistry::builder()
      .task(TaskSpec::new("summarize", failing))
      .build(&queues, &router)
      .unwrap(),
  );
  let config = Config::from_lookup(|_| None).unwrap();
  let services = Services::assemble(
    &config,
    Catalog::standard(),
    queues,
    router,
    tasks,
    Arc::new(MemoryBroker::new()),
    Arc::new(MemoryTaskStore::new()),
  );

  let id = services
    .dispatcher
    .submit("summarize", json!({"text": six_hundred_words()}))
    .await
    .unwrap();
  let mut pool = start_pool(&services);
  let result = services.dispatcher.get_result(id, WAIT).await.unwrap();
  pool.shutdown().await.unwrap();

  assert_eq!(result.status, ResultStatus::Failed);
  assert_eq!(result.attempts, 4);
  assert_eq!(result.history.len(), 4);
  assert_eq!(calls.load(Ordering::SeqCst), 4);
  assert!(result.error_detail.unwrap().contains("exhausted its retries"));

  let delays: Vec<u64> = result.history.iter().filter_map(|a| a.backoff_ms).collect();
  assert_eq!(delays.len(), 3);
  assert!(delays.windows(2).all(|w| w[0] <= w[1]));
  assert!(delays.iter().all(|d| (2..=5).contains(d)));
  assert_eq!(delays, vec![2, 4, 5]);
}

#[tokio::test]
async fn killed_worker_does_not_lose_the_message() {
  let (services, broker) = standard_services();
  let id = services
    .dispatcher
    .submit("grade_assignment_ai", json!({"submission_id": 12}))
    .await
    .unwrap();

  // A worker leases the message and dies without acking.
  let leased = broker
    .dequeue("ai_assessment", Duration::from_millis(30), Duration::ZERO)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(leased.message_id, id);
  assert_eq!(broker.queue_depth("ai_assessment").await.unwrap().leased, 1);

  tokio::time::sleep(Duration::from_millis(60)).await;
  let mut pool = start_pool(&services);
  let result = services.dispatcher.get_result(id, WAIT).await.unwrap();
  pool.shutdown().await.unwrap();

  assert_eq!(result.status, ResultStatus::Success);
  assert_eq!(broker.queue_depth("ai_assessment").await.unwrap().total(), 0);
}

#[tokio::test]
async fn queue_stats_count_every_unacked_message() {
  let (services, broker) = standard_services();
  for _ in 0..3 {
    services
      .dispatcher
      .submit("update_search_index", json!({}))
      .await
      .unwrap();
  }
  for _ in 0..2 {
    services
      .dispatcher
      .submit("generate_weekly_report", json!({}))
      .await
      .unwrap();
  }
  // one leased, one waiting out a backoff
  broker
    .dequeue("search", Duration::from_secs(60), Duration::ZERO)
    .await
    .unwrap()
    .unwrap();
  let delayed = broker
    .dequeue("analytics", Duration::from_secs(60), Duration::ZERO)
    .await
    .unwrap()
    .unwrap();
  broker.retry_later(&delayed, Duration::from_secs(60)).await.unwrap();

  let stats = services.monitor.queue_stats().await.unwrap();
  assert_eq!(stats.len(), 10);
  assert_eq!(stats.values().map(|s| s.pending_count).sum::<u64>(), 5);
  assert_eq!(stats["search"].depth.leased, 1);
  assert_eq!(stats["analytics"].depth.delayed, 1);
}

#[tokio::test]
async fn cancel_pending_versus_running() {
  let (services, broker) = standard_services();
  let running = services
    .dispatcher
    .submit("draft_email_response", json!({"message_id": 1}))
    .await
    .unwrap();
  let pending = services
    .dispatcher
    .submit("draft_email_response", json!({"message_id": 2}))
    .await
    .unwrap();
  let held = broker
    .dequeue("ai_communication", Duration::from_secs(60), Duration::ZERO)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(held.message_id, running);

  assert!(matches!(
    services.monitor.cancel_task(running).await.unwrap(),
    CancelOutcome::NotCancellable { .. }
  ));
  assert_eq!(services.monitor.cancel_task(pending).await.unwrap(), CancelOutcome::Cancelled);

  // Nothing left for a worker to pick up.
  let mut pool = start_pool(&services);
  tokio::time::sleep(Duration::from_millis(100)).await;
  pool.shutdown().await.unwrap();
  assert_eq!(pool.stats().total_processed(), 0);

  let result = services.dispatcher.get_result(pending, Duration::ZERO).await.unwrap();
  assert_eq!(result.status, ResultStatus::Failed);
  assert_eq!(result.error_detail.as_deref(), Some(CANCELLED_ERROR));
  assert!(result.history.is_empty());
}

#[tokio::test]
async fn failed_backup_is_not_retried_and_degrades_health_to_warning() {
  let (services, _) = standard_services();
  let backup = ScheduleConfig {
    payload: json!({"fail": true}),
    ..ScheduleConfig::new("backup-course-data", "backup_course_data", "0 3 * * *", Some("system"))
  };
  let mut scheduler = Scheduler::new(
    vec![ScheduleEntry::from_config(&backup).unwrap()],
    services.dispatcher.clone(),
    services.store.clone(),
  )
  .unwrap();

  let at = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 15).unwrap();
  let fired = scheduler.tick(at).await;
  assert_eq!(fired.len(), 1);
  let id = *fired[0].result.as_ref().unwrap();
  assert!(scheduler.tick(at + chrono::Duration::seconds(30)).await.is_empty());

  let mut pool = start_pool(&services);
  let result = services.dispatcher.get_result(id, WAIT).await.unwrap();
  assert_eq!(result.status, ResultStatus::Failed);
  assert_eq!(result.attempts, 1);
  assert_eq!(result.history.len(), 1);

  assert_eq!(scheduler.collect_failures().await.unwrap(), 1);
  assert_eq!(scheduler.failures()[0].task_name, "backup_course_data");
  assert_eq!(scheduler.failures()[0].message_id, Some(id));

  let health = services.monitor.system_health().await;
  pool.shutdown().await.unwrap();
  assert_eq!(health.components["tasks"].status, HealthStatus::Warning);
  assert_eq!(health.components["workers"].status, HealthStatus::Healthy);
  assert_eq!(health.overall_status, HealthStatus::Warning);
}

#[tokio::test]
async fn purge_empties_only_the_named_queue() {
  let (services, _) = standard_services();
  for i in 0..12 {
    services
      .dispatcher
      .submit("generate_course_summary", json!({"course_id": i, "content_text": "x"}))
      .await
      .unwrap();
  }
  for _ in 0..3 {
    services
      .dispatcher
      .submit("update_search_index", json!({}))
      .await
      .unwrap();
  }
  assert_eq!(services.monitor.queue_health("ai_content").await.unwrap().pending_count, 12);

  let report = services
    .monitor
    .purge_queue("ai_content", PurgeConfirmation::for_queue("ai_content"))
    .await
    .unwrap();
  assert_eq!(report.purged, 12);

  let stats = services.monitor.queue_stats().await.unwrap();
  assert_eq!(stats["ai_content"].pending_count, 0);
  assert_eq!(stats["search"].pending_count, 3);
  for (name, s) in &stats {
    if name != "ai_content" && name != "search" {
      assert_eq!(s.pending_count, 0, "{name}");
    }
  }
}

#[tokio::test]
async fn progress_and_performance_after_a_run() {
  let (services, _) = standard_services();
  let id = services
    .dispatcher
    .submit("generate_course_summary", json!({"course_id": 3, "content_text": six_hundred_words()}))
    .await
    .unwrap();
  let mut pool = start_pool(&services);
  let result = services.dispatcher.get_result(id, WAIT).await.unwrap();
  pool.shutdown().await.unwrap();

  assert_eq!(result.status, ResultStatus::Success);
  assert_eq!(result.result_payload.unwrap()["word_count"], 600);
  assert_eq!(services.monitor.task_progress(id).await.unwrap(), Some(100));

  let report = services.monitor.performance_report(Duration::from_secs(60)).await.unwrap();
  assert_eq!(report.completed, 1);
  assert_eq!(report.succeeded, 1);
  assert!(report.recommendations.is_empty());
  assert!(services.store.recent_results(Utc::now() - chrono::Duration::minutes(1)).await.unwrap().len() == 1);

  let untouched = TaskMessage::new("generate_course_summary", "ai_content", json!({}));
  assert_eq!(services.monitor.task_progress(untouched.message_id).await.unwrap(), None);
}

#[tokio::test]
async fn reaper_clears_history_of_a_purged_retrying_message() {
  let queues = Arc::new(
    QueueRegistry::new(vec![
      QueuePolicy::new("default", PriorityTier::Normal),
      QueuePolicy::new("ai_content", PriorityTier::Normal).with_retries(3, 60_000, 60_000),
    ])
    .unwrap(),
  );
  let router = Arc::new(TaskRouter::new([("summarize", "ai_content")], &queues).unwrap());
  let failing = work_fn(|_: Value, ctx| async move {
    ctx.report_progress(40).await;
    Err(anyhow::anyhow!("model backend unavailable"))
  });
  let tasks = Arc::new(
    TaskRegistry::builder()
      .task(TaskSpec::new("summarize", failing))
      .build(&queues, &router)
      .unwrap(),
  );
  let config = Config::from_lookup(|_| None).unwrap();
  let services = Services::assemble(
    &config,
    Catalog::standard(),
    queues,
    router,
    tasks,
    Arc::new(MemoryBroker::new()),
    Arc::new(MemoryTaskStore::new()),
  );

  let id = services.dispatcher.submit("summarize", json!({})).await.unwrap();
  let mut pool = start_pool(&services);
  let mut waiting_out_backoff = false;
  for _ in 0..200 {
    if services.broker.queue_depth("ai_content").await.unwrap().delayed == 1 {
      waiting_out_backoff = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  pool.shutdown().await.unwrap();
  assert!(waiting_out_backoff);
  assert_eq!(services.store.attempts(id).await.unwrap().len(), 1);

  let report = services
    .monitor
    .purge_queue("ai_content", PurgeConfirmation::for_queue("ai_content"))
    .await
    .unwrap();
  assert_eq!(report.purged, 1);
  assert!(services.store.get_result(id).await.unwrap().is_none());

  let (tx, rx) = broadcast::channel(1);
  let reaper = tokio::spawn(run_reaper(
    services.store.clone(),
    Duration::from_millis(10),
    Duration::from_secs(3600),
    Duration::ZERO,
    rx,
  ));
  tokio::time::sleep(Duration::from_millis(50)).await;
  tx.send(()).unwrap();
  reaper.await.unwrap();

  assert!(services.store.attempts(id).await.unwrap().is_empty());
  assert_eq!(services.store.progress(id).await.unwrap(), None);
}
