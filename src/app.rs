//! Startup wiring shared by every binary.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::{self, BrokerAdapter};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::monitor::Monitor;
use crate::registry::{QueueRegistry, TaskRegistry};
use crate::router::TaskRouter;
use crate::runtime::TaskRuntime;
use crate::store::{self, TaskStore};
use crate::worker_processing::standard_tasks;

/// Everything one process needs, built from the catalog in a fixed order: registries first,
/// then the broker and store connections.
#[derive(Clone)]
pub struct Services {
  pub catalog: Arc<Catalog>,
  pub queues: Arc<QueueRegistry>,
  pub router: Arc<TaskRouter>,
  pub tasks: Arc<TaskRegistry>,
  pub broker: Arc<dyn BrokerAdapter>,
  pub store: Arc<dyn TaskStore>,
  pub dispatcher: Arc<Dispatcher>,
  pub monitor: Arc<Monitor>,
}

impl Services {
  pub async fn connect(config: &Config) -> Result<Self> {
    let catalog = Catalog::load(config.catalog_path.as_deref())?;
    let queues = Arc::new(catalog.queue_registry()?);
    let router = Arc::new(catalog.router(&queues)?);
    let tasks = Arc::new(
      TaskRegistry::builder()
        .tasks(standard_tasks(config.task_step_delay))
        .build(&queues, &router)?,
    );
    if config.process_local_broker() {
      warn!(
        broker_url = %config.broker_url,
        "Using the in-process broker; other qdispatch processes will not see these queues. Set BROKER_URL to share them"
      );
    }
    let broker = broker::connect(&config.broker_url, &config.key_prefix, &queues).await?;
    let store = store::connect(config.database_url.as_deref()).await?;
    Ok(Self::assemble(config, catalog, queues, router, tasks, broker, store))
  }

  /// Wires already-open connections; used by tests with in-memory backends.
  pub fn assemble(
    config: &Config,
    catalog: Catalog,
    queues: Arc<QueueRegistry>,
    router: Arc<TaskRouter>,
    tasks: Arc<TaskRegistry>,
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn TaskStore>,
  ) -> Self {
    let dispatcher = Arc::new(Dispatcher::new(
      broker.clone(),
      store.clone(),
      queues.clone(),
      router.clone(),
      tasks.clone(),
    ));
    let monitor = Arc::new(Monitor::new(
      broker.clone(),
      store.clone(),
      queues.clone(),
      config.monitor_config(),
    ));
    info!(
      queues = queues.len(),
      tasks = tasks.len(),
      broker = broker.kind(),
      store = store.kind(),
      "Services ready"
    );
    Self {
      catalog: Arc::new(catalog),
      queues,
      router,
      tasks,
      broker,
      store,
      dispatcher,
      monitor,
    }
  }

  pub fn runtime(&self, config: &Config) -> TaskRuntime {
    TaskRuntime::new(self.broker.clone(), self.store.clone(), self.tasks.clone())
      .with_result_ttl(config.result_ttl)
      .with_lease(config.lease)
  }
}
