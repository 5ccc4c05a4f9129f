use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::TaskStore;
use crate::error::Result;
use crate::models::{AttemptRecord, TaskResult, WorkerDescriptor};

#[derive(Default)]
struct Inner {
  attempts: HashMap<Uuid, BTreeMap<u32, AttemptRecord>>,
  results: HashMap<Uuid, TaskResult>,
  progress: HashMap<Uuid, (u8, DateTime<Utc>)>,
  workers: HashMap<String, WorkerDescriptor>,
}

/// Process-local store for tests and `memory://` deployments.
#[derive(Default)]
pub struct MemoryTaskStore {
  inner: RwLock<Inner>,
}

impl MemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
  fn kind(&self) -> &'static str {
    "memory"
  }

  async fn record_attempt(&self, record: &AttemptRecord) -> Result<()> {
    self
      .inner
      .write()
      .await
      .attempts
      .entry(record.message_id)
      .or_default()
      .insert(record.attempt, record.clone());
    Ok(())
  }

  async fn attempts(&self, message_id: Uuid) -> Result<Vec<AttemptRecord>> {
    let inner = self.inner.read().await;
    Ok(inner
      .attempts
      .get(&message_id)
      .map(|a| a.values().cloned().collect())
      .unwrap_or_default())
  }

  async fn attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>> {
    let inner = self.inner.read().await;
    let mut out: Vec<AttemptRecord> = inner
      .attempts
      .values()
      .flat_map(|a| a.values())
      .filter(|a| a.finished_at >= since)
      .cloned()
      .collect();
    out.sort_by_key(|a| a.finished_at);
    Ok(out)
  }

  async fn put_result(&self, result: &TaskResult) -> Result<()> {
    let mut stored = result.clone();
    stored.history.clear();
    self.inner.write().await.results.insert(stored.message_id, stored);
    Ok(())
  }

  async fn get_result(&self, message_id: Uuid) -> Result<Option<TaskResult>> {
    let inner = self.inner.read().await;
    Ok(inner.results.get(&message_id).map(|r| {
      let mut r = r.clone();
      r.history = inner
        .attempts
        .get(&message_id)
        .map(|a| a.values().cloned().collect())
        .unwrap_or_default();
      r
    }))
  }

  async fn recent_results(&self, since: DateTime<Utc>) -> Result<Vec<TaskResult>> {
    let inner = self.inner.read().await;
    let mut out: Vec<TaskResult> = inner
      .results
      .values()
      .filter(|r| r.completed_at >= since)
      .cloned()
      .collect();
    out.sort_by_key(|r| r.completed_at);
    Ok(out)
  }

  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
    let mut inner = self.inner.write().await;
    let expired: Vec<Uuid> = inner
      .results
      .values()
      .filter(|r| r.expires_at < cutoff)
      .map(|r| r.message_id)
      .collect();
    for id in &expired {
      inner.results.remove(id);
      inner.attempts.remove(id);
      inner.progress.remove(id);
    }
    Ok(expired.len() as u64)
  }

  async fn purge_orphans(&self, idle_before: DateTime<Utc>) -> Result<u64> {
    let mut inner = self.inner.write().await;
    let mut last_seen: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    let activity = inner
      .attempts
      .iter()
      .flat_map(|(id, history)| history.values().map(move |a| (*id, a.finished_at)))
      .chain(inner.progress.iter().map(|(id, (_, at))| (*id, *at)));
    for (id, at) in activity {
      let seen = last_seen.entry(id).or_insert(at);
      if at > *seen {
        *seen = at;
      }
    }
    let orphans: Vec<Uuid> = last_seen
      .into_iter()
      .filter(|(id, at)| *at < idle_before && !inner.results.contains_key(id))
      .map(|(id, _)| id)
      .collect();
    for id in &orphans {
      inner.attempts.remove(id);
      inner.progress.remove(id);
    }
    Ok(orphans.len() as u64)
  }

  async fn set_progress(&self, message_id: Uuid, progress: u8) -> Result<()> {
    self.inner.write().await.progress.insert(message_id, (progress.min(100), Utc::now()));
    Ok(())
  }

  async fn progress(&self, message_id: Uuid) -> Result<Option<u8>> {
    Ok(self.inner.read().await.progress.get(&message_id).map(|(p, _)| *p))
  }

  async fn heartbeat(&self, worker: &WorkerDescriptor) -> Result<()> {
    self
      .inner
      .write()
      .await
      .workers
      .insert(worker.worker_id.clone(), worker.clone());
    Ok(())
  }

  async fn remove_worker(&self, worker_id: &str) -> Result<()> {
    self.inner.write().await.workers.remove(worker_id);
    Ok(())
  }

  async fn workers(&self) -> Result<Vec<WorkerDescriptor>> {
    let mut out: Vec<WorkerDescriptor> = self.inner.read().await.workers.values().cloned().collect();
    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(out)
  }
}
