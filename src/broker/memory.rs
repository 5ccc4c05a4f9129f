//! In-process broker. Same lease/visibility semantics as the networked brokers,
//! so the runtime and pool can be exercised without a server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{BrokerAdapter, Removal};
use crate::error::{DispatchError, Result};
use crate::models::{QueueDepth, TaskMessage};

const IDLE_RECHECK: Duration = Duration::from_millis(20);

#[derive(Default)]
struct QueueState {
  ready: VecDeque<TaskMessage>,
  delayed: Vec<TaskMessage>,
}

struct Lease {
  message: TaskMessage,
  expires_at: Instant,
}

#[derive(Default)]
struct Inner {
  queues: HashMap<String, QueueState>,
  leases: HashMap<Uuid, Lease>,
}

impl Inner {
  /// Expired leases go back to the front of their queue; due delayed messages to the back.
  fn settle(&mut self) {
    let now = Instant::now();
    let expired: Vec<Uuid> = self
      .leases
      .iter()
      .filter(|(_, lease)| lease.expires_at <= now)
      .map(|(id, _)| *id)
      .collect();
    for id in expired {
      if let Some(lease) = self.leases.remove(&id) {
        let queue = self.queues.entry(lease.message.queue.clone()).or_default();
        queue.ready.push_front(lease.message);
      }
    }

    let wall = Utc::now();
    for state in self.queues.values_mut() {
      if state.delayed.is_empty() {
        continue;
      }
      let mut due: Vec<TaskMessage> = Vec::new();
      state.delayed.retain(|m| {
        if m.is_ready(wall) {
          due.push(m.clone());
          false
        } else {
          true
        }
      });
      due.sort_by_key(|m| m.not_before);
      state.ready.extend(due);
    }
  }
}

pub struct MemoryBroker {
  inner: Mutex<Inner>,
  online: AtomicBool,
  notify: Notify,
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      online: AtomicBool::new(true),
      notify: Notify::new(),
    }
  }

  /// Simulates the transport going away (or coming back).
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  fn check_online(&self) -> Result<()> {
    if self.online.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(DispatchError::BrokerUnavailable("memory broker is offline".into()))
    }
  }

  fn push(inner: &mut Inner, message: TaskMessage) {
    let state = inner.queues.entry(message.queue.clone()).or_default();
    if message.is_ready(Utc::now()) {
      state.ready.push_back(message);
    } else {
      state.delayed.push(message);
    }
  }
}

#[async_trait]
impl BrokerAdapter for MemoryBroker {
  fn kind(&self) -> &'static str {
    "memory"
  }

  async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<Uuid> {
    self.check_online()?;
    let mut message = message.clone();
    message.queue = queue.to_string();
    let id = message.message_id;
    Self::push(&mut *self.inner.lock().await, message);
    self.notify.notify_waiters();
    Ok(id)
  }

  async fn dequeue(&self, queue: &str, lease: Duration, timeout: Duration) -> Result<Option<TaskMessage>> {
    let deadline = Instant::now() + timeout;
    loop {
      self.check_online()?;
      {
        let mut inner = self.inner.lock().await;
        inner.settle();
        let next = inner.queues.get_mut(queue).and_then(|q| q.ready.pop_front());
        if let Some(message) = next {
          inner.leases.insert(
            message.message_id,
            Lease {
              message: message.clone(),
              expires_at: Instant::now() + lease,
            },
          );
          return Ok(Some(message));
        }
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      let wait = (deadline - now).min(IDLE_RECHECK);
      let _ = tokio::time::timeout(wait, self.notify.notified()).await;
    }
  }

  async fn ack(&self, message_id: Uuid) -> Result<()> {
    self.check_online()?;
    self.inner.lock().await.leases.remove(&message_id);
    Ok(())
  }

  async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<()> {
    self.check_online()?;
    let mut inner = self.inner.lock().await;
    if let Some(lease) = inner.leases.remove(&message_id) {
      if requeue {
        Self::push(&mut inner, lease.message);
        drop(inner);
        self.notify.notify_waiters();
      }
    }
    Ok(())
  }

  async fn retry_later(&self, message: &TaskMessage, delay: Duration) -> Result<()> {
    self.check_online()?;
    let mut next = message.clone();
    next.not_before = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
    let mut inner = self.inner.lock().await;
    inner.leases.remove(&next.message_id);
    Self::push(&mut inner, next);
    Ok(())
  }

  async fn renew_lease(&self, message_id: Uuid, lease: Duration) -> Result<()> {
    self.check_online()?;
    match self.inner.lock().await.leases.get_mut(&message_id) {
      Some(held) => {
        held.expires_at = Instant::now() + lease;
        Ok(())
      }
      None => Err(DispatchError::Broker(format!("lease on {message_id} was lost"))),
    }
  }

  async fn queue_depth(&self, queue: &str) -> Result<QueueDepth> {
    self.check_online()?;
    let mut inner = self.inner.lock().await;
    inner.settle();
    let (ready, delayed) = inner
      .queues
      .get(queue)
      .map(|q| (q.ready.len() as u64, q.delayed.len() as u64))
      .unwrap_or_default();
    let leased = inner.leases.values().filter(|l| l.message.queue == queue).count() as u64;
    Ok(QueueDepth { ready, delayed, leased })
  }

  async fn purge(&self, queue: &str) -> Result<u64> {
    self.check_online()?;
    let mut inner = self.inner.lock().await;
    let Some(state) = inner.queues.get_mut(queue) else {
      return Ok(0);
    };
    let purged = (state.ready.len() + state.delayed.len()) as u64;
    state.ready.clear();
    state.delayed.clear();
    Ok(purged)
  }

  async fn remove_pending(&self, message_id: Uuid) -> Result<Removal> {
    self.check_online()?;
    let mut inner = self.inner.lock().await;
    for state in inner.queues.values_mut() {
      if let Some(pos) = state.ready.iter().position(|m| m.message_id == message_id) {
        return Ok(state.ready.remove(pos).map_or(Removal::Missing, Removal::Removed));
      }
      if let Some(pos) = state.delayed.iter().position(|m| m.message_id == message_id) {
        return Ok(Removal::Removed(state.delayed.remove(pos)));
      }
    }
    if inner.leases.contains_key(&message_id) {
      return Ok(Removal::Leased);
    }
    Ok(Removal::Missing)
  }

  async fn ping(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}
