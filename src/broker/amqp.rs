//! RabbitMQ-backed broker.
//!
//! Each logical queue is a durable AMQP queue named `<prefix>.<queue>` on the default exchange.
//! A lease is an un-acked `basic.get` delivery and lasts until ack/nack or channel loss.
//! Retried messages carry `not_before`; one that is dequeued too early is re-published to the
//! back of its queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lapin::acker::Acker;
use lapin::options::{
  BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use super::{with_retry, BrokerAdapter, Removal};
use crate::error::{DispatchError, Result};
use crate::models::{QueueDepth, TaskMessage};
use crate::registry::QueueRegistry;

const IDLE_RECHECK: Duration = Duration::from_millis(100);

struct Held {
  queue: String,
  acker: Acker,
}

fn unavailable(e: lapin::Error) -> DispatchError {
  DispatchError::BrokerUnavailable(e.to_string())
}

pub struct AmqpBroker {
  connection: Connection,
  channel: Channel,
  prefix: String,
  inflight: Mutex<HashMap<Uuid, Held>>,
}

impl AmqpBroker {
  pub async fn connect(amqp_url: &str, prefix: &str, queues: &QueueRegistry) -> Result<Self> {
    let connection = with_retry(
      || Connection::connect(amqp_url, ConnectionProperties::default()),
      |_: &lapin::Error| true,
    )
    .await
    .map_err(unavailable)?;
    let channel = connection.create_channel().await.map_err(unavailable)?;

    let broker = Self {
      connection,
      channel,
      prefix: prefix.to_string(),
      inflight: Mutex::new(HashMap::new()),
    };
    for policy in queues.iter() {
      broker
        .channel
        .queue_declare(
          &broker.amqp_queue(&policy.name),
          QueueDeclareOptions { durable: true, ..Default::default() },
          FieldTable::default(),
        )
        .await
        .map_err(unavailable)?;
    }
    info!(queues = queues.len(), "RabbitMQ channel created");
    Ok(broker)
  }

  fn amqp_queue(&self, queue: &str) -> String {
    format!("{}.{}", self.prefix, queue)
  }

  async fn publish(&self, queue: &str, message: &TaskMessage) -> Result<()> {
    let name = self.amqp_queue(queue);
    let payload = message.to_bytes()?;
    let properties = BasicProperties::default()
      .with_message_id(ShortString::from(message.message_id.to_string()))
      .with_delivery_mode(2);
    with_retry(
      || async {
        self
          .channel
          .basic_publish("", &name, BasicPublishOptions::default(), &payload, properties.clone())
          .await?
          .await
      },
      |_: &lapin::Error| true,
    )
    .await
    .map_err(unavailable)?;
    Ok(())
  }

  async fn take(&self, message_id: Uuid) -> Option<Held> {
    self.inflight.lock().await.remove(&message_id)
  }
}

#[async_trait]
impl BrokerAdapter for AmqpBroker {
  fn kind(&self) -> &'static str {
    "amqp"
  }

  async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<Uuid> {
    let mut message = message.clone();
    message.queue = queue.to_string();
    self.publish(queue, &message).await?;
    Ok(message.message_id)
  }

  async fn dequeue(&self, queue: &str, _lease: Duration, timeout: Duration) -> Result<Option<TaskMessage>> {
    let name = self.amqp_queue(queue);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let got = with_retry(
        || self.channel.basic_get(&name, BasicGetOptions { no_ack: false }),
        |_: &lapin::Error| true,
      )
      .await
      .map_err(unavailable)?;

      if let Some(got) = got {
        let delivery = got.delivery;
        match TaskMessage::from_bytes(&delivery.data) {
          Ok(message) if message.is_ready(Utc::now()) => {
            self.inflight.lock().await.insert(
              message.message_id,
              Held {
                queue: queue.to_string(),
                acker: delivery.acker,
              },
            );
            return Ok(Some(message));
          }
          Ok(message) => {
            self.publish(queue, &message).await?;
            delivery.acker.ack(BasicAckOptions::default()).await.map_err(unavailable)?;
          }
          Err(e) => {
            error!(queue = %queue, error = %e, "Dropping undecodable message");
            delivery.acker.ack(BasicAckOptions::default()).await.map_err(unavailable)?;
            continue;
          }
        }
      }

      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      tokio::time::sleep((deadline - now).min(IDLE_RECHECK)).await;
    }
  }

  async fn ack(&self, message_id: Uuid) -> Result<()> {
    if let Some(held) = self.take(message_id).await {
      held.acker.ack(BasicAckOptions::default()).await.map_err(unavailable)?;
    }
    Ok(())
  }

  async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<()> {
    if let Some(held) = self.take(message_id).await {
      held
        .acker
        .nack(BasicNackOptions { requeue, multiple: false })
        .await
        .map_err(unavailable)?;
    }
    Ok(())
  }

  async fn retry_later(&self, message: &TaskMessage, delay: Duration) -> Result<()> {
    let mut next = message.clone();
    next.not_before = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
    // Publish before acking: a crash in between duplicates the message, never loses it.
    self.publish(&next.queue, &next).await?;
    self.ack(next.message_id).await
  }

  async fn renew_lease(&self, message_id: Uuid, _lease: Duration) -> Result<()> {
    if self.inflight.lock().await.contains_key(&message_id) {
      Ok(())
    } else {
      Err(DispatchError::Broker(format!("lease on {message_id} was lost")))
    }
  }

  async fn queue_depth(&self, queue: &str) -> Result<QueueDepth> {
    let declared = self
      .channel
      .queue_declare(
        &self.amqp_queue(queue),
        QueueDeclareOptions { passive: true, ..Default::default() },
        FieldTable::default(),
      )
      .await
      .map_err(unavailable)?;
    let leased = self.inflight.lock().await.values().filter(|h| h.queue == queue).count() as u64;
    Ok(QueueDepth {
      ready: declared.message_count() as u64,
      delayed: 0,
      leased,
    })
  }

  async fn purge(&self, queue: &str) -> Result<u64> {
    let purged = self
      .channel
      .queue_purge(&self.amqp_queue(queue), QueuePurgeOptions::default())
      .await
      .map_err(unavailable)?;
    Ok(purged as u64)
  }

  async fn remove_pending(&self, message_id: Uuid) -> Result<Removal> {
    if self.inflight.lock().await.contains_key(&message_id) {
      Ok(Removal::Leased)
    } else {
      Ok(Removal::Unsupported("AMQP queues do not support removing a single pending message"))
    }
  }

  async fn ping(&self) -> bool {
    self.connection.status().connected() && self.channel.status().connected()
  }
}
