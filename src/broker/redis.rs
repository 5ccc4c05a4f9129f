//! Redis-backed broker.
//!
//! # Key layout
//!
//! Under `<prefix>:q:<queue>`:
//!
//! - `:ready`    list, LPUSH on enqueue, RPOP on dequeue (FIFO)
//! - `:delayed`  sorted set of retried messages scored by their visibility time (ms)
//! - `:inflight` hash message id → message body, for leased messages
//! - `:leases`   sorted set message id → lease expiry (ms)
//!
//! plus `<prefix>:index`, message id → queue, so ack/nack/cancel work from an id alone.
//! Every state change that touches more than one key runs as a single script.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, RedisResult, Script};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{with_retry, BrokerAdapter, Removal};
use crate::error::{DispatchError, Result};
use crate::models::{QueueDepth, TaskMessage};

const IDLE_RECHECK: Duration = Duration::from_millis(100);

const DEQUEUE_LUA: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[4], id)
  local raw = redis.call('HGET', KEYS[3], id)
  if raw then
    redis.call('HDEL', KEYS[3], id)
    redis.call('RPUSH', KEYS[1], raw)
  end
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, raw in ipairs(due) do
  redis.call('ZREM', KEYS[2], raw)
  redis.call('LPUSH', KEYS[1], raw)
end
local raw = redis.call('RPOP', KEYS[1])
if not raw then
  return false
end
local id = cjson.decode(raw)['message_id']
redis.call('HSET', KEYS[3], id, raw)
redis.call('ZADD', KEYS[4], ARGV[2], id)
return raw
"#;

const NACK_LUA: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[2] == '1' then
  redis.call('LPUSH', KEYS[3], raw)
else
  redis.call('HDEL', KEYS[4], ARGV[1])
end
return 1
"#;

const RENEW_LUA: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

const PURGE_LUA: &str = r#"
local n = 0
for _, raw in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  redis.call('HDEL', KEYS[3], cjson.decode(raw)['message_id'])
  n = n + 1
end
for _, raw in ipairs(redis.call('ZRANGE', KEYS[2], 0, -1)) do
  redis.call('HDEL', KEYS[3], cjson.decode(raw)['message_id'])
  n = n + 1
end
redis.call('DEL', KEYS[1], KEYS[2])
return n
"#;

const CANCEL_LUA: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1 then
  return {2, ''}
end
for _, raw in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  if cjson.decode(raw)['message_id'] == ARGV[1] then
    redis.call('LREM', KEYS[1], 1, raw)
    redis.call('HDEL', KEYS[4], ARGV[1])
    return {1, raw}
  end
end
for _, raw in ipairs(redis.call('ZRANGE', KEYS[2], 0, -1)) do
  if cjson.decode(raw)['message_id'] == ARGV[1] then
    redis.call('ZREM', KEYS[2], raw)
    redis.call('HDEL', KEYS[4], ARGV[1])
    return {1, raw}
  end
end
return {0, ''}
"#;

struct QueueKeys {
  ready: String,
  delayed: String,
  inflight: String,
  leases: String,
}

fn is_transient(e: &RedisError) -> bool {
  e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn map_err(e: RedisError) -> DispatchError {
  if is_transient(&e) {
    DispatchError::BrokerUnavailable(e.to_string())
  } else {
    DispatchError::Broker(e.to_string())
  }
}

fn millis_from_now(d: Duration) -> i64 {
  Utc::now().timestamp_millis() + d.as_millis().min(i64::MAX as u128 / 2) as i64
}

pub struct RedisBroker {
  conn: ConnectionManager,
  prefix: String,
  dequeue_script: Script,
  nack_script: Script,
  renew_script: Script,
  purge_script: Script,
  cancel_script: Script,
}

impl RedisBroker {
  pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
    let client = ::redis::Client::open(redis_url).map_err(|e| DispatchError::Config(e.to_string()))?;
    let conn = with_retry(|| ConnectionManager::new(client.clone()), is_transient)
      .await
      .map_err(map_err)?;
    info!(prefix = %prefix, "Redis broker connected");
    Ok(Self {
      conn,
      prefix: prefix.to_string(),
      dequeue_script: Script::new(DEQUEUE_LUA),
      nack_script: Script::new(NACK_LUA),
      renew_script: Script::new(RENEW_LUA),
      purge_script: Script::new(PURGE_LUA),
      cancel_script: Script::new(CANCEL_LUA),
    })
  }

  fn keys(&self, queue: &str) -> QueueKeys {
    let base = format!("{}:q:{}", self.prefix, queue);
    QueueKeys {
      ready: format!("{base}:ready"),
      delayed: format!("{base}:delayed"),
      inflight: format!("{base}:inflight"),
      leases: format!("{base}:leases"),
    }
  }

  fn index_key(&self) -> String {
    format!("{}:index", self.prefix)
  }

  async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
  where
    F: FnMut(ConnectionManager) -> Fut,
    Fut: Future<Output = RedisResult<T>>,
  {
    with_retry(|| op(self.conn.clone()), is_transient).await.map_err(map_err)
  }

  async fn queue_of(&self, message_id: Uuid) -> Result<Option<String>> {
    let index = self.index_key();
    let id = message_id.to_string();
    self
      .run(|mut conn| {
        let (index, id) = (index.clone(), id.clone());
        async move { conn.hget::<_, _, Option<String>>(index, id).await }
      })
      .await
  }
}

#[async_trait]
impl BrokerAdapter for RedisBroker {
  fn kind(&self) -> &'static str {
    "redis"
  }

  async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<Uuid> {
    let mut message = message.clone();
    message.queue = queue.to_string();
    let raw = serde_json::to_string(&message)?;
    let keys = self.keys(queue);
    let index = self.index_key();
    let id = message.message_id.to_string();
    let visible_at = message.not_before.filter(|at| *at > Utc::now()).map(|at| at.timestamp_millis());

    self
      .run(|mut conn| {
        let mut pipe = ::redis::pipe();
        pipe.atomic().hset(&index, &id, queue).ignore();
        match visible_at {
          Some(score) => pipe.zadd(&keys.delayed, &raw, score).ignore(),
          None => pipe.lpush(&keys.ready, &raw).ignore(),
        };
        async move { pipe.query_async::<_, ()>(&mut conn).await }
      })
      .await?;
    Ok(message.message_id)
  }

  async fn dequeue(&self, queue: &str, lease: Duration, timeout: Duration) -> Result<Option<TaskMessage>> {
    let keys = self.keys(queue);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let raw: Option<String> = self
        .run(|mut conn| {
          let mut invocation = self.dequeue_script.prepare_invoke();
          invocation
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.inflight)
            .key(&keys.leases)
            .arg(Utc::now().timestamp_millis())
            .arg(millis_from_now(lease));
          async move { invocation.invoke_async(&mut conn).await }
        })
        .await?;

      if let Some(raw) = raw {
        return Ok(Some(serde_json::from_str(&raw)?));
      }
      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      tokio::time::sleep((deadline - now).min(IDLE_RECHECK)).await;
    }
  }

  async fn ack(&self, message_id: Uuid) -> Result<()> {
    let Some(queue) = self.queue_of(message_id).await? else {
      debug!(%message_id, "Ack for unknown message ignored");
      return Ok(());
    };
    let keys = self.keys(&queue);
    let index = self.index_key();
    let id = message_id.to_string();
    self
      .run(|mut conn| {
        let mut pipe = ::redis::pipe();
        pipe
          .atomic()
          .hdel(&keys.inflight, &id)
          .ignore()
          .zrem(&keys.leases, &id)
          .ignore()
          .hdel(&index, &id)
          .ignore();
        async move { pipe.query_async::<_, ()>(&mut conn).await }
      })
      .await
  }

  async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<()> {
    let Some(queue) = self.queue_of(message_id).await? else {
      return Ok(());
    };
    let keys = self.keys(&queue);
    let index = self.index_key();
    let id = message_id.to_string();
    let _: i64 = self
      .run(|mut conn| {
        let mut invocation = self.nack_script.prepare_invoke();
        invocation
          .key(&keys.inflight)
          .key(&keys.leases)
          .key(&keys.ready)
          .key(&index)
          .arg(&id)
          .arg(if requeue { "1" } else { "0" });
        async move { invocation.invoke_async(&mut conn).await }
      })
      .await?;
    Ok(())
  }

  async fn retry_later(&self, message: &TaskMessage, delay: Duration) -> Result<()> {
    let mut next = message.clone();
    let visible_at = millis_from_now(delay);
    next.not_before = chrono::DateTime::<Utc>::from_timestamp_millis(visible_at);
    let raw = serde_json::to_string(&next)?;
    let keys = self.keys(&next.queue);
    let index = self.index_key();
    let id = next.message_id.to_string();
    let queue = next.queue.clone();
    self
      .run(|mut conn| {
        let mut pipe = ::redis::pipe();
        pipe
          .atomic()
          .hdel(&keys.inflight, &id)
          .ignore()
          .zrem(&keys.leases, &id)
          .ignore()
          .zadd(&keys.delayed, &raw, visible_at)
          .ignore()
          .hset(&index, &id, &queue)
          .ignore();
        async move { pipe.query_async::<_, ()>(&mut conn).await }
      })
      .await
  }

  async fn renew_lease(&self, message_id: Uuid, lease: Duration) -> Result<()> {
    let Some(queue) = self.queue_of(message_id).await? else {
      return Err(DispatchError::Broker(format!("lease on {message_id} was lost")));
    };
    let keys = self.keys(&queue);
    let id = message_id.to_string();
    let renewed: i64 = self
      .run(|mut conn| {
        let mut invocation = self.renew_script.prepare_invoke();
        invocation.key(&keys.leases).arg(&id).arg(millis_from_now(lease));
        async move { invocation.invoke_async(&mut conn).await }
      })
      .await?;
    if renewed == 1 {
      Ok(())
    } else {
      Err(DispatchError::Broker(format!("lease on {message_id} was lost")))
    }
  }

  async fn queue_depth(&self, queue: &str) -> Result<QueueDepth> {
    let keys = self.keys(queue);
    let (ready, delayed, leased): (u64, u64, u64) = self
      .run(|mut conn| {
        let mut pipe = ::redis::pipe();
        pipe.llen(&keys.ready).zcard(&keys.delayed).hlen(&keys.inflight);
        async move { pipe.query_async(&mut conn).await }
      })
      .await?;
    Ok(QueueDepth { ready, delayed, leased })
  }

  async fn purge(&self, queue: &str) -> Result<u64> {
    let keys = self.keys(queue);
    let index = self.index_key();
    self
      .run(|mut conn| {
        let mut invocation = self.purge_script.prepare_invoke();
        invocation.key(&keys.ready).key(&keys.delayed).key(&index);
        async move { invocation.invoke_async(&mut conn).await }
      })
      .await
  }

  async fn remove_pending(&self, message_id: Uuid) -> Result<Removal> {
    let Some(queue) = self.queue_of(message_id).await? else {
      return Ok(Removal::Missing);
    };
    let keys = self.keys(&queue);
    let index = self.index_key();
    let id = message_id.to_string();
    let (code, raw): (i64, String) = self
      .run(|mut conn| {
        let mut invocation = self.cancel_script.prepare_invoke();
        invocation
          .key(&keys.ready)
          .key(&keys.delayed)
          .key(&keys.inflight)
          .key(&index)
          .arg(&id);
        async move { invocation.invoke_async(&mut conn).await }
      })
      .await?;
    Ok(match code {
      1 => Removal::Removed(TaskMessage::from_bytes(raw.as_bytes())?),
      2 => Removal::Leased,
      _ => Removal::Missing,
    })
  }

  async fn ping(&self) -> bool {
    let mut conn = self.conn.clone();
    ::redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
  }
}
