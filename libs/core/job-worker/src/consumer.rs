//! Redis Streams queue client
//!
//! Layout for a live stream `S`:
//!
//! - `S`: consumer-group stream; entries carry `payload`, `enqueued_at` (ms)
//!   and `attempts` (deliveries before the entry was last re-added)
//! - `S:delayed`: sorted set of nacked entry ids scored by visible-at ms
//! - `S:delayed:data`: hash holding `<id>:payload`, `<id>:enqueued_at` and
//!   `<id>:attempts` for each delayed entry
//!
//! Acked entries are deleted from the stream, so the stream only holds live
//! work. Entries left pending longer than the visibility timeout are
//! reclaimed with `XAUTOCLAIM` and redelivered.
//!
//! A delivery handle stays valid only while its entry is pending for this
//! consumer with the same delivery count. Once another consumer (or this one)
//! reclaims the entry, ack and nack on the old handle are no-ops.

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::message::{DeliveryHandle, RawMessage, stream_id_timestamp};
use crate::queue::{JobQueue, PollPacer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, RedisResult, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delayed entries moved back onto the stream per dequeue
const PROMOTE_BATCH: usize = 100;

/// Headroom on top of the longest blocking read before a reply is abandoned
const RESPONSE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

// KEYS: delayed zset, delayed hash, stream. ARGV: now ms, batch size.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(due) do
  local payload = redis.call('HGET', KEYS[2], id .. ':payload')
  if payload then
    local enqueued = redis.call('HGET', KEYS[2], id .. ':enqueued_at') or '0'
    local attempts = redis.call('HGET', KEYS[2], id .. ':attempts') or '0'
    redis.call('XADD', KEYS[3], '*', 'payload', payload, 'enqueued_at', enqueued, 'attempts', attempts)
  end
  redis.call('HDEL', KEYS[2], id .. ':payload', id .. ':enqueued_at', id .. ':attempts')
  redis.call('ZREM', KEYS[1], id)
end
return #due
"#;

// KEYS: stream. ARGV: group, consumer, min idle ms.
// Returns nil or {id, payload, enqueued_at, attempts, deliveries}.
const RECLAIM_SCRIPT: &str = r#"
local claimed = redis.call('XAUTOCLAIM', KEYS[1], ARGV[1], ARGV[2], ARGV[3], '0-0', 'COUNT', 1)
for _, entry in ipairs(claimed[2]) do
  local id = entry[1]
  local fields = entry[2]
  if type(fields) == 'table' then
    local payload, enqueued, attempts = '', '0', '0'
    for i = 1, #fields, 2 do
      if fields[i] == 'payload' then payload = fields[i + 1]
      elseif fields[i] == 'enqueued_at' then enqueued = fields[i + 1]
      elseif fields[i] == 'attempts' then attempts = fields[i + 1] end
    end
    local deliveries = 1
    local pending = redis.call('XPENDING', KEYS[1], ARGV[1], id, id, 1)
    if pending[1] then deliveries = pending[1][4] end
    return {id, payload, enqueued, attempts, deliveries}
  end
end
return nil
"#;

// KEYS: stream. ARGV: group, id, consumer, receive count.
// Returns 1 when the delivery was acked, 0 for a stale handle.
const ACK_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)[1]
if not pending or pending[2] ~= ARGV[3] then
  return 0
end
local attempts = 0
local entry = redis.call('XRANGE', KEYS[1], ARGV[2], ARGV[2])[1]
if entry then
  local fields = entry[2]
  for i = 1, #fields, 2 do
    if fields[i] == 'attempts' then attempts = tonumber(fields[i + 1]) or 0 end
  end
end
if tonumber(pending[4]) + attempts ~= tonumber(ARGV[4]) then
  return 0
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

// KEYS: stream, delayed zset, delayed hash. ARGV: group, id, visible-at ms,
// receive count, consumer.
// Returns 1 when the entry was moved to the delayed set, 0 for a stale handle.
const NACK_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)[1]
local entry = redis.call('XRANGE', KEYS[1], ARGV[2], ARGV[2])[1]
if not pending or not entry or pending[2] ~= ARGV[5] then
  return 0
end
local fields = entry[2]
local payload, enqueued, attempts = '', '0', 0
for i = 1, #fields, 2 do
  if fields[i] == 'payload' then payload = fields[i + 1]
  elseif fields[i] == 'enqueued_at' then enqueued = fields[i + 1]
  elseif fields[i] == 'attempts' then attempts = tonumber(fields[i + 1]) or 0 end
end
if tonumber(pending[4]) + attempts ~= tonumber(ARGV[4]) then
  return 0
end
if enqueued == '0' then enqueued = string.match(ARGV[2], '^(%d+)') or '0' end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2] .. ':payload', payload, ARGV[2] .. ':enqueued_at', enqueued, ARGV[2] .. ':attempts', ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

// Type alias for XREADGROUP replies
type StreamReply = Vec<(String, Vec<(String, Vec<(String, Vec<u8>)>)>)>;

type ReclaimedEntry = (String, Vec<u8>, String, String, u32);

/// Response timeout for a connection that issues reads blocking up to `max_block`
pub fn response_timeout_for(max_block: Duration) -> Duration {
    max_block.saturating_add(RESPONSE_TIMEOUT_MARGIN)
}

/// Open a managed Redis connection and verify it with PING.
///
/// `max_block` is the longest `BLOCK` any read on this connection will use;
/// the response timeout is raised above it so an empty poll is not reported
/// as a timeout.
pub async fn connect_redis(url: &str, max_block: Duration) -> RedisResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let config = ConnectionManagerConfig::new()
        .set_response_timeout(Some(response_timeout_for(max_block)));
    let mut manager = ConnectionManager::new_with_config(client, config).await?;

    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Snapshot of queue depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Entries on the live stream (ready plus in flight)
    pub length: u64,
    /// Entries delivered and not yet acked
    pub pending: u64,
    /// Nacked entries waiting out their delay
    pub delayed: u64,
}

/// Redis Streams implementation of [`JobQueue`]
pub struct RedisQueue {
    redis: Arc<ConnectionManager>,
    config: WorkerConfig,
    delayed_key: String,
    delayed_data_key: String,
    pacer: PollPacer,
    promote: Script,
    reclaim: Script,
    ack: Script,
    nack: Script,
}

impl RedisQueue {
    /// Create a queue client over an existing connection
    pub fn new(redis: Arc<ConnectionManager>, config: WorkerConfig) -> Self {
        let delayed_key = format!("{}:delayed", config.stream_name);
        let delayed_data_key = format!("{}:delayed:data", config.stream_name);
        let pacer = PollPacer::new(config.min_poll_interval);

        Self {
            redis,
            config,
            delayed_key,
            delayed_data_key,
            pacer,
            promote: Script::new(PROMOTE_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            nack: Script::new(NACK_SCRIPT),
        }
    }

    /// Connect to Redis and make sure the consumer group exists
    pub async fn connect(url: &str, config: WorkerConfig) -> Result<Self, QueueError> {
        let manager = connect_redis(url, config.dequeue_timeout).await?;
        let queue = Self::new(Arc::new(manager), config);
        queue.init_consumer_group().await?;
        Ok(queue)
    }

    /// Shared connection, for building producers and dead-letter stores
    pub fn redis(&self) -> Arc<ConnectionManager> {
        self.redis.clone()
    }

    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.config.consumer_group
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    /// Initialize the consumer group if it doesn't exist
    pub async fn init_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = (*self.redis).clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Consumer group already exists"
                );
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Queue depth across the live stream and the delayed set
    pub async fn info(&self) -> Result<QueueInfo, QueueError> {
        let mut conn = (*self.redis).clone();

        let length: u64 = conn.xlen(&self.config.stream_name).await?;
        let delayed: u64 = conn.zcard(&self.delayed_key).await?;
        let summary: (u64, Option<String>, Option<String>, redis::Value) = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;

        Ok(QueueInfo {
            length,
            pending: summary.0,
            delayed,
        })
    }

    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let promoted: usize = self
            .promote
            .key(&self.delayed_key)
            .key(&self.delayed_data_key)
            .key(&self.config.stream_name)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;

        if promoted > 0 {
            debug!(count = promoted, stream = %self.config.stream_name, "Promoted delayed messages");
        }
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Option<RawMessage>, QueueError> {
        let claimed: Option<ReclaimedEntry> = self
            .reclaim
            .key(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(self.config.visibility_timeout.as_millis() as u64)
            .invoke_async(conn)
            .await?;

        let Some((id, payload, enqueued_at, attempts, deliveries)) = claimed else {
            return Ok(None);
        };

        let prior: u32 = attempts.parse().unwrap_or(0);
        let receive_count = prior.saturating_add(deliveries.max(1));
        debug!(message_id = %id, receive_count, "Reclaimed message past its visibility timeout");

        Ok(Some(build_message(id, payload, &enqueued_at, receive_count)))
    }

    async fn read_new(
        &self,
        conn: &mut ConnectionManager,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, QueueError> {
        let block_ms = (timeout.as_millis() as u64).max(1);

        let reply: Option<StreamReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(conn)
            .await?;

        let entry = reply
            .into_iter()
            .flatten()
            .flat_map(|(_stream, entries)| entries)
            .next();

        let Some((id, fields)) = entry else {
            return Ok(None);
        };

        let mut payload = Vec::new();
        let mut enqueued_at = String::new();
        let mut attempts = 0u32;
        for (name, value) in fields {
            match name.as_str() {
                "payload" => payload = value,
                "enqueued_at" => enqueued_at = String::from_utf8_lossy(&value).into_owned(),
                "attempts" => {
                    attempts = String::from_utf8_lossy(&value).parse().unwrap_or(0);
                }
                _ => {}
            }
        }

        Ok(Some(build_message(
            id,
            payload,
            &enqueued_at,
            attempts.saturating_add(1),
        )))
    }
}

/// Stream or group was deleted (e.g. Redis restarted without persistence)
fn is_missing_group(message: &str) -> bool {
    message.contains("NOGROUP")
}

fn build_message(id: String, payload: Vec<u8>, enqueued_at: &str, receive_count: u32) -> RawMessage {
    let enqueued_at = enqueued_at
        .parse::<i64>()
        .ok()
        .filter(|ms| *ms > 0)
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| stream_id_timestamp(&id))
        .unwrap_or_else(Utc::now);

    RawMessage {
        payload,
        handle: DeliveryHandle::new(id, receive_count),
        receive_count,
        enqueued_at,
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<RawMessage>, QueueError> {
        let started = Instant::now();
        let mut conn = (*self.redis).clone();

        self.promote_due(&mut conn).await?;

        let polled = match self.reclaim_expired(&mut conn).await {
            Ok(Some(message)) => return Ok(Some(message)),
            Ok(None) => self.read_new(&mut conn, timeout).await,
            Err(e) => Err(e),
        };

        let message = match polled {
            Err(QueueError::Redis(e)) if is_missing_group(&e.to_string()) => {
                warn!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Consumer group missing, recreating it"
                );
                self.init_consumer_group().await?;
                None
            }
            result => result?,
        };

        if message.is_none() {
            self.pacer.pace_empty_poll(started).await;
        }
        Ok(message)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut conn = (*self.redis).clone();

        let acked: i64 = self
            .ack
            .key(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(handle.id())
            .arg(&self.config.consumer_id)
            .arg(handle.receive_count())
            .invoke_async(&mut conn)
            .await?;

        if acked == 0 {
            debug!(message_id = %handle, "Ignoring ack for a delivery that is no longer pending");
        } else {
            debug!(message_id = %handle, "Acknowledged message");
        }
        Ok(())
    }

    async fn nack(&self, handle: &DeliveryHandle, delay: Duration) -> Result<(), QueueError> {
        let mut conn = (*self.redis).clone();
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let moved: i64 = self
            .nack
            .key(&self.config.stream_name)
            .key(&self.delayed_key)
            .key(&self.delayed_data_key)
            .arg(&self.config.consumer_group)
            .arg(handle.id())
            .arg(visible_at)
            .arg(handle.receive_count())
            .arg(&self.config.consumer_id)
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            debug!(message_id = %handle, "Ignoring nack for a delivery that is no longer pending");
        } else {
            debug!(message_id = %handle, delay_ms = delay.as_millis() as u64, "Message returned to queue");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_message_prefers_enqueued_field() {
        let message = build_message("1700000000000-0".into(), b"{}".to_vec(), "1712345678901", 2);

        assert_eq!(message.enqueued_at.timestamp_millis(), 1_712_345_678_901);
        assert_eq!(message.receive_count, 2);
        assert_eq!(message.handle.id(), "1700000000000-0");
    }

    #[test]
    fn test_build_message_falls_back_to_stream_id() {
        let message = build_message("1700000000000-3".into(), Vec::new(), "", 1);
        assert_eq!(message.enqueued_at.timestamp_millis(), 1_700_000_000_000);

        let message = build_message("1700000000000-3".into(), Vec::new(), "0", 1);
        assert_eq!(message.enqueued_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_response_timeout_outlasts_blocking_read() {
        let config = WorkerConfig::default();
        assert!(response_timeout_for(config.dequeue_timeout) > config.dequeue_timeout);
        assert_eq!(
            response_timeout_for(Duration::from_secs(1)),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn test_missing_group_detection() {
        assert!(is_missing_group(
            "NOGROUP: No such key 'jobs:queue' or consumer group 'jobs_workers' in XREADGROUP with GROUP option"
        ));
        assert!(is_missing_group(
            "An error was signalled by the server - ResponseError: NOGROUP No such key or consumer group"
        ));
        assert!(!is_missing_group("BUSYGROUP Consumer Group name already exists"));
    }
}
