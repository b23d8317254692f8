//! Dead-letter store
//!
//! Messages that can never succeed are copied here, with the reason, before
//! they are acked off the live queue. Nothing is dropped silently.

use crate::error::QueueError;
use crate::message::RawMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

// Type alias for Redis stream entries with binary field values
type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;

/// Why a message was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Payload failed validation
    Invalid(String),
    /// Store rejected the job for a non-transient reason
    Fatal(String),
    /// Receive count went past the configured limit
    Exhausted { receive_count: u32 },
}

impl DeadLetterReason {
    /// Short machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterReason::Invalid(_) => "invalid",
            DeadLetterReason::Fatal(_) => "fatal",
            DeadLetterReason::Exhausted { .. } => "exhausted",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::Invalid(reason) => write!(f, "invalid payload: {}", reason),
            DeadLetterReason::Fatal(reason) => write!(f, "store rejected job: {}", reason),
            DeadLetterReason::Exhausted { receive_count } => {
                write!(f, "gave up after {} deliveries", receive_count)
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably record `message` with `reason`. Must succeed before the
    /// message is acked off the live queue.
    async fn dead_letter(
        &self,
        message: &RawMessage,
        reason: &DeadLetterReason,
    ) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: DeadLetterSink + ?Sized> DeadLetterSink for Arc<T> {
    async fn dead_letter(
        &self,
        message: &RawMessage,
        reason: &DeadLetterReason,
    ) -> Result<(), QueueError> {
        (**self).dead_letter(message, reason).await
    }
}

/// Metadata stored alongside each dead-lettered payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry id in the dead-letter stream
    #[serde(default, skip_serializing)]
    pub dlq_id: String,
    /// Id the message had on the live queue
    pub message_id: String,
    /// `invalid`, `fatal` or `exhausted`
    pub kind: String,
    pub reason: String,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    /// Payload as text; the exact bytes are kept in the `payload` field
    pub payload_preview: String,
}

/// DLQ statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub stream_name: String,
    pub length: i64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

/// Redis stream backed dead-letter store
pub struct RedisDeadLetters {
    redis: Arc<ConnectionManager>,
    dlq_stream: String,
    max_length: Option<i64>,
}

impl RedisDeadLetters {
    pub fn new(redis: Arc<ConnectionManager>, dlq_stream: impl Into<String>) -> Self {
        Self {
            redis,
            dlq_stream: dlq_stream.into(),
            max_length: None,
        }
    }

    /// Cap the DLQ length; oldest entries are trimmed first
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }

    /// Get DLQ statistics
    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        let mut conn = (*self.redis).clone();

        let length: i64 = conn.xlen(&self.dlq_stream).await?;

        let oldest: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let newest: StreamEntries = redis::cmd("XREVRANGE")
            .arg(&self.dlq_stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(DlqStats {
            stream_name: self.dlq_stream.clone(),
            length,
            oldest_entry_id: oldest.into_iter().next().map(|(id, _)| id),
            newest_entry_id: newest.into_iter().next().map(|(id, _)| id),
        })
    }

    /// List entries, oldest first, starting at `offset` (inclusive)
    pub async fn list(
        &self,
        count: usize,
        offset: Option<&str>,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = (*self.redis).clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg(offset.unwrap_or("-"))
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut results = Vec::with_capacity(entries.len());
        for (dlq_id, fields) in entries {
            if let Some(data) = field(&fields, "data")
                && let Ok(mut entry) = serde_json::from_slice::<DeadLetterEntry>(data)
            {
                entry.dlq_id = dlq_id;
                results.push(entry);
            }
        }

        Ok(results)
    }

    /// Put a dead-lettered payload back on `live_stream` and remove it here.
    ///
    /// The replayed message starts over with a receive count of 1. Returns
    /// false if `dlq_id` does not exist.
    pub async fn replay(&self, dlq_id: &str, live_stream: &str) -> Result<bool, QueueError> {
        let mut conn = (*self.redis).clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg(dlq_id)
            .arg(dlq_id)
            .query_async(&mut conn)
            .await?;

        let Some((_, fields)) = entries.first() else {
            return Ok(false);
        };
        let payload = field(fields, "payload")
            .ok_or_else(|| QueueError::Encoding(format!("DLQ entry {} has no payload", dlq_id)))?;
        let enqueued_at = field(fields, "data")
            .and_then(|data| serde_json::from_slice::<DeadLetterEntry>(data).ok())
            .map(|entry| entry.enqueued_at.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(live_stream)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("enqueued_at")
            .arg(enqueued_at)
            .arg("attempts")
            .arg(0)
            .ignore()
            .cmd("XDEL")
            .arg(&self.dlq_stream)
            .arg(dlq_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(dlq_id = %dlq_id, stream = %live_stream, "Replayed dead-lettered message");
        Ok(true)
    }

    /// Purge all entries from the DLQ
    pub async fn purge(&self) -> Result<i64, QueueError> {
        let mut conn = (*self.redis).clone();

        let len: i64 = conn.xlen(&self.dlq_stream).await?;
        if len > 0 {
            let _: i64 = redis::cmd("XTRIM")
                .arg(&self.dlq_stream)
                .arg("MAXLEN")
                .arg(0)
                .query_async(&mut conn)
                .await?;
        }

        info!(stream = %self.dlq_stream, purged = len, "Purged DLQ");
        Ok(len)
    }
}

fn field<'a>(fields: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_slice())
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetters {
    async fn dead_letter(
        &self,
        message: &RawMessage,
        reason: &DeadLetterReason,
    ) -> Result<(), QueueError> {
        let entry = DeadLetterEntry {
            dlq_id: String::new(),
            message_id: message.handle.id().to_string(),
            kind: reason.kind().to_string(),
            reason: reason.to_string(),
            receive_count: message.receive_count,
            enqueued_at: message.enqueued_at,
            failed_at: Utc::now(),
            payload_preview: message.payload_lossy(),
        };
        let data = serde_json::to_string(&entry)?;
        let mut conn = (*self.redis).clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.dlq_stream);
        if let Some(max_length) = self.max_length {
            cmd.arg("MAXLEN").arg("~").arg(max_length);
        }
        cmd.arg("*")
            .arg("payload")
            .arg(message.payload.as_slice())
            .arg("data")
            .arg(&data);

        let dlq_id: String = cmd.query_async(&mut conn).await?;

        debug!(dlq_id = %dlq_id, message_id = %message.handle, kind = reason.kind(), "Wrote DLQ entry");
        Ok(())
    }
}
