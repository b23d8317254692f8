//! Job producer
//!
//! Enqueues payloads onto the live stream in the layout `RedisQueue` reads.
//!
//! ```rust,ignore
//! let producer = JobProducer::new(redis, "jobs:queue");
//! let message_id = producer
//!     .enqueue_json(&serde_json::json!({ "id": "order-42", "data": { "total": 10 } }))
//!     .await?;
//! ```

use crate::error::QueueError;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub struct JobProducer {
    redis: Arc<ConnectionManager>,
    stream_name: String,
}

impl JobProducer {
    pub fn new(redis: Arc<ConnectionManager>, stream_name: impl Into<String>) -> Self {
        Self {
            redis,
            stream_name: stream_name.into(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Enqueue raw payload bytes. Returns the stream entry id.
    pub async fn enqueue(&self, payload: impl AsRef<[u8]>) -> Result<String, QueueError> {
        let mut conn = (*self.redis).clone();

        let message_id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("*")
            .arg("payload")
            .arg(payload.as_ref())
            .arg("enqueued_at")
            .arg(Utc::now().timestamp_millis())
            .arg("attempts")
            .arg(0)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %self.stream_name, message_id = %message_id, "Enqueued job");
        Ok(message_id)
    }

    /// Serialize `value` as JSON and enqueue it
    pub async fn enqueue_json<T: Serialize + Sync>(&self, value: &T) -> Result<String, QueueError> {
        let payload = serde_json::to_vec(value)?;
        self.enqueue(payload).await
    }
}
