//! Message and job records
//!
//! `RawMessage` is what the queue hands out; `Job` is what the sink stores.

use chrono::{DateTime, Utc};
use std::fmt;

/// Opaque token identifying one delivery of a message.
///
/// Only the queue that issued a handle knows how to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    id: String,
    receive_count: u32,
}

impl DeliveryHandle {
    pub(crate) fn new(id: impl Into<String>, receive_count: u32) -> Self {
        Self {
            id: id.into(),
            receive_count,
        }
    }

    /// Queue-assigned entry id (e.g. a Redis stream id "1712345678901-0")
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn receive_count(&self) -> u32 {
        self.receive_count
    }
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A message as delivered by the queue
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Payload bytes exactly as enqueued
    pub payload: Vec<u8>,

    /// Handle for ack/nack of this delivery
    pub handle: DeliveryHandle,

    /// Number of times this message has been delivered (>= 1)
    pub receive_count: u32,

    /// When the message was first enqueued (preserved across redelivery)
    pub enqueued_at: DateTime<Utc>,
}

impl RawMessage {
    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }

    /// Payload as text for logs and dead-letter entries
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Parse the millisecond timestamp prefix of a Redis stream id.
///
/// Stream IDs are in format "timestamp_ms-sequence".
pub(crate) fn stream_id_timestamp(stream_id: &str) -> Option<DateTime<Utc>> {
    stream_id
        .split('-')
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

/// Structured job decoded from a message. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: String,
    payload: serde_json::Value,
    received_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            received_at,
        }
    }

    /// Identifier the sink deduplicates on; stable across redeliveries
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Outcome of decoding a message
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Well-formed payload
    Success(Job),
    /// Malformed payload - never retried
    Invalid(String),
    /// Could not decode right now - retried
    TransientError(String),
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessResult::Success(_))
    }
}
