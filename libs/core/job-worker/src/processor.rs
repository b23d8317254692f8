//! Payload decoding and validation.
//!
//! Payloads are JSON objects:
//!
//! ```text
//! { "id": "optional-string", "version": 1, "data": <any non-null JSON> }
//! ```
//!
//! Without an `id`, the job id is the SHA-256 of the raw payload bytes, which
//! the queue redelivers unchanged. A `version` newer than this build supports
//! is retried instead of dead-lettered so a newer worker can pick it up.
//!
//! Decoding never does I/O; the same message always yields the same result.

use crate::message::{Job, ProcessResult, RawMessage};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Longest accepted explicit job id, in bytes.
pub const MAX_JOB_ID_LEN: usize = 255;

/// Default payload size limit (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct JobProcessor {
    max_payload_bytes: usize,
}

impl JobProcessor {
    /// Highest payload schema version this build understands.
    pub const SUPPORTED_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Set the payload size limit
    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Decode a raw message into a job, or classify why it can't be.
    pub fn parse(&self, message: &RawMessage) -> ProcessResult {
        let bytes = message.payload.as_slice();

        if bytes.is_empty() {
            return ProcessResult::Invalid("empty payload".to_string());
        }
        if bytes.len() > self.max_payload_bytes {
            return ProcessResult::Invalid(format!(
                "payload is {} bytes, limit is {}",
                bytes.len(),
                self.max_payload_bytes
            ));
        }

        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => return ProcessResult::Invalid(format!("malformed json: {}", e)),
        };
        if !value.is_object() {
            return ProcessResult::Invalid("payload must be a JSON object".to_string());
        }

        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => return ProcessResult::Invalid(format!("invalid envelope: {}", e)),
        };

        match envelope.version {
            Some(0) => return ProcessResult::Invalid("version must be >= 1".to_string()),
            Some(version) if version > Self::SUPPORTED_VERSION => {
                return ProcessResult::TransientError(format!(
                    "schema version {} not available (supported up to {})",
                    version,
                    Self::SUPPORTED_VERSION
                ));
            }
            _ => {}
        }

        let data = match envelope.data {
            Some(serde_json::Value::Null) | None => {
                return ProcessResult::Invalid("missing 'data' field".to_string());
            }
            Some(data) => data,
        };

        let id = match envelope.id {
            Some(id) if id.trim().is_empty() => {
                return ProcessResult::Invalid("'id' must not be empty".to_string());
            }
            Some(id) if id.len() > MAX_JOB_ID_LEN => {
                return ProcessResult::Invalid(format!(
                    "'id' is {} bytes, limit is {}",
                    id.len(),
                    MAX_JOB_ID_LEN
                ));
            }
            Some(id) => id,
            None => content_id(bytes),
        };

        ProcessResult::Success(Job::new(id, data, message.enqueued_at))
    }
}

impl Default for JobProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Content-derived job id: `sha256:<hex>`
pub fn content_id(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}
