//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the job worker.

use crate::backoff::BackoffPolicy;
use crate::error::WorkerError;
use crate::processor::DEFAULT_MAX_PAYLOAD_BYTES;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for the job worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Live queue stream name
    pub stream_name: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Unique consumer ID (auto-generated if not provided)
    pub consumer_id: String,

    /// Dead-letter stream name
    pub dlq_stream: String,

    /// Longest a single dequeue waits for a message
    pub dequeue_timeout: Duration,

    /// Minimum time between empty polls
    pub min_poll_interval: Duration,

    /// How long a delivered message stays invisible before redelivery
    pub visibility_timeout: Duration,

    /// Upper bound on a single sink write
    pub write_timeout: Duration,

    /// First backoff delay
    pub backoff_base: Duration,

    /// Backoff ceiling
    pub max_backoff: Duration,

    /// Dependency acquisition attempts before the worker gives up
    pub startup_max_attempts: u32,

    /// Dead-letter messages delivered more than this many times (None = retry forever)
    pub max_receive_count: Option<u32>,

    /// Payload size limit in bytes
    pub max_payload_bytes: usize,
}

impl WorkerConfig {
    /// Create a new WorkerConfig with explicit values
    pub fn new(stream_name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        Self {
            dlq_stream: format!("{}:dlq", stream_name),
            stream_name,
            consumer_group: consumer_group.into(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            dequeue_timeout: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            startup_max_attempts: 5,
            max_receive_count: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Set the consumer ID
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the DLQ stream name
    pub fn with_dlq_stream(mut self, stream: impl Into<String>) -> Self {
        self.dlq_stream = stream.into();
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the backoff base and ceiling
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_startup_max_attempts(mut self, attempts: u32) -> Self {
        self.startup_max_attempts = attempts;
        self
    }

    pub fn with_max_receive_count(mut self, count: Option<u32>) -> Self {
        self.max_receive_count = count;
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Backoff policy built from this config, with a fresh jitter factor
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.max_backoff)
    }

    /// Reject settings the worker loop cannot run with
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.stream_name.is_empty() || self.consumer_group.is_empty() {
            return Err(WorkerError::Config(
                "stream name and consumer group must not be empty".to_string(),
            ));
        }
        if self.dlq_stream == self.stream_name {
            return Err(WorkerError::Config(
                "dead-letter stream must differ from the live stream".to_string(),
            ));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(WorkerError::Config("dequeue timeout must be > 0".to_string()));
        }
        if self.visibility_timeout <= self.write_timeout {
            return Err(WorkerError::Config(format!(
                "visibility timeout ({:?}) must exceed write timeout ({:?})",
                self.visibility_timeout, self.write_timeout
            )));
        }
        if self.backoff_base.is_zero() {
            return Err(WorkerError::Config("backoff base must be > 0".to_string()));
        }
        if self.startup_max_attempts == 0 {
            return Err(WorkerError::Config(
                "startup max attempts must be >= 1".to_string(),
            ));
        }
        if self.max_receive_count == Some(0) {
            return Err(WorkerError::Config(
                "max receive count must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("jobs:queue", "jobs_workers").with_dlq_stream("jobs:dlq")
    }
}
