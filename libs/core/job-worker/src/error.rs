//! Worker error types and error categorization
//!
//! Errors are categorized to determine what happens to the message:
//! - **Transient**: dependency unreachable or overloaded, nack and retry with backoff
//! - **Permanent**: the message itself can never succeed, dead-letter and ack

use thiserror::Error;

/// Category of failure for deciding between retry and dead-letter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - nack with backoff delay
    Transient,
    /// Unrecoverable failure - move to the dead-letter store and ack
    Permanent,
}

impl ErrorCategory {
    /// Whether a message failing with this category should go back on the queue
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Queue transport errors (live queue and dead-letter store)
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Queue could not be reached or was closed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Entry on the queue did not have the expected shape
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl QueueError {
    /// Check if this error means the queue itself is unreachable
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
                    || e.is_timeout()
            }
            QueueError::Connection(_) => true,
            QueueError::Encoding(_) => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Encoding(err.to_string())
    }
}

/// Durable store write errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Connection lost, timeout, deadlock - retry
    #[error("Transient sink error: {0}")]
    Transient(String),

    /// Store rejected the data for a reason unrelated to idempotency - dead-letter
    #[error("Fatal sink error: {0}")]
    Fatal(String),
}

impl SinkError {
    /// Create a transient sink error
    pub fn transient(message: impl Into<String>) -> Self {
        SinkError::Transient(message.into())
    }

    /// Create a fatal sink error
    pub fn fatal(message: impl Into<String>) -> Self {
        SinkError::Fatal(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            SinkError::Transient(_) => ErrorCategory::Transient,
            SinkError::Fatal(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category().should_retry()
    }
}

/// Errors that end the worker loop
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Dependencies could not be acquired within the startup attempt budget
    #[error("Startup failed after {attempts} attempts: {message}")]
    Startup { attempts: u32, message: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Invalid worker configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
