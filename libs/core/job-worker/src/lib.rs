//! Job Worker
//!
//! At-least-once job processing: pull payloads off a Redis Streams queue,
//! validate them, and store each job exactly once in PostgreSQL.
//!
//! ## Features
//!
//! - **At-least-once delivery**: messages are acked only after they are stored
//!   or dead-lettered; unacked messages come back after a visibility timeout
//! - **Idempotent writes**: the sink deduplicates on job id, so redeliveries
//!   are harmless
//! - **Dead Letter Queue**: malformed payloads and rejected jobs are kept with
//!   their reason instead of being dropped
//! - **Backoff**: transient failures are nacked with exponential, jittered delays
//! - **Graceful shutdown**: the in-flight message is finished before stopping
//!
//! ## Example
//!
//! ```ignore
//! use job_worker::{RedisPostgresConnector, Worker, WorkerConfig};
//!
//! let config = WorkerConfig::default();
//! let connector = RedisPostgresConnector::new(redis_url, database_url, config.clone());
//! let worker = Worker::new(connector, config)?;
//! let summary = worker.run(shutdown_rx).await?;
//! ```

mod backoff;
mod config;
mod connector;
mod consumer;
mod dlq;
mod error;
mod memory;
mod message;
mod postgres;
mod processor;
mod producer;
mod queue;
mod sink;
mod worker;

// Re-export main types
pub use backoff::{BackoffPolicy, DEFAULT_JITTER};
pub use config::WorkerConfig;
pub use connector::{Connections, Connector, RedisPostgresConnector};
pub use consumer::{QueueInfo, RedisQueue, connect_redis, response_timeout_for};
pub use dlq::{DeadLetterEntry, DeadLetterReason, DeadLetterSink, DlqStats, RedisDeadLetters};
pub use error::{ErrorCategory, QueueError, SinkError, WorkerError};
pub use memory::{MemoryDeadLetters, MemoryQueue, MemorySink};
pub use message::{DeliveryHandle, Job, ProcessResult, RawMessage};
pub use postgres::{PgSink, classify_db_error, connect_postgres, entity};
pub use processor::{DEFAULT_MAX_PAYLOAD_BYTES, JobProcessor, MAX_JOB_ID_LEN, content_id};
pub use producer::JobProducer;
pub use queue::{JobQueue, PollPacer};
pub use sink::{JobSink, WriteOutcome};
pub use worker::{MessageOutcome, RunSummary, Worker, WorkerState};
