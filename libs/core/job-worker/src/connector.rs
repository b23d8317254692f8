//! Dependency acquisition
//!
//! The worker asks a [`Connector`] for its queue, sink and dead-letter store
//! while starting, and hands them back when it stops. Partially acquired
//! connections are dropped when `connect` returns an error.

use crate::config::WorkerConfig;
use crate::consumer::{RedisQueue, connect_redis};
use crate::dlq::{DeadLetterSink, RedisDeadLetters};
use crate::error::{QueueError, WorkerError};
use crate::postgres::PgSink;
use crate::queue::JobQueue;
use crate::sink::JobSink;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Everything the running loop talks to
pub struct Connections<Q, S, D> {
    pub queue: Q,
    pub sink: S,
    pub dead_letters: D,
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Queue: JobQueue + 'static;
    type Sink: JobSink + 'static;
    type DeadLetters: DeadLetterSink + 'static;

    /// Acquire all dependencies, or fail without holding any of them.
    async fn connect(
        &self,
    ) -> Result<Connections<Self::Queue, Self::Sink, Self::DeadLetters>, WorkerError>;

    /// Release dependencies acquired by `connect`.
    async fn release(&self, connections: Connections<Self::Queue, Self::Sink, Self::DeadLetters>) {
        drop(connections);
    }
}

/// Redis Streams queue and DLQ, PostgreSQL sink
pub struct RedisPostgresConnector {
    redis_url: String,
    database_url: String,
    config: WorkerConfig,
    auto_migrate: bool,
}

impl RedisPostgresConnector {
    pub fn new(
        redis_url: impl Into<String>,
        database_url: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            redis_url: redis_url.into(),
            database_url: database_url.into(),
            config,
            auto_migrate: true,
        }
    }

    /// Create the jobs table on connect (default: true)
    pub fn with_auto_migrate(mut self, enabled: bool) -> Self {
        self.auto_migrate = enabled;
        self
    }
}

#[async_trait]
impl Connector for RedisPostgresConnector {
    type Queue = RedisQueue;
    type Sink = PgSink;
    type DeadLetters = RedisDeadLetters;

    async fn connect(
        &self,
    ) -> Result<Connections<RedisQueue, PgSink, RedisDeadLetters>, WorkerError> {
        let redis = connect_redis(&self.redis_url, self.config.dequeue_timeout)
            .await
            .map_err(QueueError::from)?;
        let redis = Arc::new(redis);

        let queue = RedisQueue::new(redis.clone(), self.config.clone());
        queue.init_consumer_group().await?;

        let sink = PgSink::connect(&self.database_url, self.config.write_timeout).await?;
        if self.auto_migrate {
            sink.ensure_schema().await?;
        }

        let dead_letters = RedisDeadLetters::new(redis, self.config.dlq_stream.clone());

        Ok(Connections {
            queue,
            sink,
            dead_letters,
        })
    }

    async fn release(&self, connections: Connections<RedisQueue, PgSink, RedisDeadLetters>) {
        let Connections {
            queue,
            sink,
            dead_letters,
        } = connections;

        drop(queue);
        drop(dead_letters);
        sink.close().await;

        info!("Released queue and store connections");
    }
}
