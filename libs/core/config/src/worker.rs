use crate::{env_or_default, env_parse, env_parse_optional, env_required, ConfigError, FromEnv};

/// Job worker settings, read from `JOBS_*`, `REDIS_URL` and `DATABASE_URL`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobWorkerSettings {
    pub redis_url: String,
    pub database_url: String,
    pub queue_stream: String,
    pub consumer_group: String,
    pub dlq_stream: String,
    pub dequeue_timeout_ms: u64,
    pub min_poll_interval_ms: u64,
    pub visibility_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    pub startup_max_attempts: u32,
    /// None = retry transient failures forever
    pub max_receive_count: Option<u32>,
    /// Create the jobs table on startup
    pub auto_migrate: bool,
}

impl FromEnv for JobWorkerSettings {
    /// Requires REDIS_URL and DATABASE_URL; everything else has a default
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: env_required("REDIS_URL")?,
            database_url: env_required("DATABASE_URL")?,
            queue_stream: env_or_default("JOBS_QUEUE_STREAM", "jobs:queue"),
            consumer_group: env_or_default("JOBS_CONSUMER_GROUP", "jobs_workers"),
            dlq_stream: env_or_default("JOBS_DLQ_STREAM", "jobs:dlq"),
            dequeue_timeout_ms: env_parse("JOBS_DEQUEUE_TIMEOUT_MS", 1_000)?,
            min_poll_interval_ms: env_parse("JOBS_MIN_POLL_INTERVAL_MS", 100)?,
            visibility_timeout_ms: env_parse("JOBS_VISIBILITY_TIMEOUT_MS", 30_000)?,
            write_timeout_ms: env_parse("JOBS_WRITE_TIMEOUT_MS", 5_000)?,
            backoff_base_ms: env_parse("JOBS_BACKOFF_BASE_MS", 500)?,
            max_backoff_ms: env_parse("JOBS_MAX_BACKOFF_MS", 30_000)?,
            startup_max_attempts: env_parse("JOBS_STARTUP_MAX_ATTEMPTS", 5)?,
            max_receive_count: env_parse_optional("JOBS_MAX_RECEIVE_COUNT")?,
            auto_migrate: env_parse("JOBS_AUTO_MIGRATE", true)?,
        })
    }
}
