//! Jobs Worker Service
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (jobs:queue)
//!   ↓ (Consumer Group: jobs_workers)
//! Worker<RedisPostgresConnector>
//!   ├─ valid job      → PostgreSQL jobs table (idempotent on job_id) → ack
//!   ├─ transient error → nack with backoff
//!   └─ invalid/fatal  → Redis Stream (jobs:dlq) → ack
//! ```
//!
//! Configuration comes from the environment (see `core_config::worker`).
//! SIGINT/SIGTERM finish the in-flight job and stop the worker; startup that
//! cannot reach Redis or PostgreSQL exits non-zero.

use core_config::worker::JobWorkerSettings;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use job_worker::{RedisPostgresConnector, RunSummary, Worker, WorkerConfig};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Map environment settings onto the library's worker config
pub fn worker_config(settings: &JobWorkerSettings) -> WorkerConfig {
    WorkerConfig::new(&settings.queue_stream, &settings.consumer_group)
        .with_dlq_stream(&settings.dlq_stream)
        .with_dequeue_timeout(Duration::from_millis(settings.dequeue_timeout_ms))
        .with_min_poll_interval(Duration::from_millis(settings.min_poll_interval_ms))
        .with_visibility_timeout(Duration::from_millis(settings.visibility_timeout_ms))
        .with_write_timeout(Duration::from_millis(settings.write_timeout_ms))
        .with_backoff(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.max_backoff_ms),
        )
        .with_startup_max_attempts(settings.startup_max_attempts)
        .with_max_receive_count(settings.max_receive_count)
}

/// Run the jobs worker
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, if Redis or
/// PostgreSQL stay unreachable for the whole startup budget, or if the signal
/// handlers cannot be installed.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting jobs worker service"
    );

    let settings =
        JobWorkerSettings::from_env().wrap_err("Failed to load jobs worker configuration")?;
    let config = worker_config(&settings);

    info!(
        stream = %config.stream_name,
        consumer_group = %config.consumer_group,
        consumer_id = %config.consumer_id,
        dlq_stream = %config.dlq_stream,
        dequeue_timeout_ms = settings.dequeue_timeout_ms,
        visibility_timeout_ms = settings.visibility_timeout_ms,
        max_backoff_ms = settings.max_backoff_ms,
        max_receive_count = ?settings.max_receive_count,
        auto_migrate = settings.auto_migrate,
        "Worker configuration loaded"
    );

    let connector =
        RedisPostgresConnector::new(&settings.redis_url, &settings.database_url, config.clone())
            .with_auto_migrate(settings.auto_migrate);
    let worker = Worker::new(connector, config).wrap_err("Invalid worker configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let summary = worker.run(shutdown_rx).await.wrap_err("Jobs worker failed")?;

    log_summary(&summary);
    Ok(())
}

fn log_summary(summary: &RunSummary) {
    info!(
        received = summary.received,
        stored = summary.stored,
        duplicates = summary.duplicates,
        dead_lettered = summary.dead_lettered,
        retried = summary.retried,
        "Jobs worker service stopped"
    );
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn settings() -> JobWorkerSettings {
        JobWorkerSettings {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/jobs".to_string(),
            queue_stream: "jobs:queue".to_string(),
            consumer_group: "jobs_workers".to_string(),
            dlq_stream: "jobs:dlq".to_string(),
            dequeue_timeout_ms: 1_000,
            min_poll_interval_ms: 100,
            visibility_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
            backoff_base_ms: 500,
            max_backoff_ms: 30_000,
            startup_max_attempts: 5,
            max_receive_count: Some(8),
            auto_migrate: true,
        }
    }

    #[test]
    fn test_worker_config_from_settings() {
        let config = worker_config(&settings());

        assert_eq!(config.stream_name, "jobs:queue");
        assert_eq!(config.consumer_group, "jobs_workers");
        assert_eq!(config.dlq_stream, "jobs:dlq");
        assert_eq!(config.dequeue_timeout, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.max_receive_count, Some(8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_write_timeout_longer_than_visibility_is_rejected() {
        let mut settings = settings();
        settings.write_timeout_ms = 60_000;

        assert!(worker_config(&settings).validate().is_err());
    }

    #[test]
    fn test_summary_log_carries_every_counter() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let summary = RunSummary {
            received: 9,
            stored: 3,
            duplicates: 2,
            dead_lettered: 1,
            retried: 3,
        };

        tracing::subscriber::with_default(subscriber, || log_summary(&summary));

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        for field in [
            "received=9",
            "stored=3",
            "duplicates=2",
            "dead_lettered=1",
            "retried=3",
        ] {
            assert!(output.contains(field), "{field} missing from {output}");
        }
    }
}
