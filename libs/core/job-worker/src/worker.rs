//! Worker loop
//!
//! ```text
//! Starting ──connect ok──▶ Running ──shutdown──▶ Draining ──release──▶ Stopped
//!     │                                                                  ▲
//!     └──────────── startup attempts exhausted / shutdown ───────────────┘
//! ```
//!
//! One message at a time: dequeue, parse, write, then ack or nack. A shutdown
//! signal never interrupts a message between its write and its ack. The state
//! turns `Draining` as soon as the signal is seen; the loop itself stops only
//! at message boundaries and while pausing.

use crate::backoff::BackoffPolicy;
use crate::config::WorkerConfig;
use crate::connector::{Connections, Connector};
use crate::dlq::{DeadLetterReason, DeadLetterSink};
use crate::error::{SinkError, WorkerError};
use crate::message::{ProcessResult, RawMessage};
use crate::processor::JobProcessor;
use crate::queue::JobQueue;
use crate::sink::{JobSink, WriteOutcome};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        next > self
    }

    pub fn is_terminal(self) -> bool {
        self == WorkerState::Stopped
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Written (or found already written) and acked
    Stored(WriteOutcome),
    /// Recorded in the dead-letter store and acked
    DeadLettered(&'static str),
    /// Nacked for redelivery after `delay`
    Retried { delay: Duration },
}

/// Counters for one run of the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub received: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub retried: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &MessageOutcome) {
        self.received += 1;
        match outcome {
            MessageOutcome::Stored(WriteOutcome::Inserted) => self.stored += 1,
            MessageOutcome::Stored(WriteOutcome::Duplicate) => self.duplicates += 1,
            MessageOutcome::DeadLettered(_) => self.dead_lettered += 1,
            MessageOutcome::Retried { .. } => self.retried += 1,
        }
    }
}

type ConnectionsOf<C> = Connections<
    <C as Connector>::Queue,
    <C as Connector>::Sink,
    <C as Connector>::DeadLetters,
>;

/// Single-use worker: build it, optionally `subscribe`, then `run` it.
pub struct Worker<C: Connector> {
    connector: C,
    config: WorkerConfig,
    processor: JobProcessor,
    backoff: BackoffPolicy,
    state: watch::Sender<WorkerState>,
}

impl<C: Connector> Worker<C> {
    pub fn new(connector: C, config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;

        let processor = JobProcessor::new().with_max_payload_bytes(config.max_payload_bytes);
        let backoff = config.backoff_policy();
        let (state, _) = watch::channel(WorkerState::Starting);

        Ok(Self {
            connector,
            config,
            processor,
            backoff,
            state,
        })
    }

    /// Replace the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run until shutdown is signalled or startup gives up.
    ///
    /// Setting `shutdown` to `true`, or dropping its sender, stops the worker
    /// at the next message boundary.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary, WorkerError> {
        info!(
            consumer_id = %self.config.consumer_id,
            stream = %self.config.stream_name,
            group = %self.config.consumer_group,
            dlq_stream = %self.config.dlq_stream,
            jitter_factor = self.backoff.jitter_factor(),
            "Starting job worker"
        );

        let connections = match self.start(&mut shutdown).await {
            Ok(Some(connections)) => connections,
            Ok(None) => {
                info!("Shutdown requested during startup");
                self.transition(WorkerState::Stopped);
                return Ok(RunSummary::default());
            }
            Err(e) => {
                self.transition(WorkerState::Stopped);
                return Err(e);
            }
        };

        self.transition(WorkerState::Running);
        let summary = self.consume(&connections, &mut shutdown).await;

        self.transition(WorkerState::Draining);
        self.connector.release(connections).await;
        self.transition(WorkerState::Stopped);

        info!(
            received = summary.received,
            stored = summary.stored,
            duplicates = summary.duplicates,
            dead_lettered = summary.dead_lettered,
            retried = summary.retried,
            "Job worker stopped"
        );
        Ok(summary)
    }

    fn transition(&self, next: WorkerState) {
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(state = %next, "Worker state changed");
        }
    }

    async fn start(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<ConnectionsOf<C>>, WorkerError> {
        let mut failures: u32 = 0;

        loop {
            if shutdown_requested(shutdown) {
                return Ok(None);
            }

            match self.connector.connect().await {
                Ok(connections) => {
                    if failures > 0 {
                        info!(attempts = failures + 1, "Dependencies reachable after retries");
                    }
                    return Ok(Some(connections));
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.startup_max_attempts {
                        error!(error = %e, attempts = failures, "Giving up on startup");
                        return Err(WorkerError::Startup {
                            attempts: failures,
                            message: e.to_string(),
                        });
                    }

                    let delay = self.backoff.next_delay(failures - 1);
                    warn!(
                        error = %e,
                        attempt = failures,
                        max_attempts = self.config.startup_max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to acquire dependencies, retrying"
                    );
                    if pause(delay, shutdown).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn consume(
        &self,
        connections: &ConnectionsOf<C>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        // Processing failures reset on a stored job, queue failures on any
        // successful dequeue
        let mut failures: u32 = 0;
        let mut dequeue_failures: u32 = 0;

        loop {
            if shutdown_requested(shutdown) {
                info!("Received shutdown signal, draining");
                self.transition(WorkerState::Draining);
                break;
            }

            let message = match connections.queue.dequeue(self.config.dequeue_timeout).await {
                Ok(message) => {
                    if dequeue_failures > 0 {
                        info!(after_failures = dequeue_failures, "Queue reachable again");
                        dequeue_failures = 0;
                    }
                    match message {
                        Some(message) => message,
                        None => continue,
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay(dequeue_failures);
                    dequeue_failures = dequeue_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        connection_error = e.is_connection_error(),
                        consecutive_failures = dequeue_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Dequeue failed, backing off"
                    );
                    if pause(delay, shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let outcome = self
                .finish_message(connections, message, &mut failures, shutdown)
                .await;
            summary.record(&outcome);

            if let MessageOutcome::Retried { delay } = outcome
                && pause(delay, shutdown).await
            {
                break;
            }
        }

        summary
    }

    /// Run `handle_message` to completion, entering `Draining` as soon as
    /// shutdown is signalled. The message itself is never cancelled.
    async fn finish_message(
        &self,
        connections: &ConnectionsOf<C>,
        message: RawMessage,
        failures: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        let mut watching = true;
        if shutdown_requested(shutdown) {
            self.transition(WorkerState::Draining);
            watching = false;
        }

        let handling = self.handle_message(connections, message, failures);
        tokio::pin!(handling);

        loop {
            tokio::select! {
                outcome = &mut handling => return outcome,
                changed = shutdown.changed(), if watching => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Received shutdown signal, finishing in-flight message");
                        self.transition(WorkerState::Draining);
                        watching = false;
                    }
                }
            }
        }
    }

    /// Drive one message to an ack or a nack.
    async fn handle_message(
        &self,
        connections: &ConnectionsOf<C>,
        message: RawMessage,
        failures: &mut u32,
    ) -> MessageOutcome {
        debug!(
            message_id = %message.handle,
            receive_count = message.receive_count,
            "Processing message"
        );

        if let Some(max) = self.config.max_receive_count
            && message.receive_count > max
        {
            let reason = DeadLetterReason::Exhausted {
                receive_count: message.receive_count,
            };
            return self.dead_letter(connections, &message, reason, failures).await;
        }

        let job = match self.processor.parse(&message) {
            ProcessResult::Success(job) => job,
            ProcessResult::Invalid(reason) => {
                let reason = DeadLetterReason::Invalid(reason);
                return self.dead_letter(connections, &message, reason, failures).await;
            }
            ProcessResult::TransientError(reason) => {
                return self.retry(connections, &message, &reason, failures).await;
            }
        };

        match connections.sink.write(&job).await {
            Ok(outcome) => {
                if *failures > 0 {
                    info!(after_failures = *failures, "Store write succeeded, resetting backoff");
                }
                *failures = 0;
                match outcome {
                    WriteOutcome::Inserted => {
                        debug!(job_id = %job.id(), message_id = %message.handle, "Stored job");
                    }
                    WriteOutcome::Duplicate => {
                        info!(
                            job_id = %job.id(),
                            message_id = %message.handle,
                            receive_count = message.receive_count,
                            "Job already stored, acknowledging duplicate delivery"
                        );
                    }
                }
                self.ack(connections, &message).await;
                MessageOutcome::Stored(outcome)
            }
            Err(SinkError::Transient(reason)) => {
                self.retry(connections, &message, &reason, failures).await
            }
            Err(SinkError::Fatal(reason)) => {
                let reason = DeadLetterReason::Fatal(reason);
                self.dead_letter(connections, &message, reason, failures).await
            }
        }
    }

    async fn retry(
        &self,
        connections: &ConnectionsOf<C>,
        message: &RawMessage,
        reason: &str,
        failures: &mut u32,
    ) -> MessageOutcome {
        let delay = self.backoff.next_delay(*failures);
        *failures = failures.saturating_add(1);

        warn!(
            message_id = %message.handle,
            receive_count = message.receive_count,
            consecutive_failures = *failures,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Transient failure, returning message to queue"
        );

        if let Err(e) = connections.queue.nack(&message.handle, delay).await {
            error!(
                message_id = %message.handle,
                error = %e,
                "Failed to NACK message; it will be redelivered after the visibility timeout"
            );
        }

        MessageOutcome::Retried { delay }
    }

    async fn dead_letter(
        &self,
        connections: &ConnectionsOf<C>,
        message: &RawMessage,
        reason: DeadLetterReason,
        failures: &mut u32,
    ) -> MessageOutcome {
        match connections.dead_letters.dead_letter(message, &reason).await {
            Ok(()) => {
                info!(
                    message_id = %message.handle,
                    receive_count = message.receive_count,
                    kind = reason.kind(),
                    reason = %reason,
                    "Moved message to DLQ"
                );
                self.ack(connections, message).await;
                MessageOutcome::DeadLettered(reason.kind())
            }
            Err(e) => {
                error!(
                    message_id = %message.handle,
                    kind = reason.kind(),
                    error = %e,
                    "Failed to write DLQ entry, keeping message on the queue"
                );
                let reason = format!("dead-letter store unavailable: {}", e);
                self.retry(connections, message, &reason, failures).await
            }
        }
    }

    async fn ack(&self, connections: &ConnectionsOf<C>, message: &RawMessage) {
        if let Err(e) = connections.queue.ack(&message.handle).await {
            error!(
                message_id = %message.handle,
                error = %e,
                "Failed to ACK message; it will be redelivered after the visibility timeout"
            );
        }
    }
}

/// True once shutdown was signalled or its sender is gone
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay` unless shutdown arrives first. Returns true on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if shutdown_requested(shutdown) {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
