//! In-process queue, sink and dead-letter store
//!
//! Same contracts as the Redis and PostgreSQL implementations, with counters
//! for inspecting what the worker did. Used by tests and local runs.

use crate::dlq::{DeadLetterReason, DeadLetterSink};
use crate::error::{QueueError, SinkError};
use crate::message::{DeliveryHandle, Job, RawMessage};
use crate::queue::{JobQueue, PollPacer};
use crate::sink::{JobSink, WriteOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    payload: Vec<u8>,
    deliveries: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<String, (Instant, Entry)>,
    dequeues: usize,
    acks: usize,
    nacks: Vec<Duration>,
    closed: bool,
}

impl QueueState {
    /// Move due delayed entries and expired in-flight entries to `ready`.
    fn release_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(visible_at, _)| *visible_at <= now);
        self.delayed = waiting;
        self.ready.extend(due.into_iter().map(|(_, entry)| entry));

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (visible_at, _))| *visible_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, entry)) = self.in_flight.remove(&id) {
                self.ready.push_front(entry);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .map(|(at, _)| *at)
            .chain(self.in_flight.values().map(|(at, _)| *at))
            .min()
    }

    /// Remove the in-flight entry if `handle` is its current delivery.
    fn take_delivery(&mut self, handle: &DeliveryHandle) -> Option<Entry> {
        let current = self
            .in_flight
            .get(handle.id())
            .is_some_and(|(_, entry)| entry.deliveries == handle.receive_count());
        if current {
            self.in_flight.remove(handle.id()).map(|(_, entry)| entry)
        } else {
            None
        }
    }
}

/// In-memory [`JobQueue`] with visibility timeouts and delayed nacks
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
    pacer: PollPacer,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration, min_poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
            pacer: PollPacer::new(min_poll_interval),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a message; returns its id
    pub fn enqueue(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("mem-{}", state.next_id);
            state.ready.push_back(Entry {
                id: id.clone(),
                payload: payload.into(),
                deliveries: 0,
                enqueued_at: Utc::now(),
            });
            id
        };
        self.notify.notify_one();
        id
    }

    /// Make further dequeues fail, as if the queue went away
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Undo `close`
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Messages ready for delivery right now
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Number of dequeue calls so far
    pub fn dequeue_calls(&self) -> usize {
        self.lock().dequeues
    }

    /// Number of ack calls so far, including no-op acks
    pub fn ack_calls(&self) -> usize {
        self.lock().acks
    }

    /// Delays passed to nack, in call order
    pub fn nack_delays(&self) -> Vec<Duration> {
        self.lock().nacks.clone()
    }

    fn try_deliver(&self) -> Result<Option<RawMessage>, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Connection("queue closed".to_string()));
        }

        let now = Instant::now();
        state.release_due(now);

        let Some(mut entry) = state.ready.pop_front() else {
            return Ok(None);
        };
        entry.deliveries += 1;

        let message = RawMessage {
            payload: entry.payload.clone(),
            handle: DeliveryHandle::new(entry.id.clone(), entry.deliveries),
            receive_count: entry.deliveries,
            enqueued_at: entry.enqueued_at,
        };
        state
            .in_flight
            .insert(entry.id.clone(), (now + self.visibility_timeout, entry));

        Ok(Some(message))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<RawMessage>, QueueError> {
        let started = Instant::now();
        let deadline = started + timeout;
        self.lock().dequeues += 1;

        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_deliver()? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wake_at = self
                .lock()
                .next_wakeup()
                .map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        self.pacer.pace_empty_poll(started).await;
        Ok(None)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.acks += 1;
        state.take_delivery(handle);
        Ok(())
    }

    async fn nack(&self, handle: &DeliveryHandle, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            state.nacks.push(delay);
            if let Some(entry) = state.take_delivery(handle) {
                state.delayed.push((Instant::now() + delay, entry));
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

/// In-memory [`JobSink`] keyed by job id, with failure injection
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<HashMap<String, Job>>,
    failures: Mutex<VecDeque<SinkError>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next writes with these errors, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SinkError>) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(errors);
    }

    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Write attempts so far, including failed ones
    pub fn write_calls(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobSink for MemorySink {
    async fn write(&self, job: &Job) -> Result<WriteOutcome, SinkError> {
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(err) = injected {
            return Err(err);
        }

        let mut rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if rows.contains_key(job.id()) {
            return Ok(WriteOutcome::Duplicate);
        }
        rows.insert(job.id().to_string(), job.clone());
        Ok(WriteOutcome::Inserted)
    }
}

/// In-memory [`DeadLetterSink`]
#[derive(Default)]
pub struct MemoryDeadLetters {
    entries: Mutex<Vec<(RawMessage, DeadLetterReason)>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(RawMessage, DeadLetterReason)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn dead_letter(
        &self,
        message: &RawMessage,
        reason: &DeadLetterReason,
    ) -> Result<(), QueueError> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((message.clone(), reason.clone()));
        Ok(())
    }
}
