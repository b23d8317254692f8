//! Queue client contract
//!
//! A queue hands out one message per `dequeue` and keeps it invisible to other
//! consumers until it is acked, nacked, or its visibility timeout expires.
//! Implementations: [`RedisQueue`](crate::consumer::RedisQueue) and
//! [`MemoryQueue`](crate::memory::MemoryQueue).

use crate::error::QueueError;
use crate::message::{DeliveryHandle, RawMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when nothing became available. An empty result never
    /// comes back faster than the queue's minimum poll interval.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<RawMessage>, QueueError>;

    /// Permanently remove the delivered message. Acking twice is a no-op.
    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError>;

    /// Return the message to the queue, visible again after `delay`.
    ///
    /// The redelivery carries a higher receive count. Nacking a handle that was
    /// already acked, nacked, or reclaimed is a no-op.
    async fn nack(&self, handle: &DeliveryHandle, delay: Duration) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: JobQueue + ?Sized> JobQueue for Arc<T> {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<RawMessage>, QueueError> {
        (**self).dequeue(timeout).await
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        (**self).ack(handle).await
    }

    async fn nack(&self, handle: &DeliveryHandle, delay: Duration) -> Result<(), QueueError> {
        (**self).nack(handle, delay).await
    }
}

/// Enforces the minimum interval between empty polls.
#[derive(Debug, Clone, Copy)]
pub struct PollPacer {
    min_interval: Duration,
}

impl PollPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleep out whatever is left of the interval since `started`.
    pub async fn pace_empty_poll(&self, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed < self.min_interval {
            tokio::time::sleep(self.min_interval - elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pacer_sleeps_out_remaining_interval() {
        let pacer = PollPacer::new(Duration::from_millis(30));
        let started = Instant::now();

        pacer.pace_empty_poll(started).await;

        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_pacer_does_not_sleep_after_slow_poll() {
        let pacer = PollPacer::new(Duration::from_millis(10));
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = Instant::now();
        pacer.pace_empty_poll(started).await;

        assert!(before.elapsed() < Duration::from_millis(10));
    }
}
