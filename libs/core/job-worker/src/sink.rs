//! Durable store contract
//!
//! Writes are idempotent on the job id: writing a job whose id is already
//! stored succeeds with [`WriteOutcome::Duplicate`] and changes nothing.

use crate::error::SinkError;
use crate::message::Job;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was stored
    Inserted,
    /// A row with this job id already existed
    Duplicate,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Store `job` exactly once.
    async fn write(&self, job: &Job) -> Result<WriteOutcome, SinkError>;
}

#[async_trait]
impl<T: JobSink + ?Sized> JobSink for Arc<T> {
    async fn write(&self, job: &Job) -> Result<WriteOutcome, SinkError> {
        (**self).write(job).await
    }
}
