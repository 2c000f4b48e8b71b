use std::time::Duration;

use aide_de_camp::core::DateTime;
use async_trait::async_trait;
use chrono::Utc;

use crate::{
    error::QueueError,
    types::{Job, JobId, JobStatus, NewJob, Page},
};

/// How long done jobs stay readable through [`Queue::get`] unless configured otherwise.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Durable job storage and the only place job state transitions happen.
///
/// Every method is atomic with respect to concurrent callers. Workers and the
/// scheduler never mutate a [`Job`] themselves, they ask the backend to.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Insert a job in `ready` state. Fails with
    /// [`QueueError::DuplicateIdempotencyKey`] while another job holding the same key
    /// is neither done nor dead.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Lease the oldest claimable job of the first queue in `queue_names` that has one.
    async fn claim_with_instant(
        &self,
        queue_names: &[String],
        lease_duration: Duration,
        worker_id: &str,
        now: DateTime,
    ) -> Result<Option<Job>, QueueError>;

    async fn claim(
        &self,
        queue_names: &[String],
        lease_duration: Duration,
        worker_id: &str,
    ) -> Result<Option<Job>, QueueError> {
        self.claim_with_instant(queue_names, lease_duration, worker_id, Utc::now())
            .await
    }

    /// Mark a job leased by `worker_id` done. Acking anything else is a no-op.
    ///
    /// The completion calls below are fenced the same way: a worker whose lease was
    /// reaped and handed to someone else cannot settle the job, it only gets the
    /// current status back.
    async fn ack(&self, id: JobId, worker_id: &str) -> Result<(), QueueError>;

    /// Record a failed execution. The job is retried after `retry_after` while
    /// attempts remain, otherwise it is dead-lettered. Returns the resulting status.
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<JobStatus, QueueError>;

    /// Dead-letter a leased job regardless of its remaining attempts.
    async fn dead_queue(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<JobStatus, QueueError>;

    /// Give a leased job back without counting an attempt.
    async fn release(&self, id: JobId, worker_id: &str) -> Result<JobStatus, QueueError>;

    /// Return every job whose lease expired before `now` to `ready`.
    /// Attempts are left untouched: a lost worker is not a handler failure.
    ///
    /// Backends also drop done jobs older than their completed-job retention here.
    async fn reap_expired_leases(&self, now: DateTime) -> Result<usize, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Dead jobs of `queue_name`, oldest first.
    async fn list_dead(&self, queue_name: &str, page: Page) -> Result<Vec<Job>, QueueError>;

    /// Put a dead job back in `ready` with a fresh attempt budget.
    async fn requeue_dead(&self, id: JobId) -> Result<(), QueueError>;
}
