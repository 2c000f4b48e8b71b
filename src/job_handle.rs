use std::{sync::Arc, time::Duration};

use crate::{
    error::QueueError,
    queue::Queue,
    registry::JobContext,
    types::{Job, JobId, JobStatus},
};

/// A claimed job plus the backend that leased it.
///
/// Each completion method consumes the handle, so a worker reports exactly one
/// outcome per claim. Outcomes are reported under the lease owner recorded at claim
/// time, so a handle whose lease was reaped and re-claimed elsewhere settles nothing.
pub struct JobHandle {
    queue: Arc<dyn Queue>,
    job: Job,
    lease_owner: String,
}

impl JobHandle {
    pub(crate) fn new(queue: Arc<dyn Queue>, job: Job) -> Self {
        let lease_owner = job.lease_owner.clone().unwrap_or_default();
        Self {
            queue,
            job,
            lease_owner,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn handler_name(&self) -> &str {
        &self.job.handler_name
    }

    pub fn queue_name(&self) -> &str {
        &self.job.queue_name
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn context(&self) -> JobContext {
        JobContext::from(&self.job)
    }

    pub async fn complete(self) -> Result<(), QueueError> {
        self.queue.ack(self.job.id, &self.lease_owner).await
    }

    pub async fn fail(self, error: &str, retry_after: Duration) -> Result<JobStatus, QueueError> {
        self.queue
            .fail(self.job.id, &self.lease_owner, error, retry_after)
            .await
    }

    pub async fn dead_queue(self, error: &str) -> Result<JobStatus, QueueError> {
        self.queue
            .dead_queue(self.job.id, &self.lease_owner, error)
            .await
    }

    pub async fn release(self) -> Result<JobStatus, QueueError> {
        self.queue.release(self.job.id, &self.lease_owner).await
    }
}
