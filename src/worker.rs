use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    error::{ConfigError, JobError},
    job_handle::JobHandle,
    lease::WorkerId,
    queue::Queue,
    registry::JobRegistry,
    retry::RetryPolicy,
    types::JobStatus,
};

/// Runtime settings of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub worker_count: usize,
    pub queues: Vec<String>,
    pub lease_duration: Duration,
    /// Must be shorter than `lease_duration`.
    pub execution_timeout: Duration,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    /// Upper bound of the backoff between claims while the backend is failing.
    pub max_backend_backoff: Duration,
    pub name: String,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queues: vec!["default".to_string()],
            lease_duration: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(25),
            poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
            max_backend_backoff: Duration::from_secs(30),
            name: "worker".to_string(),
        }
    }
}

impl WorkerPoolOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.queues.is_empty() || self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "workers need at least one non-empty queue name".into(),
            ));
        }
        if self.execution_timeout.is_zero() || self.execution_timeout >= self.lease_duration {
            return Err(ConfigError::Invalid(format!(
                "execution_timeout ({:?}) must be non-zero and shorter than lease_duration ({:?})",
                self.execution_timeout, self.lease_duration
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// What happened to in-flight work when the pool stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers still running a handler when the drain window closed.
    pub forced_workers: usize,
}

/// Fixed set of workers pulling jobs from one queue backend.
pub struct WorkerPool {
    shutdown: CancellationToken,
    abort: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<dyn Queue>,
        registry: Arc<JobRegistry>,
        retry: RetryPolicy,
        options: WorkerPoolOptions,
    ) -> Result<Self, ConfigError> {
        options.validate()?;

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let pool_name = WorkerId::pool_name(&options.name);
        let claim_backoff = RetryPolicy {
            base_delay: options.poll_interval,
            max_delay: options.max_backend_backoff.max(options.poll_interval),
            ..RetryPolicy::default()
        };
        let options = Arc::new(options);

        let handles = (0..options.worker_count)
            .map(|index| {
                let worker = Worker {
                    id: WorkerId::new(&pool_name, index),
                    queue: Arc::clone(&queue),
                    registry: Arc::clone(&registry),
                    retry: retry.clone(),
                    claim_backoff: claim_backoff.clone(),
                    options: Arc::clone(&options),
                    rotation: index,
                };
                let span = tracing::info_span!("worker", worker_id = %worker.id);
                tokio::spawn(
                    worker
                        .run(shutdown.clone(), abort.clone())
                        .instrument(span),
                )
            })
            .collect();

        info!(
            pool = %pool_name,
            workers = options.worker_count,
            queues = ?options.queues,
            "worker pool started"
        );

        Ok(Self {
            shutdown,
            abort,
            handles,
            drain_timeout: options.drain_timeout,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop claiming, give in-flight handlers `drain_timeout` to finish, then cancel
    /// the rest. Cancelled jobs are released back to the queue without an attempt.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(drain_timeout = ?self.drain_timeout, "worker pool draining");
        self.shutdown.cancel();

        let drained = tokio::time::timeout(self.drain_timeout, join_all(&mut self.handles))
            .await
            .is_ok();

        let forced_workers = self.handles.len();
        if !drained {
            warn!(forced_workers, "drain timeout elapsed, cancelling in-flight jobs");
            self.abort.cancel();
            join_all(&mut self.handles).await;
        }

        info!(forced_workers, "worker pool stopped");
        ShutdownReport { forced_workers }
    }
}

async fn join_all(handles: &mut Vec<JoinHandle<()>>) {
    while let Some(handle) = handles.last_mut() {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task ended abnormally");
        }
        handles.pop();
    }
}

/// `true` when cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Round-robin start point over the subscribed queues.
fn queue_order(queues: &[String], rotation: usize) -> Vec<String> {
    let mut ordered = queues.to_vec();
    if !ordered.is_empty() {
        let len = ordered.len();
        ordered.rotate_left(rotation % len);
    }
    ordered
}

struct Worker {
    id: WorkerId,
    queue: Arc<dyn Queue>,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
    claim_backoff: RetryPolicy,
    options: Arc<WorkerPoolOptions>,
    rotation: usize,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken, abort: CancellationToken) {
        debug!("worker started");
        let mut backend_failures = 0u32;

        while !shutdown.is_cancelled() {
            let queues = queue_order(&self.options.queues, self.rotation);
            self.rotation = self.rotation.wrapping_add(1);

            match self
                .queue
                .claim(&queues, self.options.lease_duration, self.id.as_str())
                .await
            {
                Ok(Some(job)) => {
                    backend_failures = 0;
                    let handle = JobHandle::new(Arc::clone(&self.queue), job);
                    self.execute(handle, &abort).await;
                }
                Ok(None) => {
                    backend_failures = 0;
                    if sleep_or_cancel(self.options.poll_interval, &shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    let delay = self.claim_backoff.next_delay(backend_failures);
                    backend_failures = backend_failures.saturating_add(1);
                    if e.is_backend_unavailable() {
                        warn!(error = %e, retry_in = ?delay, "queue backend unavailable, backing off");
                    } else {
                        error!(error = %e, retry_in = ?delay, "claim failed, backing off");
                    }
                    if sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }
        debug!("worker stopped");
    }

    async fn execute(&self, handle: JobHandle, abort: &CancellationToken) {
        let span = tracing::debug_span!(
            "job",
            job_id = %handle.id(),
            queue = %handle.queue_name(),
            handler = %handle.handler_name(),
            attempt = handle.attempt(),
        );
        let outcome = self.invoke(&handle, abort).instrument(span.clone()).await;
        self.report(handle, outcome).instrument(span).await;
    }

    async fn invoke(&self, handle: &JobHandle, abort: &CancellationToken) -> Result<(), JobError> {
        let Some(handler) = self.registry.get(handle.handler_name()) else {
            return Err(JobError::HandlerNotRegistered(handle.handler_name().to_string()));
        };

        let ctx = handle.context();
        let timeout = self.options.execution_timeout;
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(JobError::Panicked),
                Err(_) => Err(JobError::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => {
                task.abort();
                Err(JobError::Timeout(timeout))
            }
            _ = abort.cancelled() => {
                task.abort();
                Err(JobError::Cancelled)
            }
        }
    }

    async fn report(&self, handle: JobHandle, outcome: Result<(), JobError>) {
        let job_id = handle.id();
        let result = match outcome {
            Ok(()) => {
                debug!("job succeeded");
                handle.complete().await.map(|_| JobStatus::Done)
            }
            Err(JobError::Cancelled) => {
                warn!("job cancelled by shutdown, releasing lease");
                handle.release().await
            }
            Err(e) if e.is_retryable() => {
                let delay = self.retry.next_delay(handle.attempt());
                let message = e.to_string();
                handle.fail(&message, delay).await.map(|status| {
                    match status {
                        JobStatus::Dead => warn!(
                            error = %message,
                            "job exhausted its attempts, moved to dead-letter queue"
                        ),
                        JobStatus::Ready => {
                            warn!(error = %message, retry_in = ?delay, "job failed, will retry")
                        }
                        JobStatus::Leased | JobStatus::Done => {
                            warn!(error = %message, "lease lost before the failure was recorded")
                        }
                    }
                    status
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "job failed permanently, moved to dead-letter queue");
                handle.dead_queue(&message).await
            }
        };

        // The lease stays in place and the reaper hands the job out again.
        if let Err(e) = result {
            error!(%job_id, error = %e, "failed to record job outcome");
        }
    }
}
