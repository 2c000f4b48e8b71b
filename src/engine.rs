use std::{future::Future, sync::Arc};

use aide_de_camp::core::Bytes;
use bincode::{Decode, Encode};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::EngineConfig,
    error::{EngineError, JobError, QueueError, SchedulerError},
    lease::LeaseReaper,
    queue::Queue,
    registry::{JobContext, JobHandler, JobRegistry},
    retry::RetryPolicy,
    scheduler::{RecurringDefinition, Scheduler},
    types::{add_duration, EnqueueOptions, Job, JobId, JobStatus, NewJob, Page},
    worker::{ShutdownReport, WorkerPool},
};

struct Running {
    pool: WorkerPool,
    scheduler_shutdown: CancellationToken,
    scheduler_task: JoinHandle<()>,
    reaper_shutdown: CancellationToken,
    reaper_task: JoinHandle<()>,
}

/// Entry point for producers, operators and the process hosting the workers.
///
/// Handlers are registered before [`Engine::start`]. Enqueueing and the
/// introspection calls work whether or not the engine is running, so a pure
/// producer process never has to start it.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<dyn Queue>,
    retry: RetryPolicy,
    registry: Arc<JobRegistry>,
    scheduler: Arc<Scheduler>,
    running: Option<Running>,
    bincode_config: bincode::config::Configuration,
}

impl Engine {
    pub fn new(queue: Arc<dyn Queue>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&queue), config.tick_interval()));
        Ok(Self {
            retry: config.retry_policy(),
            config,
            queue,
            registry: Arc::new(JobRegistry::new()),
            scheduler,
            running: None,
            bincode_config: bincode::config::standard(),
        })
    }

    /// Build the engine on the backend named in `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let queue = config.connect()?;
        Self::new(queue, config)
    }

    pub fn queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn enqueue(
        &self,
        queue_name: &str,
        handler_name: &str,
        payload: impl Into<Bytes>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let now = Utc::now();
        let job = NewJob {
            queue_name: queue_name.to_string(),
            handler_name: handler_name.to_string(),
            payload: payload.into(),
            max_attempts: self.retry.max_attempts_or_default(options.max_attempts),
            not_before: add_duration(now, options.delay.unwrap_or_default()),
            idempotency_key: options.idempotency_key,
        };
        self.queue.enqueue(job).await
    }

    /// Enqueue a bincode-encoded payload, the counterpart of
    /// [`Engine::register_decoded`].
    pub async fn enqueue_encoded<P>(
        &self,
        queue_name: &str,
        handler_name: &str,
        payload: P,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>
    where
        P: Encode,
    {
        let bytes = bincode::encode_to_vec(payload, self.bincode_config)
            .map_err(|e| QueueError::Encode(format!("{e:?}")))?;
        self.enqueue(queue_name, handler_name, bytes, options).await
    }

    fn registry_mut(&mut self) -> Result<&mut JobRegistry, EngineError> {
        Arc::get_mut(&mut self.registry).ok_or(EngineError::AlreadyStarted)
    }

    pub fn register_handler<H>(
        &mut self,
        handler_name: impl Into<String>,
        handler: H,
    ) -> Result<(), EngineError>
    where
        H: JobHandler,
    {
        Ok(self.registry_mut()?.register_handler(handler_name, handler)?)
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        handler_name: impl Into<String>,
        f: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Ok(self.registry_mut()?.register_fn(handler_name, f)?)
    }

    pub fn register_decoded<P, F, Fut>(
        &mut self,
        handler_name: impl Into<String>,
        f: F,
    ) -> Result<(), EngineError>
    where
        P: Decode + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Ok(self.registry_mut()?.register_decoded(handler_name, f)?)
    }

    /// Enqueue `payload_template` on `queue_name` every `interval_seconds`,
    /// starting at the next scheduler tick.
    pub async fn register_recurring(
        &self,
        name: &str,
        queue_name: &str,
        handler_name: &str,
        payload_template: impl Into<Bytes>,
        interval_seconds: u64,
    ) -> Result<(), SchedulerError> {
        let definition = RecurringDefinition::new(
            name,
            queue_name,
            handler_name,
            payload_template,
            interval_seconds,
        )
        .max_attempts(self.retry.default_max_attempts);
        self.scheduler.register_recurring(definition).await
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        self.queue
            .get(id)
            .await?
            .map(|job| job.status)
            .ok_or(QueueError::JobNotFound(id))
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.queue.get(id).await
    }

    pub async fn list_dead(&self, queue_name: &str, page: Page) -> Result<Vec<Job>, QueueError> {
        self.queue.list_dead(queue_name, page).await
    }

    pub async fn requeue_dead(&self, id: JobId) -> Result<(), QueueError> {
        self.queue.requeue_dead(id).await?;
        info!(job_id = %id, "requeued dead job");
        Ok(())
    }

    /// Spawn the worker pool, the scheduler and the lease reaper on the current
    /// Tokio runtime.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let pool = WorkerPool::start(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.retry.clone(),
            self.config.worker_options(),
        )?;

        let scheduler_shutdown = CancellationToken::new();
        let scheduler_task = tokio::spawn(
            Arc::clone(&self.scheduler).run(scheduler_shutdown.clone()),
        );

        let reaper_shutdown = CancellationToken::new();
        let reaper = LeaseReaper::new(Arc::clone(&self.queue), self.config.reap_interval());
        let reaper_task = tokio::spawn(reaper.run(reaper_shutdown.clone()));

        info!(
            handlers = ?self.registry.handler_names().collect::<Vec<_>>(),
            workers = pool.worker_count(),
            "engine started"
        );
        self.running = Some(Running {
            pool,
            scheduler_shutdown,
            scheduler_task,
            reaper_shutdown,
            reaper_task,
        });
        Ok(())
    }

    /// Stop producing recurring jobs, drain the worker pool, then stop the reaper.
    /// A no-op when the engine is not running.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let Some(running) = self.running.take() else {
            return ShutdownReport { forced_workers: 0 };
        };

        running.scheduler_shutdown.cancel();
        if let Err(e) = running.scheduler_task.await {
            error!(error = %e, "scheduler task ended abnormally");
        }

        let report = running.pool.shutdown().await;

        running.reaper_shutdown.cancel();
        if let Err(e) = running.reaper_task.await {
            error!(error = %e, "lease reaper task ended abnormally");
        }

        info!(forced_workers = report.forced_workers, "engine stopped");
        report
    }
}
