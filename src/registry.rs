use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc};

use aide_de_camp::core::Bytes;
use async_trait::async_trait;
use bincode::Decode;

use crate::{
    error::{JobError, RegistryError},
    types::{Job, JobId},
};

/// What a handler gets to see of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub queue_name: String,
    pub handler_name: String,
    /// Failed attempts before this one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: Bytes,
}

impl From<&Job> for JobContext {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue_name: job.queue_name.clone(),
            handler_name: job.handler_name.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            payload: job.payload.clone(),
        }
    }
}

/// Callable resolved by name when a worker runs a job.
///
/// Jobs are delivered at-least-once, so implementations must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.f)(ctx).await
    }
}

struct DecodedHandler<P, F> {
    f: F,
    bincode_config: bincode::config::Configuration,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for DecodedHandler<P, F>
where
    P: Decode + Send + 'static,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        let (payload, _): (P, usize) =
            bincode::decode_from_slice(&ctx.payload, self.bincode_config)
                .map_err(|err| JobError::permanent(format!("undecodable payload: {err:?}")))?;
        (self.f)(payload, ctx).await
    }
}

/// Maps handler names to the callables workers invoke.
///
/// Built once at startup and then shared read-only behind an `Arc`, so lookups from
/// many workers need no locking.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<H>(
        &mut self,
        handler_name: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError>
    where
        H: JobHandler,
    {
        self.insert(handler_name.into(), Arc::new(handler))
    }

    /// Register an async closure over the raw job context.
    pub fn register_fn<F, Fut>(
        &mut self,
        handler_name: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.insert(handler_name.into(), Arc::new(FnHandler { f }))
    }

    /// Register an async closure over a bincode-encoded payload.
    ///
    /// A payload that fails to decode is a permanent failure: retrying cannot fix it.
    pub fn register_decoded<P, F, Fut>(
        &mut self,
        handler_name: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        P: Decode + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.insert(
            handler_name.into(),
            Arc::new(DecodedHandler {
                f,
                bincode_config: bincode::config::standard(),
                _payload: PhantomData,
            }),
        )
    }

    fn insert(
        &mut self,
        handler_name: String,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        if handler_name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&handler_name) {
            return Err(RegistryError::DuplicateHandler(handler_name));
        }
        tracing::debug!(handler = %handler_name, "registered job handler");
        self.handlers.insert(handler_name, handler);
        Ok(())
    }

    pub fn get(&self, handler_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_name).cloned()
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
