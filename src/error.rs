use std::time::Duration;

use thiserror::Error;

use crate::types::JobId;

/// Outcome of a handler invocation that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Retryable failure. The job goes back to the queue with backoff.
    #[error("{0}")]
    Transient(String),
    /// The handler declared the job unrecoverable. It goes to the dead-letter queue.
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("no handler registered for {0:?}")]
    HandlerNotRegistered(String),
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler panicked")]
    Panicked,
    #[error("handler cancelled during shutdown")]
    Cancelled,
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Transient(_) | JobError::Timeout(_) | JobError::Panicked => true,
            JobError::Permanent(_) | JobError::HandlerNotRegistered(_) | JobError::Cancelled => {
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("an active job already holds idempotency key {0:?}")]
    DuplicateIdempotencyKey(String),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {0} is not in the dead-letter queue")]
    NotDead(JobId),
    #[error("stored job is unreadable: {0}")]
    Corrupt(String),
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl QueueError {
    /// Errors a caller can sensibly retry later without changing its request.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, QueueError::BackendUnavailable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::BackendUnavailable(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler named {0:?} is already registered")]
    DuplicateHandler(String),
    #[error("handler names must not be empty")]
    EmptyName,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("a recurring definition named {0:?} is already registered")]
    DuplicateDefinition(String),
    #[error("recurring definition {0:?} must have a non-zero interval")]
    ZeroInterval(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read engine config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid engine config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("engine is already running")]
    AlreadyStarted,
}
