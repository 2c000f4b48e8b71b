#![doc = include_str!("../README.md")]

pub mod config;
pub mod engine;
pub mod error;
pub mod job_handle;
pub mod lease;
pub mod memory_queue;
pub mod queue;
pub mod redis_queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod worker;

/// Backend conformance checks shared by the queue implementations' tests.
#[cfg(test)]
mod queue_spec;

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::{
        config::{BackendConfig, EngineConfig},
        engine::Engine,
        error::{EngineError, JobError, QueueError},
        memory_queue::MemoryQueue,
        queue::Queue,
        redis_queue::{RedisQueue, RedisQueueConfig},
        registry::{JobContext, JobHandler, JobRegistry},
        retry::RetryPolicy,
        types::{EnqueueOptions, Job, JobId, JobStatus, Page},
        worker::ShutdownReport,
    };
    pub use tokio_util::sync::CancellationToken;
}
