use std::{path::Path, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    error::{ConfigError, QueueError},
    memory_queue::MemoryQueue,
    queue::{Queue, DEFAULT_COMPLETED_RETENTION},
    redis_queue::{RedisQueue, RedisQueueConfig, DEFAULT_KEY_PREFIX},
    retry::{self, RetryPolicy},
    worker::WorkerPoolOptions,
};

/// Process-level engine settings, usually read from a TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of the worker ids this process leases jobs under.
    pub name: String,
    pub worker_count: usize,
    pub queues: Vec<String>,
    pub lease_duration_secs: u64,
    pub execution_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub drain_timeout_secs: u64,
    pub max_backend_backoff_secs: u64,
    pub tick_interval_ms: u64,
    pub reap_interval_secs: u64,
    /// How long done jobs stay readable. `0` keeps them forever.
    pub completed_retention_secs: u64,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            worker_count: 4,
            queues: vec!["default".to_string()],
            lease_duration_secs: 30,
            execution_timeout_secs: 25,
            poll_interval_ms: 500,
            drain_timeout_secs: 10,
            max_backend_backoff_secs: 30,
            tick_interval_ms: 1000,
            reap_interval_secs: 5,
            completed_retention_secs: DEFAULT_COMPLETED_RETENTION.as_secs(),
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub jitter_ratio: f64,
    pub default_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: retry::DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_secs: retry::DEFAULT_MAX_DELAY.as_secs(),
            jitter_ratio: retry::DEFAULT_JITTER_RATIO,
            default_max_attempts: retry::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Which queue backend to run against. Nothing outside this type branches on it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl BackendConfig {
    pub fn connect(
        &self,
        completed_retention: Option<Duration>,
    ) -> Result<Arc<dyn Queue>, QueueError> {
        match self {
            BackendConfig::Memory => Ok(Arc::new(MemoryQueue::with_completed_retention(
                completed_retention,
            ))),
            BackendConfig::Redis { url, key_prefix } => {
                let queue = RedisQueue::new(RedisQueueConfig {
                    url: url.clone(),
                    key_prefix: key_prefix.clone(),
                    completed_retention,
                })?;
                Ok(Arc::new(queue))
            }
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker_options().validate()?;

        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be non-zero".into()));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::Invalid("reap_interval_secs must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_ratio must be within 0..=1, got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.retry.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.default_max_attempts must be at least 1".into(),
            ));
        }
        if let BackendConfig::Redis { url, key_prefix, .. } = &self.backend {
            if url.trim().is_empty() {
                return Err(ConfigError::Invalid("backend.url must be set for redis".into()));
            }
            if key_prefix.trim().is_empty() {
                return Err(ConfigError::Invalid("backend.key_prefix must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn worker_options(&self) -> WorkerPoolOptions {
        WorkerPoolOptions {
            worker_count: self.worker_count,
            queues: self.queues.clone(),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            max_backend_backoff: Duration::from_secs(self.max_backend_backoff_secs),
            name: self.name.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            jitter_ratio: self.retry.jitter_ratio,
            default_max_attempts: self.retry.default_max_attempts,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn completed_retention(&self) -> Option<Duration> {
        let secs = self.completed_retention_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Open the configured backend with this config's completed-job retention.
    pub fn connect(&self) -> Result<Arc<dyn Queue>, QueueError> {
        self.backend.connect(self.completed_retention())
    }
}
