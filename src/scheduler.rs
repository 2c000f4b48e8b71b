use std::{sync::Arc, time::Duration};

use aide_de_camp::core::{Bytes, DateTime};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{QueueError, SchedulerError},
    queue::Queue,
    retry::DEFAULT_MAX_ATTEMPTS,
    types::{JobId, NewJob},
};

/// A job enqueued on a fixed cadence for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct RecurringDefinition {
    pub name: String,
    pub queue_name: String,
    pub handler_name: String,
    pub payload_template: Bytes,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RecurringDefinition {
    pub fn new(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        handler_name: impl Into<String>,
        payload_template: impl Into<Bytes>,
        interval_seconds: u64,
    ) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            handler_name: handler_name.into(),
            payload_template: payload_template.into(),
            interval: Duration::from_secs(interval_seconds),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Key that identifies one scheduled run across processes.
    fn run_key(&self, run_at: DateTime) -> String {
        format!("recurring:{}:{}", self.name, run_at.timestamp_millis())
    }
}

struct RecurringEntry {
    definition: RecurringDefinition,
    next_run_at: DateTime,
}

/// First boundary strictly after `now`, stepping from `scheduled` by whole intervals.
fn next_boundary(scheduled: DateTime, interval: Duration, now: DateTime) -> DateTime {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let behind_ms = (now - scheduled).num_milliseconds().max(0);
    let periods = behind_ms / interval_ms + 1;
    chrono::Duration::try_milliseconds(interval_ms.saturating_mul(periods))
        .and_then(|step| scheduled.checked_add_signed(step))
        .unwrap_or(DateTime::MAX_UTC)
}

/// Latest whole multiple of `interval` since the Unix epoch at or before `now`.
///
/// Processes registering the same definition at different instants agree on it,
/// and so on every later run key.
fn epoch_boundary(now: DateTime, interval: Duration) -> DateTime {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let now_ms = now.timestamp_millis();
    DateTime::from_timestamp_millis(now_ms - now_ms.rem_euclid(interval_ms)).unwrap_or(now)
}

/// Producer that turns recurring definitions into jobs.
///
/// Runs as one task. Missed runs are never backfilled: a definition that fell
/// several intervals behind yields a single job and jumps to its next future
/// boundary, keeping the original phase.
pub struct Scheduler {
    queue: Arc<dyn Queue>,
    tick_interval: Duration,
    entries: Mutex<Vec<RecurringEntry>>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn Queue>, tick_interval: Duration) -> Self {
        Self {
            queue,
            tick_interval,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a definition whose first run is the current epoch-aligned interval
    /// boundary. That boundary is never in the future, so the run is due on the next tick.
    pub async fn register_recurring(
        &self,
        definition: RecurringDefinition,
    ) -> Result<(), SchedulerError> {
        let first_run_at = epoch_boundary(Utc::now(), definition.interval);
        self.register_recurring_with_instant(definition, first_run_at)
            .await
    }

    pub async fn register_recurring_with_instant(
        &self,
        definition: RecurringDefinition,
        first_run_at: DateTime,
    ) -> Result<(), SchedulerError> {
        if definition.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(definition.name));
        }
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.definition.name == definition.name) {
            return Err(SchedulerError::DuplicateDefinition(definition.name));
        }
        info!(
            name = %definition.name,
            queue = %definition.queue_name,
            handler = %definition.handler_name,
            interval = ?definition.interval,
            "registered recurring job"
        );
        entries.push(RecurringEntry {
            definition,
            next_run_at: first_run_at,
        });
        Ok(())
    }

    pub async fn next_run_at(&self, name: &str) -> Option<DateTime> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|e| e.definition.name == name)
            .map(|e| e.next_run_at)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn tick(&self) -> Vec<JobId> {
        self.tick_with_instant(Utc::now()).await
    }

    /// Enqueue one job for every definition due at `now`. Returns the new job ids.
    pub async fn tick_with_instant(&self, now: DateTime) -> Vec<JobId> {
        let mut entries = self.entries.lock().await;
        let mut enqueued = Vec::new();

        for entry in entries.iter_mut().filter(|e| e.next_run_at <= now) {
            let definition = &entry.definition;
            let job = NewJob {
                queue_name: definition.queue_name.clone(),
                handler_name: definition.handler_name.clone(),
                payload: definition.payload_template.clone(),
                max_attempts: definition.max_attempts,
                not_before: now,
                idempotency_key: Some(definition.run_key(entry.next_run_at)),
            };

            match self.queue.enqueue(job).await {
                Ok(id) => {
                    debug!(name = %definition.name, job_id = %id, "enqueued recurring job");
                    enqueued.push(id);
                }
                Err(QueueError::DuplicateIdempotencyKey(key)) => {
                    debug!(name = %definition.name, %key, "recurring run already enqueued");
                }
                Err(e) => {
                    warn!(name = %definition.name, error = %e, "failed to enqueue recurring job");
                    continue;
                }
            }

            let next_run_at = next_boundary(entry.next_run_at, definition.interval, now);
            entry.next_run_at = next_run_at;
        }

        enqueued
    }

    /// Tick until cancelled. Cancellation is observed between ticks, never during one.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick_interval = ?self.tick_interval, "scheduler started");
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        info!("scheduler stopped");
    }
}
