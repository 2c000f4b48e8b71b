use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use aide_de_camp::core::{new_xid, DateTime};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::{
    error::QueueError,
    queue::{Queue, DEFAULT_COMPLETED_RETENTION},
    types::{add_duration, Job, JobId, JobStatus, NewJob, Page},
};

/// Queue backend that keeps every job in process memory.
///
/// A single mutex guards all transitions, so claims are atomic.
/// Nothing survives a restart, so this backend fits tests and single-process
/// deployments that can afford to lose queued work.
///
/// Done jobs are dropped once they are older than the completed-job retention.
/// Dead jobs stay until an operator requeues them.
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    completed_retention: Option<Duration>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_completed_retention(Some(DEFAULT_COMPLETED_RETENTION))
    }

    /// `None` keeps done jobs for the lifetime of the queue.
    pub fn with_completed_retention(completed_retention: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            completed_retention,
        }
    }
}

struct StoredJob {
    job: Job,
    /// Insertion order, breaks ties between jobs that became ready at the same instant.
    seq: u64,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    ready: HashMap<String, BTreeMap<(DateTime, u64), JobId>>,
    leased: BTreeMap<(DateTime, u64), JobId>,
    dead: HashMap<String, Vec<JobId>>,
    /// Done jobs by completion time.
    finished: BTreeMap<(DateTime, u64), JobId>,
    idempotency: HashMap<String, JobId>,
    next_seq: u64,
}

impl MemoryState {
    fn key_is_taken(&self, key: &str) -> bool {
        self.idempotency
            .get(key)
            .and_then(|id| self.jobs.get(id))
            .map_or(false, |stored| stored.job.status.holds_idempotency_key())
    }

    fn enqueue(&mut self, mut new_job: NewJob, now: DateTime) -> Result<JobId, QueueError> {
        new_job.idempotency_key = new_job.idempotency_key.filter(|key| !key.is_empty());
        if let Some(key) = &new_job.idempotency_key {
            if self.key_is_taken(key) {
                return Err(QueueError::DuplicateIdempotencyKey(key.clone()));
            }
        }

        let id = new_xid();
        let seq = self.next_seq;
        self.next_seq += 1;

        let job = new_job.into_job(id, now);
        if let Some(key) = &job.idempotency_key {
            self.idempotency.insert(key.clone(), id);
        }
        self.ready
            .entry(job.queue_name.clone())
            .or_default()
            .insert((job.not_before, seq), id);
        self.jobs.insert(id, StoredJob { job, seq });

        Ok(id)
    }

    fn claim(
        &mut self,
        queue_names: &[String],
        lease_duration: Duration,
        worker_id: &str,
        now: DateTime,
    ) -> Option<Job> {
        let (key, id) = queue_names.iter().find_map(|queue| {
            let index = self.ready.get_mut(queue)?;
            let (&key, &id) = index.first_key_value()?;
            if key.0 > now {
                return None;
            }
            index.remove(&key);
            Some((key, id))
        })?;

        let stored = self.jobs.get_mut(&id)?;
        debug_assert_eq!(key.1, stored.seq);

        let expires_at = add_duration(now, lease_duration);
        stored.job.status = JobStatus::Leased;
        stored.job.lease_owner = Some(worker_id.to_string());
        stored.job.lease_expires_at = Some(expires_at);
        stored.job.updated_at = now;
        self.leased.insert((expires_at, stored.seq), id);

        Some(stored.job.clone())
    }

    /// Take a job out of the lease index on its way to `next`. `None` when the job
    /// cannot make that transition or `owner` does not hold its lease.
    /// The reaper passes no owner.
    fn unlease(
        &mut self,
        id: JobId,
        owner: Option<&str>,
        next: JobStatus,
    ) -> Option<&mut StoredJob> {
        let stored = self.jobs.get_mut(&id)?;
        if !stored.job.status.can_transition_to(next) {
            return None;
        }
        if owner.is_some_and(|owner| stored.job.lease_owner.as_deref() != Some(owner)) {
            return None;
        }
        if let Some(expires_at) = stored.job.lease_expires_at {
            self.leased.remove(&(expires_at, stored.seq));
        }
        stored.job.clear_lease();
        Some(stored)
    }

    fn release_key(&mut self, job: &Job) {
        if let Some(key) = &job.idempotency_key {
            if self.idempotency.get(key) == Some(&job.id) {
                self.idempotency.remove(key);
            }
        }
    }

    fn make_ready(&mut self, id: JobId, not_before: DateTime, now: DateTime) {
        if let Some(stored) = self.jobs.get_mut(&id) {
            stored.job.status = JobStatus::Ready;
            stored.job.not_before = not_before;
            stored.job.updated_at = now;
            self.ready
                .entry(stored.job.queue_name.clone())
                .or_default()
                .insert((not_before, stored.seq), id);
        }
    }

    fn make_dead(&mut self, id: JobId, now: DateTime) {
        let Some(stored) = self.jobs.get_mut(&id) else {
            return;
        };
        stored.job.status = JobStatus::Dead;
        stored.job.updated_at = now;
        let job = stored.job.clone();
        self.dead.entry(job.queue_name.clone()).or_default().push(id);
        self.release_key(&job);
    }

    fn current_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        self.jobs
            .get(&id)
            .map(|stored| stored.job.status)
            .ok_or(QueueError::JobNotFound(id))
    }

    fn ack(&mut self, id: JobId, owner: &str, now: DateTime) {
        let Some(stored) = self.unlease(id, Some(owner), JobStatus::Done) else {
            return;
        };
        stored.job.status = JobStatus::Done;
        stored.job.updated_at = now;
        let seq = stored.seq;
        let job = stored.job.clone();
        self.finished.insert((now, seq), id);
        self.release_key(&job);
    }

    /// Drop done jobs that finished at or before `cutoff`.
    fn evict_finished(&mut self, cutoff: DateTime) -> usize {
        let mut evicted = 0;
        while let Some(entry) = self.finished.first_entry() {
            if entry.key().0 > cutoff {
                break;
            }
            let id = entry.remove();
            if let Some(stored) = self.jobs.remove(&id) {
                self.release_key(&stored.job);
                evicted += 1;
            }
        }
        evicted
    }

    fn fail(
        &mut self,
        id: JobId,
        owner: &str,
        error: &str,
        retry_after: Option<Duration>,
        now: DateTime,
    ) -> Result<JobStatus, QueueError> {
        let next = if retry_after.is_some() {
            JobStatus::Ready
        } else {
            JobStatus::Dead
        };
        let Some(stored) = self.unlease(id, Some(owner), next) else {
            return self.current_status(id);
        };
        stored.job.attempt += 1;
        stored.job.last_error = Some(error.to_string());

        match retry_after {
            Some(delay) if stored.job.attempt < stored.job.max_attempts => {
                self.make_ready(id, add_duration(now, delay), now);
                Ok(JobStatus::Ready)
            }
            _ => {
                self.make_dead(id, now);
                Ok(JobStatus::Dead)
            }
        }
    }

    fn release(&mut self, id: JobId, owner: &str, now: DateTime) -> Result<JobStatus, QueueError> {
        let Some(stored) = self.unlease(id, Some(owner), JobStatus::Ready) else {
            return self.current_status(id);
        };
        let not_before = stored.job.not_before;
        self.make_ready(id, not_before, now);
        Ok(JobStatus::Ready)
    }

    fn reap(&mut self, now: DateTime) -> usize {
        let expired: Vec<JobId> = self
            .leased
            .range(..(now, 0))
            .map(|(_, id)| *id)
            .collect();

        for id in &expired {
            if let Some(stored) = self.unlease(*id, None, JobStatus::Ready) {
                let not_before = stored.job.not_before;
                self.make_ready(*id, not_before, now);
            }
        }
        expired.len()
    }

    fn list_dead(&self, queue_name: &str, page: Page) -> Vec<Job> {
        self.dead
            .get(queue_name)
            .map(|ids| {
                ids.iter()
                    .skip(page.offset)
                    .take(page.limit)
                    .filter_map(|id| self.jobs.get(id))
                    .map(|stored| stored.job.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn requeue_dead(&mut self, id: JobId, now: DateTime) -> Result<(), QueueError> {
        let job = match self.jobs.get(&id) {
            Some(stored) if stored.job.status == JobStatus::Dead => stored.job.clone(),
            Some(_) => return Err(QueueError::NotDead(id)),
            None => return Err(QueueError::JobNotFound(id)),
        };

        if let Some(key) = &job.idempotency_key {
            if self.key_is_taken(key) {
                return Err(QueueError::DuplicateIdempotencyKey(key.clone()));
            }
            self.idempotency.insert(key.clone(), id);
        }
        if let Some(ids) = self.dead.get_mut(&job.queue_name) {
            ids.retain(|dead_id| *dead_id != id);
        }
        if let Some(stored) = self.jobs.get_mut(&id) {
            stored.job.attempt = 0;
        }
        self.make_ready(id, now, now);
        Ok(())
    }
}

fn subtract_duration(at: DateTime, duration: Duration) -> DateTime {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::MIN_UTC)
}

#[async_trait]
impl Queue for MemoryQueue {
    #[instrument(skip_all, err, fields(queue = %job.queue_name, handler = %job.handler_name, payload_size))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        tracing::Span::current().record("payload_size", job.payload.len());
        let mut state = self.state.lock().await;
        state.enqueue(job, Utc::now())
    }

    #[instrument(skip_all, err, fields(worker_id = %worker_id))]
    async fn claim_with_instant(
        &self,
        queue_names: &[String],
        lease_duration: Duration,
        worker_id: &str,
        now: DateTime,
    ) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.claim(queue_names, lease_duration, worker_id, now))
    }

    #[instrument(skip(self), err)]
    async fn ack(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.ack(id, worker_id, now);
        if let Some(retention) = self.completed_retention {
            state.evict_finished(subtract_duration(now, retention));
        }
        Ok(())
    }

    #[instrument(skip(self, error), err)]
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<JobStatus, QueueError> {
        let mut state = self.state.lock().await;
        state.fail(id, worker_id, error, Some(retry_after), Utc::now())
    }

    #[instrument(skip(self, error), err)]
    async fn dead_queue(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<JobStatus, QueueError> {
        let mut state = self.state.lock().await;
        state.fail(id, worker_id, error, None, Utc::now())
    }

    #[instrument(skip(self), err)]
    async fn release(&self, id: JobId, worker_id: &str) -> Result<JobStatus, QueueError> {
        let mut state = self.state.lock().await;
        state.release(id, worker_id, Utc::now())
    }

    #[instrument(skip(self), err)]
    async fn reap_expired_leases(&self, now: DateTime) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(retention) = self.completed_retention {
            let evicted = state.evict_finished(subtract_duration(now, retention));
            if evicted > 0 {
                tracing::debug!(evicted, "dropped expired done jobs");
            }
        }
        Ok(state.reap(now))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).map(|stored| stored.job.clone()))
    }

    #[instrument(skip(self), err)]
    async fn list_dead(&self, queue_name: &str, page: Page) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.list_dead(queue_name, page))
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.requeue_dead(id, Utc::now())
    }
}
