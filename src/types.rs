use std::{fmt, str::FromStr, time::Duration};

use aide_de_camp::core::{Bytes, DateTime, Xid};

/// Identifier assigned to every job at enqueue time.
pub type JobId = Xid;

/// Lifecycle state of a job.
///
/// `Ready -> Leased` on claim, `Leased -> Ready` on retry, reaping or release,
/// `Leased -> Done` on ack and `Leased -> Dead` once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Ready,
    Leased,
    Done,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::Leased => "leased",
            JobStatus::Done => "done",
            JobStatus::Dead => "dead",
        }
    }

    /// `Done` and `Dead` are terminal for the hot path. Only an operator
    /// requeue moves a job out of `Dead`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dead)
    }

    /// Whether an idempotency key held by a job in this state is still reserved.
    pub fn holds_idempotency_key(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Ready, JobStatus::Leased)
                | (JobStatus::Leased, JobStatus::Ready)
                | (JobStatus::Leased, JobStatus::Done)
                | (JobStatus::Leased, JobStatus::Dead)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(JobStatus::Ready),
            "leased" => Ok(JobStatus::Leased),
            "done" => Ok(JobStatus::Done),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of work as stored by a queue backend.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub handler_name: String,
    pub payload: Bytes,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: DateTime,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime>,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Job {
    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Everything a backend needs to insert a job. The backend assigns the id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub handler_name: String,
    pub payload: Bytes,
    pub max_attempts: u32,
    pub not_before: DateTime,
    pub idempotency_key: Option<String>,
}

impl NewJob {
    pub(crate) fn into_job(self, id: JobId, now: DateTime) -> Job {
        Job {
            id,
            queue_name: self.queue_name,
            handler_name: self.handler_name,
            payload: self.payload,
            status: JobStatus::Ready,
            attempt: 0,
            max_attempts: self.max_attempts,
            not_before: self.not_before,
            lease_owner: None,
            lease_expires_at: None,
            idempotency_key: self.idempotency_key,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-call overrides accepted by the enqueue API.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Offset/limit window over the dead-letter listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self::new(0, limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(100)
    }
}

/// `at + duration`, saturating at the latest representable instant.
pub(crate) fn add_duration(at: DateTime, duration: Duration) -> DateTime {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::MAX_UTC)
}
