use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use aide_de_camp::core::{new_xid, Bytes, DateTime, Xid};
use async_trait::async_trait;
use chrono::Utc;
use redis::FromRedisValue;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::{
    error::QueueError,
    queue::{Queue, DEFAULT_COMPLETED_RETENTION},
    types::{add_duration, Job, JobId, JobStatus, NewJob, Page},
};

pub const DEFAULT_KEY_PREFIX: &str = "aide-de-camp";

type Row = HashMap<String, Vec<u8>>;

const ENQUEUE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 1
end
if ARGV[8] ~= "" then
  if not redis.call("SET", KEYS[3], ARGV[1], "NX") then
    return 0
  end
end
redis.call("HSET", KEYS[1],
  "id", ARGV[1], "queue", ARGV[2], "handler", ARGV[3], "payload", ARGV[4],
  "status", "ready", "attempt", 0, "max_attempts", ARGV[5], "not_before", ARGV[6],
  "lease_owner", "", "lease_expires_at", "", "idempotency_key", ARGV[8],
  "last_error", "", "created_at", ARGV[7], "updated_at", ARGV[7])
redis.call("ZADD", KEYS[2], ARGV[6], ARGV[1])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
for i = 2, #KEYS do
  while true do
    local ids = redis.call("ZRANGEBYSCORE", KEYS[i], "-inf", ARGV[1], "LIMIT", 0, 1)
    if #ids == 0 then
      break
    end
    local id = ids[1]
    local job = ARGV[4] .. id
    redis.call("ZREM", KEYS[i], id)
    if redis.call("EXISTS", job) == 1 then
      redis.call("ZADD", KEYS[1], ARGV[2], id)
      redis.call("HSET", job, "status", "leased", "lease_owner", ARGV[3],
        "lease_expires_at", ARGV[2], "updated_at", ARGV[1])
      return redis.call("HGETALL", job)
    end
  end
end
return false
"#;

const ACK_SCRIPT: &str = r#"
local state = redis.call("HMGET", KEYS[1], "status", "lease_owner")
if state[1] ~= "leased" or state[2] ~= ARGV[5] then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[1], "status", "done", "lease_owner", "", "lease_expires_at", "",
  "updated_at", ARGV[2])
local key = redis.call("HGET", KEYS[1], "idempotency_key")
if key and key ~= "" and redis.call("GET", ARGV[3] .. key) == ARGV[1] then
  redis.call("DEL", ARGV[3] .. key)
end
if tonumber(ARGV[4]) > 0 then
  redis.call("EXPIRE", KEYS[1], ARGV[4])
end
return 1
"#;

const FAIL_SCRIPT: &str = r#"
local state = redis.call("HMGET", KEYS[1], "status", "lease_owner")
if not state[1] then
  return "missing"
end
if state[1] ~= "leased" or state[2] ~= ARGV[9] then
  return state[1]
end
redis.call("ZREM", KEYS[2], ARGV[1])
local attempt = redis.call("HINCRBY", KEYS[1], "attempt", 1)
local max_attempts = tonumber(redis.call("HGET", KEYS[1], "max_attempts"))
local queue = redis.call("HGET", KEYS[1], "queue")
redis.call("HSET", KEYS[1], "last_error", ARGV[3], "lease_owner", "", "lease_expires_at", "",
  "updated_at", ARGV[2])
if ARGV[5] == "0" and attempt < max_attempts then
  redis.call("HSET", KEYS[1], "status", "ready", "not_before", ARGV[4])
  redis.call("ZADD", ARGV[6] .. queue, ARGV[4], ARGV[1])
  return "ready"
end
redis.call("HSET", KEYS[1], "status", "dead")
redis.call("ZADD", ARGV[7] .. queue, ARGV[2], ARGV[1])
local key = redis.call("HGET", KEYS[1], "idempotency_key")
if key and key ~= "" and redis.call("GET", ARGV[8] .. key) == ARGV[1] then
  redis.call("DEL", ARGV[8] .. key)
end
return "dead"
"#;

const RELEASE_SCRIPT: &str = r#"
local state = redis.call("HMGET", KEYS[1], "status", "lease_owner")
if not state[1] then
  return "missing"
end
if state[1] ~= "leased" or state[2] ~= ARGV[4] then
  return state[1]
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[1], "status", "ready", "lease_owner", "", "lease_expires_at", "",
  "updated_at", ARGV[2])
local queue = redis.call("HGET", KEYS[1], "queue")
local not_before = redis.call("HGET", KEYS[1], "not_before")
redis.call("ZADD", ARGV[3] .. queue, not_before, ARGV[1])
return "ready"
"#;

const REAP_SCRIPT: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
local count = 0
for _, id in ipairs(ids) do
  redis.call("ZREM", KEYS[1], id)
  local job = ARGV[2] .. id
  if redis.call("HGET", job, "status") == "leased" then
    local queue = redis.call("HGET", job, "queue")
    local not_before = redis.call("HGET", job, "not_before")
    redis.call("HSET", job, "status", "ready", "lease_owner", "", "lease_expires_at", "",
      "updated_at", ARGV[1])
    redis.call("ZADD", ARGV[3] .. queue, not_before, id)
    count = count + 1
  end
end
return count
"#;

const LIST_DEAD_SCRIPT: &str = r#"
local ids = redis.call("ZRANGE", KEYS[1], ARGV[1], ARGV[2])
local rows = {}
for _, id in ipairs(ids) do
  local row = redis.call("HGETALL", ARGV[3] .. id)
  if #row > 0 then
    table.insert(rows, row)
  end
end
return rows
"#;

const REQUEUE_DEAD_SCRIPT: &str = r#"
local status = redis.call("HGET", KEYS[1], "status")
if not status then
  return "missing"
end
if status ~= "dead" then
  return "not_dead"
end
local key = redis.call("HGET", KEYS[1], "idempotency_key")
if key and key ~= "" then
  if not redis.call("SET", ARGV[5] .. key, ARGV[1], "NX") then
    return "duplicate"
  end
end
local queue = redis.call("HGET", KEYS[1], "queue")
redis.call("ZREM", ARGV[4] .. queue, ARGV[1])
redis.call("HSET", KEYS[1], "status", "ready", "attempt", 0, "not_before", ARGV[2],
  "updated_at", ARGV[2])
redis.call("ZADD", ARGV[3] .. queue, ARGV[2], ARGV[1])
return "ready"
"#;

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub url: String,
    pub key_prefix: String,
    /// How long done job hashes stay readable. `None` keeps them forever.
    pub completed_retention: Option<Duration>,
}

impl RedisQueueConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            completed_retention: Some(DEFAULT_COMPLETED_RETENTION),
        }
    }
}

/// Key layout under one prefix.
///
/// Jobs live in `{prefix}:job:{id}` hashes. `{prefix}:ready:{queue}` is a sorted set
/// scored by `not_before`, `{prefix}:leased` is scored by lease expiry and
/// `{prefix}:dead:{queue}` by the time the job died. `{prefix}:idem:{key}` holds the
/// id of the active job owning an idempotency key.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn ready_prefix(&self) -> String {
        format!("{}:ready:", self.prefix)
    }

    fn dead_prefix(&self) -> String {
        format!("{}:dead:", self.prefix)
    }

    fn idempotency_prefix(&self) -> String {
        format!("{}:idem:", self.prefix)
    }

    fn job(&self, id: JobId) -> String {
        format!("{}{id}", self.job_prefix())
    }

    fn ready(&self, queue_name: &str) -> String {
        format!("{}{queue_name}", self.ready_prefix())
    }

    fn dead(&self, queue_name: &str) -> String {
        format!("{}{queue_name}", self.dead_prefix())
    }

    fn idempotency(&self, key: &str) -> String {
        format!("{}{key}", self.idempotency_prefix())
    }

    fn leased(&self) -> String {
        format!("{}:leased", self.prefix)
    }
}

/// Queue backend on Redis (or Valkey), shared by any number of worker processes.
///
/// Every state transition runs as one Lua script, so claims stay exclusive across
/// processes. Timestamps are stored as Unix milliseconds supplied by the caller.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    keys: Keys,
    completed_retention: Option<Duration>,
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl RedisQueue {
    /// Validates the url. The connection is opened lazily on first use.
    pub fn new(config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            QueueError::BackendUnavailable(format!("invalid redis url {}: {e}", config.url))
        })?;
        Ok(Self {
            client,
            keys: Keys {
                prefix: config.key_prefix,
            },
            completed_retention: config.completed_retention,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    async fn run_command<T, F>(&self, operation: &'static str, build: F) -> Result<T, QueueError>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_err = None;
        for attempt in 0..2 {
            let mut conn_guard = self.connection.lock().await;
            self.ensure_connection(&mut conn_guard).await?;
            let Some(conn) = conn_guard.as_mut() else {
                return Err(QueueError::BackendUnavailable(
                    "redis connection unavailable".into(),
                ));
            };
            let result: redis::RedisResult<T> = build().query_async(conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, "redis command succeeded after reconnect");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "redis command failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.map(QueueError::from).unwrap_or_else(|| {
            QueueError::BackendUnavailable(format!("redis command {operation} failed"))
        }))
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> Result<(), QueueError> {
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(self.client.get_multiplexed_async_connection().await?);
        tracing::debug!(key_prefix = %self.keys.prefix, "redis queue backend connected");
        Ok(())
    }

    async fn finish(
        &self,
        operation: &'static str,
        id: JobId,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime>,
    ) -> Result<JobStatus, QueueError> {
        let now = Utc::now();
        let retry_at_ms = retry_at.unwrap_or(now).timestamp_millis();
        let force_dead = if retry_at.is_some() { "0" } else { "1" };
        let outcome = self
            .run_command::<String, _>(operation, || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(FAIL_SCRIPT)
                    .arg(2)
                    .arg(self.keys.job(id))
                    .arg(self.keys.leased())
                    .arg(id.to_string())
                    .arg(now.timestamp_millis())
                    .arg(error)
                    .arg(retry_at_ms)
                    .arg(force_dead)
                    .arg(self.keys.ready_prefix())
                    .arg(self.keys.dead_prefix())
                    .arg(self.keys.idempotency_prefix())
                    .arg(worker_id);
                cmd
            })
            .await?;
        status_outcome(id, &outcome)
    }
}

fn status_outcome(id: JobId, outcome: &str) -> Result<JobStatus, QueueError> {
    match outcome {
        "missing" => Err(QueueError::JobNotFound(id)),
        other => other.parse().map_err(QueueError::Corrupt),
    }
}

fn field<'a>(row: &'a Row, name: &str) -> Result<&'a [u8], QueueError> {
    row.get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| QueueError::Corrupt(format!("job row is missing {name:?}")))
}

fn text(row: &Row, name: &str) -> Result<String, QueueError> {
    String::from_utf8(field(row, name)?.to_vec())
        .map_err(|e| QueueError::Corrupt(format!("job field {name:?} is not utf-8: {e}")))
}

fn optional_text(row: &Row, name: &str) -> Result<Option<String>, QueueError> {
    let value = match row.get(name) {
        Some(_) => text(row, name)?,
        None => return Ok(None),
    };
    Ok(Some(value).filter(|v| !v.is_empty()))
}

fn number<T: FromStr>(row: &Row, name: &str) -> Result<T, QueueError> {
    text(row, name)?
        .parse()
        .map_err(|_| QueueError::Corrupt(format!("job field {name:?} is not a number")))
}

fn millis_to_datetime(name: &str, ms: i64) -> Result<DateTime, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Corrupt(format!("job field {name:?} is out of range")))
}

fn timestamp(row: &Row, name: &str) -> Result<DateTime, QueueError> {
    millis_to_datetime(name, number(row, name)?)
}

fn optional_timestamp(row: &Row, name: &str) -> Result<Option<DateTime>, QueueError> {
    match optional_text(row, name)? {
        Some(value) => {
            let ms = value
                .parse()
                .map_err(|_| QueueError::Corrupt(format!("job field {name:?} is not a number")))?;
            millis_to_datetime(name, ms).map(Some)
        }
        None => Ok(None),
    }
}

fn job_from_row(row: &Row) -> Result<Job, QueueError> {
    let id = Xid::from_str(&text(row, "id")?)
        .map_err(|e| QueueError::Corrupt(format!("job id is malformed: {e}")))?;
    let status = text(row, "status")?
        .parse()
        .map_err(QueueError::Corrupt)?;
    Ok(Job {
        id,
        queue_name: text(row, "queue")?,
        handler_name: text(row, "handler")?,
        payload: Bytes::copy_from_slice(field(row, "payload")?),
        status,
        attempt: number(row, "attempt")?,
        max_attempts: number(row, "max_attempts")?,
        not_before: timestamp(row, "not_before")?,
        lease_owner: optional_text(row, "lease_owner")?,
        lease_expires_at: optional_timestamp(row, "lease_expires_at")?,
        idempotency_key: optional_text(row, "idempotency_key")?,
        last_error: optional_text(row, "last_error")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

#[async_trait]
impl Queue for RedisQueue {
    #[instrument(skip_all, err, fields(queue = %job.queue_name, handler = %job.handler_name, payload_size))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        tracing::Span::current().record("payload_size", job.payload.len());
        let id = new_xid();
        let now = Utc::now().timestamp_millis();
        let key = job.idempotency_key.clone().unwrap_or_default();
        let inserted = self
            .run_command::<i64, _>("enqueue", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(ENQUEUE_SCRIPT)
                    .arg(3)
                    .arg(self.keys.job(id))
                    .arg(self.keys.ready(&job.queue_name))
                    .arg(self.keys.idempotency(&key))
                    .arg(id.to_string())
                    .arg(&job.queue_name)
                    .arg(&job.handler_name)
                    .arg(&job.payload[..])
                    .arg(job.max_attempts)
                    .arg(job.not_before.timestamp_millis())
                    .arg(now)
                    .arg(&key);
                cmd
            })
            .await?;
        if inserted == 0 {
            return Err(QueueError::DuplicateIdempotencyKey(key));
        }
        Ok(id)
    }

    #[instrument(skip_all, err, fields(worker_id = %worker_id))]
    async fn claim_with_instant(
        &self,
        queue_names: &[String],
        lease_duration: Duration,
        worker_id: &str,
        now: DateTime,
    ) -> Result<Option<Job>, QueueError> {
        if queue_names.is_empty() {
            return Ok(None);
        }
        let expires_at = add_duration(now, lease_duration);
        let row = self
            .run_command::<Option<Row>, _>("claim", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(CLAIM_SCRIPT)
                    .arg(queue_names.len() + 1)
                    .arg(self.keys.leased());
                for queue_name in queue_names {
                    cmd.arg(self.keys.ready(queue_name));
                }
                cmd.arg(now.timestamp_millis())
                    .arg(expires_at.timestamp_millis())
                    .arg(worker_id)
                    .arg(self.keys.job_prefix());
                cmd
            })
            .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn ack(&self, id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let retention = self.completed_retention.map_or(0, |d| d.as_secs().max(1));
        self.run_command::<i64, _>("ack", || {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(ACK_SCRIPT)
                .arg(2)
                .arg(self.keys.job(id))
                .arg(self.keys.leased())
                .arg(id.to_string())
                .arg(Utc::now().timestamp_millis())
                .arg(self.keys.idempotency_prefix())
                .arg(retention)
                .arg(worker_id);
            cmd
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, error), err)]
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<JobStatus, QueueError> {
        let retry_at = add_duration(Utc::now(), retry_after);
        self.finish("fail", id, worker_id, error, Some(retry_at)).await
    }

    #[instrument(skip(self, error), err)]
    async fn dead_queue(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<JobStatus, QueueError> {
        self.finish("dead_queue", id, worker_id, error, None).await
    }

    #[instrument(skip(self), err)]
    async fn release(&self, id: JobId, worker_id: &str) -> Result<JobStatus, QueueError> {
        let outcome = self
            .run_command::<String, _>("release", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(RELEASE_SCRIPT)
                    .arg(2)
                    .arg(self.keys.job(id))
                    .arg(self.keys.leased())
                    .arg(id.to_string())
                    .arg(Utc::now().timestamp_millis())
                    .arg(self.keys.ready_prefix())
                    .arg(worker_id);
                cmd
            })
            .await?;
        status_outcome(id, &outcome)
    }

    #[instrument(skip(self), err)]
    async fn reap_expired_leases(&self, now: DateTime) -> Result<usize, QueueError> {
        self.run_command::<usize, _>("reap_expired_leases", || {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(REAP_SCRIPT)
                .arg(1)
                .arg(self.keys.leased())
                .arg(now.timestamp_millis())
                .arg(self.keys.job_prefix())
                .arg(self.keys.ready_prefix());
            cmd
        })
        .await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = self
            .run_command::<Row, _>("get", || {
                let mut cmd = redis::cmd("HGETALL");
                cmd.arg(self.keys.job(id));
                cmd
            })
            .await?;
        if row.is_empty() {
            return Ok(None);
        }
        job_from_row(&row).map(Some)
    }

    #[instrument(skip(self), err)]
    async fn list_dead(&self, queue_name: &str, page: Page) -> Result<Vec<Job>, QueueError> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        let stop = page.offset.saturating_add(page.limit) - 1;
        let rows = self
            .run_command::<Vec<Row>, _>("list_dead", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(LIST_DEAD_SCRIPT)
                    .arg(1)
                    .arg(self.keys.dead(queue_name))
                    .arg(page.offset)
                    .arg(stop)
                    .arg(self.keys.job_prefix());
                cmd
            })
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead(&self, id: JobId) -> Result<(), QueueError> {
        let outcome = self
            .run_command::<String, _>("requeue_dead", || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(REQUEUE_DEAD_SCRIPT)
                    .arg(1)
                    .arg(self.keys.job(id))
                    .arg(id.to_string())
                    .arg(Utc::now().timestamp_millis())
                    .arg(self.keys.ready_prefix())
                    .arg(self.keys.dead_prefix())
                    .arg(self.keys.idempotency_prefix());
                cmd
            })
            .await?;
        match outcome.as_str() {
            "ready" => Ok(()),
            "missing" => Err(QueueError::JobNotFound(id)),
            "not_dead" => Err(QueueError::NotDead(id)),
            "duplicate" => {
                let key = self
                    .get(id)
                    .await?
                    .and_then(|job| job.idempotency_key)
                    .unwrap_or_default();
                Err(QueueError::DuplicateIdempotencyKey(key))
            }
            other => Err(QueueError::Corrupt(format!(
                "unexpected requeue outcome {other:?}"
            ))),
        }
    }
}
