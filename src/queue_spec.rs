//! Behaviour every [`Queue`] backend must share.
//!
//! Backend test modules call [`run_all`] with a factory that hands out an empty queue
//! per check.

use std::{collections::HashSet, sync::Arc, time::Duration};

use aide_de_camp::core::{Bytes, DateTime};
use chrono::Utc;

use crate::{
    error::QueueError,
    queue::Queue,
    types::{JobStatus, NewJob, Page},
};

const LEASE: Duration = Duration::from_secs(30);

pub(crate) fn new_job(queue_name: &str, not_before: DateTime) -> NewJob {
    NewJob {
        queue_name: queue_name.to_string(),
        handler_name: "noop".to_string(),
        payload: Bytes::from_static(b"payload"),
        max_attempts: 3,
        not_before,
        idempotency_key: None,
    }
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn millis(ms: i64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms)
}

pub(crate) async fn run_all<F>(factory: F)
where
    F: Fn() -> Arc<dyn Queue>,
{
    claim_leases_job(factory()).await;
    no_double_claim(factory()).await;
    delayed_job_waits_for_not_before(factory()).await;
    transient_failure_waits_for_backoff(factory()).await;
    exhausted_job_is_dead_lettered(factory()).await;
    dead_queue_skips_remaining_attempts(factory()).await;
    expired_lease_is_reaped_without_attempt(factory()).await;
    release_returns_job_without_attempt(factory()).await;
    stale_owner_cannot_settle_reclaimed_job(factory()).await;
    idempotency_key_is_exclusive_while_active(factory()).await;
    empty_idempotency_key_is_no_key(factory()).await;
    ack_is_idempotent(factory()).await;
    fifo_within_queue_and_queue_order_respected(factory()).await;
    dead_jobs_are_paged_and_requeueable(factory()).await;
}

async fn claim_leases_job(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();

    let job = queue
        .claim_with_instant(&queues(&["default"]), LEASE, "worker-a", now)
        .await
        .unwrap()
        .expect("ready job should be claimable");

    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Leased);
    assert_eq!(job.lease_owner.as_deref(), Some("worker-a"));
    assert_eq!(job.handler_name, "noop");
    assert_eq!(&job.payload[..], b"payload");
    assert_eq!(job.attempt, 0);
    let expires_at = job.lease_expires_at.unwrap();
    assert!(expires_at > now + millis(29_000));

    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Leased);

    assert!(queue
        .claim_with_instant(&queues(&["default"]), LEASE, "worker-b", now)
        .await
        .unwrap()
        .is_none());
}

async fn no_double_claim(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let mut enqueued = HashSet::new();
    for _ in 0..5 {
        enqueued.insert(queue.enqueue(new_job("default", now - millis(10))).await.unwrap());
    }

    let mut tasks = Vec::new();
    for worker in 0..20 {
        let queue = Arc::clone(&queue);
        tasks.push(tokio::spawn(async move {
            queue
                .claim(&queues(&["default"]), LEASE, &format!("worker-{worker}"))
                .await
                .unwrap()
                .map(|job| job.id)
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(id) = task.await.unwrap() {
            claimed.push(id);
        }
    }

    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 5, "every job claimed exactly once");
    assert_eq!(distinct, enqueued);
}

async fn delayed_job_waits_for_not_before(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let id = queue
        .enqueue(new_job("default", now + millis(5_000)))
        .await
        .unwrap();
    let names = queues(&["default"]);

    for offset in [0, 1_000, 4_999] {
        assert!(queue
            .claim_with_instant(&names, LEASE, "w", now + millis(offset))
            .await
            .unwrap()
            .is_none());
    }

    let job = queue
        .claim_with_instant(&names, LEASE, "w", now + millis(5_000))
        .await
        .unwrap()
        .expect("job becomes claimable at not_before");
    assert_eq!(job.id, id);
}

async fn transient_failure_waits_for_backoff(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let names = queues(&["default"]);
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();
    queue.claim_with_instant(&names, LEASE, "w", now).await.unwrap().unwrap();

    let status = queue
        .fail(id, "w", "upstream timeout", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Ready);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.last_error.as_deref(), Some("upstream timeout"));
    assert!(job.lease_owner.is_none());
    assert!(job.lease_expires_at.is_none());
    assert!(job.not_before >= now + millis(9_000));

    assert!(queue
        .claim_with_instant(&names, LEASE, "w", job.not_before - millis(1))
        .await
        .unwrap()
        .is_none());
    let again = queue
        .claim_with_instant(&names, LEASE, "w", job.not_before)
        .await
        .unwrap()
        .expect("claimable once the backoff elapsed");
    assert_eq!(again.id, id);
    assert_eq!(again.attempt, 1);
}

async fn exhausted_job_is_dead_lettered(queue: Arc<dyn Queue>) {
    let names = queues(&["default"]);
    let id = queue
        .enqueue(new_job("default", Utc::now() - millis(10)))
        .await
        .unwrap();

    let mut last_status = JobStatus::Ready;
    for round in 0..3 {
        let now = Utc::now() + millis(1_000 * round);
        let job = queue
            .claim_with_instant(&names, LEASE, "w", now)
            .await
            .unwrap()
            .expect("job claimable while attempts remain");
        assert_eq!(job.id, id);
        last_status = queue
            .fail(id, "w", &format!("boom {round}"), Duration::ZERO)
            .await
            .unwrap();
    }
    assert_eq!(last_status, JobStatus::Dead);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt, 3);
    assert_eq!(job.last_error.as_deref(), Some("boom 2"));

    assert!(queue
        .claim_with_instant(&names, LEASE, "w", Utc::now() + millis(60_000))
        .await
        .unwrap()
        .is_none());

    // A stale worker failing a dead job changes nothing.
    assert_eq!(
        queue.fail(id, "w", "late", Duration::ZERO).await.unwrap(),
        JobStatus::Dead
    );
    assert_eq!(queue.get(id).await.unwrap().unwrap().attempt, 3);
}

async fn dead_queue_skips_remaining_attempts(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();
    queue
        .claim_with_instant(&queues(&["default"]), LEASE, "w", now)
        .await
        .unwrap()
        .unwrap();

    let status = queue.dead_queue(id, "w", "malformed payload").await.unwrap();
    assert_eq!(status, JobStatus::Dead);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempt, 1);
    assert!(job.attempt <= job.max_attempts);
    assert_eq!(job.last_error.as_deref(), Some("malformed payload"));
}

async fn expired_lease_is_reaped_without_attempt(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let names = queues(&["default"]);
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();
    queue
        .claim_with_instant(&names, Duration::from_secs(1), "crashed", now)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(queue.reap_expired_leases(now).await.unwrap(), 0);
    assert_eq!(
        queue.reap_expired_leases(now + millis(2_000)).await.unwrap(),
        1
    );

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempt, 0);
    assert!(job.lease_owner.is_none());

    let reclaimed = queue
        .claim_with_instant(&names, LEASE, "healthy", now + millis(2_000))
        .await
        .unwrap()
        .expect("reaped job is claimable");
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempt, 0);
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("healthy"));
}

async fn release_returns_job_without_attempt(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();
    queue
        .claim_with_instant(&queues(&["default"]), LEASE, "w", now)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(queue.release(id, "w").await.unwrap(), JobStatus::Ready);
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempt, 0);

    // Releasing a job that is not leased is a no-op.
    assert_eq!(queue.release(id, "w").await.unwrap(), JobStatus::Ready);
}

async fn stale_owner_cannot_settle_reclaimed_job(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let names = queues(&["default"]);
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();
    queue
        .claim_with_instant(&names, Duration::from_secs(1), "w1", now)
        .await
        .unwrap()
        .unwrap();

    let later = now + millis(2_000);
    assert_eq!(queue.reap_expired_leases(later).await.unwrap(), 1);
    queue
        .claim_with_instant(&names, Duration::from_secs(3600), "w2", later)
        .await
        .unwrap()
        .expect("reaped job is claimable");

    // The first owner wakes up and reports every possible outcome.
    assert_eq!(
        queue.fail(id, "w1", "stale", Duration::ZERO).await.unwrap(),
        JobStatus::Leased
    );
    assert_eq!(queue.dead_queue(id, "w1", "stale").await.unwrap(), JobStatus::Leased);
    assert_eq!(queue.release(id, "w1").await.unwrap(), JobStatus::Leased);
    queue.ack(id, "w1").await.unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Leased);
    assert_eq!(job.lease_owner.as_deref(), Some("w2"));
    assert_eq!(job.attempt, 0);
    assert!(job.last_error.is_none());

    assert!(queue
        .claim_with_instant(&names, LEASE, "w3", later + millis(1_000))
        .await
        .unwrap()
        .is_none());

    queue.ack(id, "w2").await.unwrap();
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Done);
}

async fn idempotency_key_is_exclusive_while_active(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let names = queues(&["default"]);
    let keyed = |key: &str| NewJob {
        idempotency_key: Some(key.to_string()),
        max_attempts: 1,
        ..new_job("default", now - millis(10))
    };

    let first = queue.enqueue(keyed("invoice-42")).await.unwrap();
    assert!(matches!(
        queue.enqueue(keyed("invoice-42")).await,
        Err(QueueError::DuplicateIdempotencyKey(key)) if key == "invoice-42"
    ));

    // Still reserved while leased.
    queue.claim_with_instant(&names, LEASE, "w", now).await.unwrap().unwrap();
    assert!(matches!(
        queue.enqueue(keyed("invoice-42")).await,
        Err(QueueError::DuplicateIdempotencyKey(_))
    ));

    queue.ack(first, "w").await.unwrap();
    let second = queue.enqueue(keyed("invoice-42")).await.unwrap();
    assert_ne!(first, second);

    // Dead jobs free their key too.
    queue.claim_with_instant(&names, LEASE, "w", now).await.unwrap().unwrap();
    assert_eq!(
        queue.fail(second, "w", "nope", Duration::ZERO).await.unwrap(),
        JobStatus::Dead
    );
    queue.enqueue(keyed("invoice-42")).await.unwrap();

    // Other keys are independent.
    queue.enqueue(keyed("invoice-43")).await.unwrap();
}

async fn empty_idempotency_key_is_no_key(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let unkeyed = || NewJob {
        idempotency_key: Some(String::new()),
        ..new_job("default", now - millis(10))
    };

    let first = queue.enqueue(unkeyed()).await.unwrap();
    let second = queue.enqueue(unkeyed()).await.unwrap();
    assert_ne!(first, second);
    assert!(queue.get(first).await.unwrap().unwrap().idempotency_key.is_none());
}

async fn ack_is_idempotent(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();

    // Acking a job nobody leased does not complete it.
    queue.ack(id, "w").await.unwrap();
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Ready);

    queue
        .claim_with_instant(&queues(&["default"]), LEASE, "w", now)
        .await
        .unwrap()
        .unwrap();
    queue.ack(id, "w").await.unwrap();
    queue.ack(id, "w").await.unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.lease_owner.is_none());

    queue.ack(aide_de_camp::core::new_xid(), "w").await.unwrap();
}

async fn fifo_within_queue_and_queue_order_respected(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let older = queue.enqueue(new_job("mail", now - millis(2_000))).await.unwrap();
    let newer = queue.enqueue(new_job("mail", now - millis(1_000))).await.unwrap();
    let report = queue.enqueue(new_job("reports", now - millis(3_000))).await.unwrap();

    let first = queue
        .claim_with_instant(&queues(&["mail", "reports"]), LEASE, "w", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, older);

    let second = queue
        .claim_with_instant(&queues(&["reports", "mail"]), LEASE, "w", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, report);

    let third = queue
        .claim_with_instant(&queues(&["reports", "mail"]), LEASE, "w", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.id, newer);

    assert!(queue
        .claim_with_instant(&queues(&["unknown"]), LEASE, "w", now)
        .await
        .unwrap()
        .is_none());
}

async fn dead_jobs_are_paged_and_requeueable(queue: Arc<dyn Queue>) {
    let now = Utc::now();
    let names = queues(&["default"]);
    let mut dead = Vec::new();
    for i in 0..3 {
        let id = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();
        queue.claim_with_instant(&names, LEASE, "w", now).await.unwrap().unwrap();
        queue.dead_queue(id, "w", &format!("broken {i}")).await.unwrap();
        dead.push(id);
    }
    let alive = queue.enqueue(new_job("default", now - millis(10))).await.unwrap();

    let all: Vec<_> = queue
        .list_dead("default", Page::first(10))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(all, dead);

    let page: Vec<_> = queue
        .list_dead("default", Page::new(1, 1))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(page, vec![dead[1]]);
    assert!(queue.list_dead("other", Page::default()).await.unwrap().is_empty());

    assert!(matches!(
        queue.requeue_dead(alive).await,
        Err(QueueError::NotDead(id)) if id == alive
    ));
    assert!(matches!(
        queue.requeue_dead(aide_de_camp::core::new_xid()).await,
        Err(QueueError::JobNotFound(_))
    ));

    queue.requeue_dead(dead[0]).await.unwrap();
    let job = queue.get(dead[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.last_error.as_deref(), Some("broken 0"));
    assert_eq!(queue.list_dead("default", Page::default()).await.unwrap().len(), 2);
}
