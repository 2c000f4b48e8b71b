use std::{fmt, sync::Arc, time::Duration};

use aide_de_camp::core::new_xid;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::Queue;

/// Lease owner name recorded on every job a worker claims.
///
/// The pool part is unique per process start, so ids from different machines or
/// restarts never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(pool: &str, index: usize) -> Self {
        Self(format!("{pool}:{index}"))
    }

    /// A pool name prefixed with a fresh unique id.
    pub fn pool_name(label: &str) -> String {
        format!("{label}-{}", new_xid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Background loop returning jobs whose lease ran out to the ready queue.
pub struct LeaseReaper {
    queue: Arc<dyn Queue>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(queue: Arc<dyn Queue>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// One sweep. Errors are logged and reported as zero recovered jobs.
    pub async fn reap_once(&self) -> usize {
        match self.queue.reap_expired_leases(Utc::now()).await {
            Ok(0) => 0,
            Ok(count) => {
                warn!(count, "returned jobs with expired leases to the ready queue");
                count
            }
            Err(e) => {
                warn!(error = %e, "lease reaping failed");
                0
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "lease reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let recovered = self.reap_once().await;
                    debug!(recovered, "lease reaper sweep finished");
                }
            }
        }
        info!("lease reaper stopped");
    }
}
