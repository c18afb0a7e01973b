//! Long-running worker loop.
//!
//! ```text
//! Worker::start
//!     │
//!     ├─► JobQueue::work_off (fetch candidates → lease → perform → record)
//!     ├─► nothing ran: sleep in steps, waking early on shutdown
//!     └─► on exit (clean or panicking): JobQueue::clear_locks
//! ```

use std::{panic::AssertUnwindSafe, time::Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    queue::{JobQueue, WorkStats},
    store::JobStore,
};

pub struct Worker<S: JobStore> {
    queue: JobQueue<S>,
}

impl<S: JobStore> Worker<S> {
    pub fn new(queue: JobQueue<S>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    /// Work until `shutdown` is cancelled. Leases held by this worker are
    /// released on the way out, even if the loop panics.
    pub async fn start(&self, shutdown: CancellationToken) -> WorkStats {
        let worker_name = self.queue.worker_name().to_string();
        info!(worker = %worker_name, "starting job worker");

        let outcome = AssertUnwindSafe(self.run(&shutdown)).catch_unwind().await;

        match self.queue.clear_locks().await {
            Ok(released) => info!(worker = %worker_name, released, "released leases"),
            Err(e) => error!(worker = %worker_name, error = %e, "failed to release leases"),
        }

        match outcome {
            Ok(totals) => {
                info!(
                    worker = %worker_name,
                    succeeded = totals.succeeded,
                    failed = totals.failed,
                    "job worker stopped"
                );
                totals
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run(&self, shutdown: &CancellationToken) -> WorkStats {
        let rounds = self.queue.config().rounds_per_batch;
        let mut totals = WorkStats::default();

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            match self.queue.work_off(rounds, shutdown).await {
                Ok(stats) if stats.total() > 0 => {
                    totals.succeeded += stats.succeeded;
                    totals.failed += stats.failed;

                    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                    info!(
                        count = stats.total(),
                        failed = stats.failed,
                        jobs_per_sec = stats.total() as f64 / elapsed,
                        "jobs processed"
                    );
                }
                Ok(_) => self.idle(shutdown).await,
                Err(e) => {
                    error!(error = %e, "job batch failed");
                    self.idle(shutdown).await;
                }
            }
        }

        totals
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        let config = self.queue.config();
        let mut remaining = config.sleep_delay;

        while !remaining.is_zero() {
            let step = remaining.min(config.sleep_step);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(step) => {}
            }
            remaining = remaining.saturating_sub(step);
        }
    }
}
