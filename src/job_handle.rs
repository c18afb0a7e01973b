use std::{sync::Arc, time::Duration, time::Instant};

use aide_de_camp::core::{DateTime, Xid};
use tracing::{debug, error, info, warn};

use crate::{
    config::{lease_cutoff, QueueConfig},
    error::{Error, Result},
    payload::{PayloadRegistry, Performable},
    store::{JobStore, LeaseCondition},
    types::{JobRow, JobState},
};

/// What a single attempt at a job amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another worker holds the job, or it stopped being eligible.
    NoLease,
    Succeeded,
    Failed,
}

/// Where a failed job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rescheduled {
    Retrying { run_at: DateTime },
    Removed,
    GaveUp,
}

/// Called after a failed run has been rescheduled, with the updated row.
pub type FailureHook = Arc<dyn Fn(&JobRow, &Error) + Send + Sync>;

/// A job row bound to the store it lives in.
pub struct Job<S: JobStore> {
    store: Arc<S>,
    registry: Arc<PayloadRegistry>,
    config: Arc<QueueConfig>,
    row: JobRow,
    payload: Option<Arc<dyn Performable>>,
    on_failure: Option<FailureHook>,
}

impl<S: JobStore> Job<S> {
    pub(crate) fn new(
        store: Arc<S>,
        registry: Arc<PayloadRegistry>,
        config: Arc<QueueConfig>,
        row: JobRow,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            row,
            payload: None,
            on_failure: None,
        }
    }

    pub(crate) fn with_failure_hook(mut self, hook: Option<FailureHook>) -> Self {
        self.on_failure = hook;
        self
    }

    pub fn id(&self) -> Xid {
        self.row.id
    }

    pub fn row(&self) -> &JobRow {
        &self.row
    }

    pub fn into_row(self) -> JobRow {
        self.row
    }

    /// The reconstructed payload, built once per handle. The payload is
    /// told its job's unique key before anything runs it.
    pub fn payload_object(&mut self) -> Result<Arc<dyn Performable>> {
        if let Some(payload) = &self.payload {
            return Ok(Arc::clone(payload));
        }
        let payload = self.registry.decode(&self.row.job_type, &self.row.payload)?;
        payload.set_job_key(&self.row.unique_key);
        self.payload = Some(Arc::clone(&payload));
        Ok(payload)
    }

    /// Payload display name, falling back to the stored type name.
    pub fn name(&mut self) -> String {
        self.payload_object()
            .ok()
            .and_then(|p| p.display_name())
            .unwrap_or_else(|| self.row.job_type.clone())
    }

    pub fn max_attempts(&mut self) -> u32 {
        self.payload_object()
            .ok()
            .and_then(|p| p.max_attempts())
            .unwrap_or(self.config.max_attempts)
    }

    /// Persist the row after re-deriving `completed_at` from `state`.
    pub async fn save(&mut self) -> Result<()> {
        let now = self.store.now().await?;
        self.row.apply_save_guards(now);
        self.store.save(&self.row).await
    }

    pub async fn destroy(&mut self) -> Result<()> {
        self.store.delete(self.row.id).await?;
        Ok(())
    }

    /// Take the lease on this job for `worker_name`. Returns `false` when
    /// another worker got there first or the job is no longer eligible.
    pub async fn acquire_lease(
        &mut self,
        lease_duration: Duration,
        worker_name: &str,
    ) -> Result<bool> {
        let now = self.store.now().await?;
        let condition = if self.row.is_locked_by(worker_name) {
            // left over from a previous run of this worker; just refresh it
            LeaseCondition::HeldBy(worker_name.to_string())
        } else {
            LeaseCondition::Available {
                now,
                stale_before: lease_cutoff(now, lease_duration)?,
            }
        };

        let affected = self
            .store
            .update_lease(self.row.id, &condition, now, worker_name)
            .await?;
        if affected != 1 {
            return Ok(false);
        }

        self.row.locked_at = Some(now);
        self.row.locked_by = Some(worker_name.to_string());
        Ok(true)
    }

    /// Record a failed run. Retries after the configured backoff (or at
    /// `run_at` when given) until the attempt budget is spent.
    pub async fn reschedule(
        &mut self,
        message: &str,
        trace: &[String],
        run_at: Option<DateTime>,
    ) -> Result<Rescheduled> {
        self.row.attempts += 1;
        self.row.result = Some(failure_text(message, trace));
        self.row.unlock();

        let max_attempts = self.max_attempts();
        if self.row.attempts < max_attempts {
            let retry_at = match run_at {
                Some(run_at) => Some(run_at),
                None => {
                    let delay = self.config.backoff.delay(self.row.attempts);
                    self.store.now().await?.checked_add_signed(delay)
                }
            };
            // no representable retry time left: the budget is spent
            if let Some(run_at) = retry_at {
                self.row.run_at = run_at;
                self.save().await?;
                return Ok(Rescheduled::Retrying { run_at });
            }
        }

        let name = self.name();
        if self.config.destroy_failed_jobs {
            warn!(job = %name, attempts = self.row.attempts, "permanently removing job");
            self.destroy().await?;
            Ok(Rescheduled::Removed)
        } else {
            warn!(job = %name, attempts = self.row.attempts, "giving up on job");
            self.row.state = Some(JobState::Failed);
            self.save().await?;
            Ok(Rescheduled::GaveUp)
        }
    }

    /// Record a successful run: keep the row as `successful` with `result`,
    /// or delete it.
    pub async fn complete(
        &mut self,
        result: Option<String>,
        keep_after_success: bool,
    ) -> Result<()> {
        if keep_after_success {
            self.row.result = result;
            self.row.state = Some(JobState::Successful);
            self.row.unlock();
            self.save().await
        } else {
            self.destroy().await
        }
    }

    /// Lease, run and record one job.
    pub async fn run_with_lease(
        &mut self,
        lease_duration: Duration,
        worker_name: &str,
    ) -> Result<RunOutcome> {
        let name = self.name();
        debug!(job = %name, worker = worker_name, "acquiring lease");

        if !self.acquire_lease(lease_duration, worker_name).await? {
            warn!(job = %name, worker = worker_name, "failed to acquire exclusive lease");
            return Ok(RunOutcome::NoLease);
        }
        debug!(job = %name, worker = worker_name, "lease acquired");

        let started = Instant::now();
        match self.invoke(lease_duration).await {
            Ok((result, keep)) => {
                self.complete(result, keep).await?;
                info!(
                    job = %name,
                    kept = keep,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "job completed and {}",
                    if keep { "kept" } else { "removed" }
                );
                Ok(RunOutcome::Succeeded)
            }
            Err(e) => {
                let (message, trace) = e.failure_report();
                let rescheduled = self.reschedule(&message, &trace, None).await?;
                if let Some(hook) = &self.on_failure {
                    hook(&self.row, &e);
                }
                let max_attempts = self.max_attempts();
                error!(
                    job = %name,
                    error = %e,
                    attempts = self.row.attempts,
                    max_attempts,
                    next = ?rescheduled,
                    "job failed"
                );
                Ok(RunOutcome::Failed)
            }
        }
    }

    /// Run `perform()` on its own task with a hard deadline.
    async fn invoke(&mut self, deadline: Duration) -> Result<(Option<String>, bool)> {
        let payload = self.payload_object()?;
        let keep = payload.keep_after_success();

        let mut task = tokio::spawn(async move { payload.perform().await });
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(Ok(result))) => Ok((result, keep)),
            Ok(Ok(Err(e))) => Err(Error::Execution(e)),
            Ok(Err(join_error)) => Err(Error::Panicked(join_error.to_string())),
            Err(_) => {
                task.abort();
                Err(Error::Timeout(deadline))
            }
        }
    }
}

fn failure_text(message: &str, trace: &[String]) -> String {
    let mut text = message.to_string();
    for line in trace {
        text.push('\n');
        text.push_str(line);
    }
    text
}
