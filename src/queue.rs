use std::{sync::Arc, time::Duration};

use aide_de_camp::core::{Bytes, DateTime, Xid};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::{lease_cutoff, QueueConfig},
    error::{Error, Result},
    job_handle::{FailureHook, Job, RunOutcome},
    method::{MethodCall, METHOD_CALL_TYPE},
    payload::{Payload, PayloadRegistry},
    store::{CandidateQuery, JobStore},
    types::{JobRow, NewJob},
};

/// Jobs that ran during one `work_off` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkStats {
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkStats {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct JobQueue<S: JobStore> {
    store: Arc<S>,
    registry: Arc<PayloadRegistry>,
    config: Arc<QueueConfig>,
    on_failure: Option<FailureHook>,
}

impl<S: JobStore> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<PayloadRegistry>,
        config: QueueConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            registry,
            config: Arc::new(config),
            on_failure: None,
        })
    }

    /// Report every failed run to `hook`, after the job was rescheduled.
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobRow, &Error) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }

    fn handle(&self, row: JobRow) -> Job<S> {
        Job::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            row,
        )
        .with_failure_hook(self.on_failure.clone())
    }

    /// Add a job. `run_at` defaults to the store's current time.
    pub async fn enqueue<P: Payload>(
        &self,
        payload: &P,
        priority: i32,
        run_at: Option<DateTime>,
    ) -> Result<Job<S>> {
        let bytes = self.registry.encode(payload)?;
        self.enqueue_encoded(P::name(), bytes, priority, run_at).await
    }

    /// Add a deferred method call built with `MethodTable::call`.
    pub async fn enqueue_method(
        &self,
        call: &MethodCall,
        priority: i32,
        run_at: Option<DateTime>,
    ) -> Result<Job<S>> {
        let bytes = self.registry.encode(call)?;
        self.enqueue_encoded(METHOD_CALL_TYPE, bytes, priority, run_at).await
    }

    #[instrument(
        skip_all,
        err,
        fields(job_type = job_type, payload_size = bytes.len(), priority = priority)
    )]
    async fn enqueue_encoded(
        &self,
        job_type: &str,
        bytes: Bytes,
        priority: i32,
        run_at: Option<DateTime>,
    ) -> Result<Job<S>> {
        // refuse anything a worker could never turn back into a job
        if let Err(e) = self.registry.decode(job_type, &bytes) {
            return Err(Error::NotPerformable(format!("{} ({})", job_type, e)));
        }

        let run_at = match run_at {
            Some(run_at) => run_at,
            None => self.store.now().await?,
        };
        let row = self
            .store
            .insert(NewJob::new(job_type, bytes, priority, run_at))
            .await?;

        Ok(self.handle(row))
    }

    pub async fn get(&self, id: Xid) -> Result<Option<Job<S>>> {
        Ok(self.store.get(id).await?.map(|row| self.handle(row)))
    }

    pub async fn find_by_unique_key(&self, unique_key: &str) -> Result<Option<Job<S>>> {
        Ok(self
            .store
            .find_by_unique_key(unique_key)
            .await?
            .map(|row| self.handle(row)))
    }

    /// Up to `limit` jobs this worker could lease right now, best first.
    #[instrument(skip_all, err, fields(limit = limit))]
    pub async fn find_available(
        &self,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<Job<S>>> {
        let now = self.store.now().await?;
        let query = CandidateQuery {
            now,
            stale_before: lease_cutoff(now, lease_duration)?,
            worker_name: self.config.worker_name.clone(),
            min_priority: self.config.min_priority,
            max_priority: self.config.max_priority,
            limit,
        };
        let rows = self.store.find_candidates(&query).await?;

        Ok(rows.into_iter().map(|row| self.handle(row)).collect())
    }

    /// Run the first candidate this worker manages to lease. Several
    /// candidates are fetched so a lost race falls through to the next.
    pub async fn reserve_and_run_one_job(&self) -> Result<RunOutcome> {
        let lease_duration = self.config.max_run_time;
        let candidates = self.find_available(self.config.batch_size, lease_duration).await?;

        for mut job in candidates {
            match job
                .run_with_lease(lease_duration, &self.config.worker_name)
                .await?
            {
                RunOutcome::NoLease => continue,
                ran => return Ok(ran),
            }
        }

        Ok(RunOutcome::NoLease)
    }

    /// Run up to `rounds` jobs. Stops early when no job could be leased or
    /// `shutdown` is cancelled.
    pub async fn work_off(&self, rounds: usize, shutdown: &CancellationToken) -> Result<WorkStats> {
        let mut stats = WorkStats::default();

        for _ in 0..rounds {
            if shutdown.is_cancelled() {
                break;
            }
            match self.reserve_and_run_one_job().await? {
                RunOutcome::Succeeded => stats.succeeded += 1,
                RunOutcome::Failed => stats.failed += 1,
                RunOutcome::NoLease => break,
            }
        }

        Ok(stats)
    }

    /// Release every lease held by this worker.
    pub async fn clear_locks(&self) -> Result<u64> {
        self.clear_locks_for(&self.config.worker_name).await
    }

    pub async fn clear_locks_for(&self, worker_name: &str) -> Result<u64> {
        self.store.clear_locks(worker_name).await
    }

    /// Delete every job.
    pub async fn clear(&self) -> Result<u64> {
        self.store.delete_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        memory::MemoryJobStore,
        method::{MethodTable, Receiver},
        payload::Performable,
    };
    use async_trait::async_trait;
    use bincode::{Decode, Encode};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Encode, Decode)]
    struct Noop {
        tag: u32,
    }

    #[async_trait]
    impl Performable for Noop {
        async fn perform(&self) -> anyhow::Result<Option<String>> {
            Ok(Some(self.tag.to_string()))
        }
    }

    impl Payload for Noop {
        fn name() -> &'static str {
            "Noop"
        }
    }

    #[derive(Encode, Decode)]
    struct Refuse;

    #[async_trait]
    impl Performable for Refuse {
        async fn perform(&self) -> anyhow::Result<Option<String>> {
            anyhow::bail!("nope")
        }
    }

    impl Payload for Refuse {
        fn name() -> &'static str {
            "Refuse"
        }
    }

    static SLOW_RUNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Encode, Decode)]
    struct Slow {
        millis: u64,
    }

    #[async_trait]
    impl Performable for Slow {
        async fn perform(&self) -> anyhow::Result<Option<String>> {
            SLOW_RUNS.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(None)
        }
    }

    impl Payload for Slow {
        fn name() -> &'static str {
            "Slow"
        }
    }

    #[derive(Encode, Decode)]
    struct Unregistered {
        tag: u32,
    }

    #[async_trait]
    impl Performable for Unregistered {
        async fn perform(&self) -> anyhow::Result<Option<String>> {
            Ok(Some(self.tag.to_string()))
        }
    }

    impl Payload for Unregistered {
        fn name() -> &'static str {
            "Unregistered"
        }
    }

    fn queue_with(config: QueueConfig) -> (Arc<ManualClock>, JobQueue<MemoryJobStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryJobStore::with_clock(clock.clone()));
        let mut registry = PayloadRegistry::new();
        registry.register::<Noop>().register::<Refuse>();
        let queue = JobQueue::new(store, Arc::new(registry), config).unwrap();
        (clock, queue)
    }

    fn queue() -> (Arc<ManualClock>, JobQueue<MemoryJobStore>) {
        queue_with(QueueConfig::with_worker_name("w1"))
    }

    #[tokio::test]
    async fn enqueue_defaults_run_at_to_store_time() {
        let (clock, queue) = queue();
        let job = queue.enqueue(&Noop { tag: 1 }, 3, None).await.unwrap();

        let row = job.row();
        assert_eq!(row.run_at, clock.now());
        assert_eq!(row.priority, 3);
        assert_eq!(row.attempts, 0);
        assert!(row.state.is_none());
        assert_eq!(row.job_type, "Noop");
    }

    #[tokio::test]
    async fn enqueue_rejects_unperformable_payloads() {
        let (_, queue) = queue();
        let err = queue.enqueue(&Unregistered { tag: 1 }, 0, None).await.err().unwrap();

        assert!(matches!(err, Error::NotPerformable(_)));
        assert!(queue.store().is_empty().await);
    }

    #[tokio::test]
    async fn find_available_respects_priority_window() {
        let (_, queue) = queue_with(QueueConfig {
            min_priority: Some(0),
            max_priority: Some(5),
            ..QueueConfig::with_worker_name("w1")
        });
        for priority in [-3, 0, 5, 9] {
            queue.enqueue(&Noop { tag: 0 }, priority, None).await.unwrap();
        }

        let found = queue.find_available(5, Duration::from_secs(60)).await.unwrap();
        let priorities: Vec<i32> = found.iter().map(|j| j.row().priority).collect();
        assert_eq!(priorities, vec![5, 0]);
    }

    #[tokio::test]
    async fn find_available_skips_future_and_leased_jobs() {
        let (clock, queue) = queue();
        let later = clock.now() + chrono::Duration::minutes(1);
        queue.enqueue(&Noop { tag: 0 }, 0, Some(later)).await.unwrap();
        let mut leased = queue.enqueue(&Noop { tag: 1 }, 0, None).await.unwrap();
        leased.acquire_lease(Duration::from_secs(60), "w2").await.unwrap();

        assert!(queue.find_available(5, Duration::from_secs(60)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(2));
        let found = queue.find_available(5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn lost_race_moves_on_to_the_next_candidate() {
        let (_, queue) = queue();
        let first = queue.enqueue(&Noop { tag: 1 }, 10, None).await.unwrap();
        let second = queue.enqueue(&Noop { tag: 2 }, 0, None).await.unwrap();
        let lease = Duration::from_secs(60);

        let candidates = queue.find_available(5, lease).await.unwrap();
        assert_eq!(candidates[0].id(), first.id());

        // another worker grabs the top candidate after we listed it
        let mut rival = queue.get(first.id()).await.unwrap().unwrap();
        assert!(rival.acquire_lease(lease, "w2").await.unwrap());

        let mut outcomes = Vec::new();
        for mut job in candidates {
            outcomes.push(job.run_with_lease(lease, "w1").await.unwrap());
        }
        assert_eq!(outcomes, vec![RunOutcome::NoLease, RunOutcome::Succeeded]);
        assert!(queue.get(second.id()).await.unwrap().is_none());
        assert!(queue.get(first.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reserve_reports_no_lease_when_nothing_is_due() {
        let (clock, queue) = queue();
        let later = clock.now() + chrono::Duration::hours(1);
        queue.enqueue(&Noop { tag: 1 }, 0, Some(later)).await.unwrap();

        assert_eq!(queue.reserve_and_run_one_job().await.unwrap(), RunOutcome::NoLease);
    }

    #[tokio::test]
    async fn work_off_counts_and_stops_when_idle() {
        let (_, queue) = queue();
        for tag in 0..3 {
            queue.enqueue(&Noop { tag }, 0, None).await.unwrap();
        }

        let stats = queue.work_off(10, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats, WorkStats { succeeded: 3, failed: 0 });
        assert!(queue.store().is_empty().await);
    }

    #[tokio::test]
    async fn work_off_honours_shutdown() {
        let (_, queue) = queue();
        queue.enqueue(&Noop { tag: 0 }, 0, None).await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = queue.work_off(10, &shutdown).await.unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(queue.store().len().await, 1);
    }

    #[tokio::test]
    async fn method_calls_round_trip_through_the_queue() {
        let mut table = MethodTable::new();
        table.register("Report", "rebuild", |inv| async move { Ok(inv.args.first().cloned()) });
        let table = Arc::new(table);

        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryJobStore::with_clock(clock));
        let mut registry = PayloadRegistry::new();
        registry.register_methods(Arc::clone(&table));
        let config = QueueConfig::with_worker_name("w1");
        let queue = JobQueue::new(store, Arc::new(registry), config).unwrap();

        let call = table
            .call(Receiver::Type("Report".into()), "rebuild", vec!["weekly".into()])
            .unwrap();
        let mut job = queue.enqueue_method(&call, 0, None).await.unwrap();
        assert_eq!(job.name(), "Report.rebuild");

        let stats = queue.work_off(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn clear_and_lookup_by_unique_key() {
        let (_, queue) = queue();
        let job = queue.enqueue(&Noop { tag: 0 }, 0, None).await.unwrap();
        let key = job.row().unique_key.clone();

        let found = queue.find_by_unique_key(&key).await.unwrap().unwrap();
        assert_eq!(found.id(), job.id());

        assert_eq!(queue.clear().await.unwrap(), 1);
        assert!(queue.find_by_unique_key(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn default_identities_keep_loops_in_one_process_apart() {
        let store = Arc::new(MemoryJobStore::new());
        let mut registry = PayloadRegistry::new();
        registry.register::<Slow>();
        let registry = Arc::new(registry);
        let a = JobQueue::new(Arc::clone(&store), Arc::clone(&registry), QueueConfig::default())
            .unwrap();
        let b = JobQueue::new(Arc::clone(&store), registry, QueueConfig::default()).unwrap();
        a.enqueue(&Slow { millis: 300 }, 0, None).await.unwrap();

        let shutdown = CancellationToken::new();
        let (ran_a, ran_b) = tokio::join!(a.work_off(1, &shutdown), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            b.work_off(1, &shutdown).await
        });

        assert_eq!(ran_a.unwrap().succeeded, 1);
        assert_eq!(ran_b.unwrap().total(), 0);
        assert_eq!(SLOW_RUNS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_hook_reports_each_failed_run() {
        let (_, queue) = queue();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = queue.on_failure({
            let failures = Arc::clone(&failures);
            move |row: &JobRow, error: &Error| {
                failures
                    .lock()
                    .unwrap()
                    .push(format!("{} #{}: {}", row.job_type, row.attempts, error));
            }
        });
        queue.enqueue(&Refuse, 0, None).await.unwrap();

        let stats = queue.work_off(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(*failures.lock().unwrap(), vec!["Refuse #1: nope".to_string()]);
    }
}
