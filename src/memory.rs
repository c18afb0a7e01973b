use std::{collections::HashMap, sync::Arc};

use aide_de_camp::core::{new_xid, DateTime, Xid};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::{
    clock::{Clock, SystemClock},
    error::{Error, Result},
    store::{CandidateQuery, JobStore, LeaseCondition},
    types::{JobRow, NewJob},
};

/// In-process job table. Every conditional update runs under the write
/// lock, which makes it a single compare-and-swap.
#[derive(Clone)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<Xid, JobRow>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Copy of every row, in no particular order.
    pub async fn rows(&self) -> Vec<JobRow> {
        self.jobs.read().await.values().cloned().collect()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn now(&self) -> Result<DateTime> {
        Ok(self.clock.now())
    }

    #[instrument(skip_all, err, fields(job_type = %job.job_type))]
    async fn insert(&self, job: NewJob) -> Result<JobRow> {
        let row = job.into_row(new_xid(), self.clock.now());
        let mut jobs = self.jobs.write().await;
        jobs.insert(row.id, row.clone());
        Ok(row)
    }

    #[instrument(skip_all, err, fields(job_id = %row.id))]
    async fn save(&self, row: &JobRow) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&row.id).ok_or(Error::JobNotFound(row.id))?;
        *stored = row.clone();
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn delete(&self, id: Xid) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.remove(&id).is_some())
    }

    async fn get(&self, id: Xid) -> Result<Option<JobRow>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id).cloned())
    }

    async fn find_by_unique_key(&self, unique_key: &str) -> Result<Option<JobRow>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().find(|j| j.unique_key == unique_key).cloned())
    }

    #[instrument(skip_all, err, fields(limit = query.limit))]
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<JobRow>> {
        let jobs = self.jobs.read().await;

        let mut candidates: Vec<JobRow> = jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect();
        candidates.sort_by(CandidateQuery::order);
        candidates.truncate(query.limit);

        Ok(candidates)
    }

    #[instrument(skip_all, err, fields(job_id = %id, worker = locked_by))]
    async fn update_lease(
        &self,
        id: Xid,
        condition: &LeaseCondition,
        locked_at: DateTime,
        locked_by: &str,
    ) -> Result<u64> {
        let mut jobs = self.jobs.write().await;

        match jobs.get_mut(&id) {
            Some(job) if condition.holds(job) => {
                job.locked_at = Some(locked_at);
                job.locked_by = Some(locked_by.to_string());
                job.updated_at = locked_at;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    #[instrument(skip_all, err, fields(worker = worker_name))]
    async fn clear_locks(&self, worker_name: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;

        let mut released = 0;
        for job in jobs.values_mut().filter(|j| j.is_locked_by(worker_name)) {
            job.unlock();
            job.updated_at = now;
            released += 1;
        }

        Ok(released)
    }

    #[instrument(skip_all, err)]
    async fn delete_all(&self) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let removed = jobs.len() as u64;
        jobs.clear();
        Ok(removed)
    }
}
