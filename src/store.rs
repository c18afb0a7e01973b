use std::cmp::Ordering;

use aide_de_camp::core::{DateTime, Xid};
use async_trait::async_trait;

use crate::{
    error::Result,
    types::{JobRow, NewJob},
};

/// Durable table of job rows shared by every worker.
///
/// Implementations must apply `update_lease` and `clear_locks` atomically
/// per row: the predicate is checked and the row updated as one step, and
/// the returned count is the number of rows that changed.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Authoritative current time.
    async fn now(&self) -> Result<DateTime>;

    async fn insert(&self, job: NewJob) -> Result<JobRow>;

    /// Overwrite an existing row. Fails with `Error::JobNotFound` if it is gone.
    async fn save(&self, row: &JobRow) -> Result<()>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: Xid) -> Result<bool>;

    async fn get(&self, id: Xid) -> Result<Option<JobRow>>;

    async fn find_by_unique_key(&self, unique_key: &str) -> Result<Option<JobRow>>;

    /// Rows matching `query`, in `CandidateQuery::order`, at most `query.limit`.
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<JobRow>>;

    /// Set `locked_at`/`locked_by` on row `id` if `condition` holds.
    async fn update_lease(
        &self,
        id: Xid,
        condition: &LeaseCondition,
        locked_at: DateTime,
        locked_by: &str,
    ) -> Result<u64>;

    /// Release every lease held by `worker_name`.
    async fn clear_locks(&self, worker_name: &str) -> Result<u64>;

    async fn delete_all(&self) -> Result<u64>;
}

/// Selection of rows a worker may try to lease.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub now: DateTime,
    /// Leases taken before this instant have expired.
    pub stale_before: DateTime,
    pub worker_name: String,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub limit: usize,
}

impl CandidateQuery {
    /// `state IS NULL AND ((run_at <= now AND (locked_at IS NULL OR locked_at < stale_before))
    /// OR locked_by = worker_name)`, within the priority range.
    pub fn matches(&self, row: &JobRow) -> bool {
        if row.state.is_some() {
            return false;
        }

        let runnable = row.run_at <= self.now && lease_expired(row, self.stale_before);
        if !runnable && !row.is_locked_by(&self.worker_name) {
            return false;
        }

        self.min_priority.map_or(true, |min| row.priority >= min)
            && self.max_priority.map_or(true, |max| row.priority <= max)
    }

    /// `priority DESC, run_at ASC`
    pub fn order(a: &JobRow, b: &JobRow) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.run_at.cmp(&b.run_at))
    }
}

/// Predicate guarding a lease update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCondition {
    /// Runnable and not leased, or leased before `stale_before`.
    Available {
        now: DateTime,
        stale_before: DateTime,
    },
    /// Currently leased by this worker.
    HeldBy(String),
}

impl LeaseCondition {
    pub fn holds(&self, row: &JobRow) -> bool {
        if row.state.is_some() {
            return false;
        }
        match self {
            LeaseCondition::Available { now, stale_before } => {
                row.run_at <= *now && lease_expired(row, *stale_before)
            }
            LeaseCondition::HeldBy(worker_name) => row.is_locked_by(worker_name),
        }
    }
}

fn lease_expired(row: &JobRow, stale_before: DateTime) -> bool {
    row.locked_at.map_or(true, |locked_at| locked_at < stale_before)
}
