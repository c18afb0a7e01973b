use aide_de_camp::core::{Bytes, DateTime, Xid};
use uuid::Uuid;

/// Terminal state of a job. Pending and running jobs have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Successful,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Successful => "successful",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job record.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Xid,
    pub priority: i32,
    pub attempts: u32,
    /// Type discriminator used to reconstruct `payload`.
    pub job_type: String,
    pub payload: Bytes,
    /// Return value of a kept successful run, or the last error text.
    pub result: Option<String>,
    pub run_at: DateTime,
    pub locked_at: Option<DateTime>,
    pub locked_by: Option<String>,
    pub unique_key: String,
    pub completed_at: Option<DateTime>,
    pub state: Option<JobState>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl JobRow {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn is_locked_by(&self, worker_name: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_name)
    }

    pub fn is_successful(&self) -> bool {
        self.state == Some(JobState::Successful)
    }

    pub fn is_failed(&self) -> bool {
        self.state == Some(JobState::Failed)
    }

    /// Clears the lease. Not persisted until the row is saved.
    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }

    /// Runs before every save of an existing row: `completed_at` is set
    /// exactly when the row carries a terminal state.
    pub fn apply_save_guards(&mut self, now: DateTime) {
        match self.state {
            Some(_) => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(now);
                }
            }
            None => self.completed_at = None,
        }
        self.updated_at = now;
    }
}

/// A job that has not been persisted yet. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Bytes,
    pub priority: i32,
    pub run_at: DateTime,
    pub unique_key: String,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        payload: Bytes,
        priority: i32,
        run_at: DateTime,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority,
            run_at,
            unique_key: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Builds the stored row. Used by `JobStore` implementations on insert.
    pub fn into_row(self, id: Xid, now: DateTime) -> JobRow {
        JobRow {
            id,
            priority: self.priority,
            attempts: 0,
            job_type: self.job_type,
            payload: self.payload,
            result: None,
            run_at: self.run_at,
            locked_at: None,
            locked_by: None,
            unique_key: self.unique_key,
            completed_at: None,
            state: None,
            created_at: now,
            updated_at: now,
        }
    }
}
