//! A durable background job queue shared by independent worker processes.
//!
//! Workers poll a [`JobStore`], take a time-bounded lease on a job with a
//! single conditional update, run it, and record the outcome. Failed jobs
//! are retried with a growing backoff until their attempt budget runs out.
//!
//! ```text
//! JobQueue::enqueue ──► JobStore::insert
//!
//! Worker::start
//!     └─► JobQueue::work_off
//!             ├─► find_available (up to `batch_size` candidates)
//!             └─► Job::run_with_lease
//!                     ├─► acquire_lease (compare-and-swap)
//!                     ├─► Performable::perform under a deadline
//!                     └─► complete | reschedule
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod job_handle;
pub mod memory;
pub mod method;
pub mod payload;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Backoff, QueueConfig};
pub use error::{Error, Result};
pub use job_handle::{FailureHook, Job, Rescheduled, RunOutcome};
pub use memory::MemoryJobStore;
pub use method::{Invocation, MethodCall, MethodError, MethodTable, Receiver, METHOD_CALL_TYPE};
pub use payload::{Payload, PayloadRegistry, Performable};
pub use queue::{JobQueue, WorkStats};
pub use store::{CandidateQuery, JobStore, LeaseCondition};
pub use types::{JobRow, JobState, NewJob};
pub use worker::Worker;
