use std::time::Duration;

use aide_de_camp::core::Xid;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at enqueue time: nothing registered can perform this payload.
    #[error("cannot enqueue {0}: payload does not resolve to a performable job")]
    NotPerformable(String),

    #[error("undefined method `{method}` for {receiver}")]
    UnknownMethod { receiver: String, method: String },

    /// The stored payload could not be turned back into a runnable job.
    #[error("job failed to load: {0}")]
    Deserialization(String),

    #[error(transparent)]
    Execution(anyhow::Error),

    #[error("execution expired after {0:?}")]
    Timeout(Duration),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("job {0} not found")]
    JobNotFound(Xid),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("job store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl Error {
    /// Message and source chain as stored in a job's `result` after a failed run.
    pub fn failure_report(&self) -> (String, Vec<String>) {
        let mut trace = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        (self.to_string(), trace)
    }
}
