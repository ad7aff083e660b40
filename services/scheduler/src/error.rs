//! Scheduler error types.

use subdist_id::{IdError, WorkerId};

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A rebalance tick ran with no registered workers. The tick is skipped.
    #[error("no workers registered")]
    NoWorkers,

    /// A move no longer matches the assignment table it is applied to.
    #[error("stale move: {0}")]
    StaleMove(String),

    /// A worker with this id is already registered and running.
    #[error("worker {0} is already running")]
    WorkerAlreadyRunning(WorkerId),

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl SchedulerError {
    /// Returns true if the next tick may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoWorkers | Self::StaleMove(_))
    }
}
