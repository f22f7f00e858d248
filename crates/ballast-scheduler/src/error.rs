//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler {name} not ready: {reason}")]
    NotReady { name: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] ballast_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
