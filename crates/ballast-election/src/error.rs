//! Election error types.

use thiserror::Error;

use ballast_state::StateError;

pub type ElectionResult<T> = Result<T, ElectionError>;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("leader lease must be positive, got {0} seconds")]
    InvalidLease(i64),

    #[error("{id} is not the leader of group {group}")]
    NotLeader { group: u64, id: String },

    #[error("no leader recorded for group {0}")]
    NoLeader(u64),

    #[error("watch on {0} closed")]
    WatchClosed(String),

    #[error("coordination backend error: {0}")]
    Backend(#[from] StateError),
}

impl ElectionError {
    /// Whether retrying the round may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            ElectionError::Backend(e) => e.is_transient(),
            ElectionError::WatchClosed(_) => true,
            _ => false,
        }
    }
}
