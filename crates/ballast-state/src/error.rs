//! Error types for the Ballast coordination store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("lease {0} expired or revoked")]
    LeaseExpired(u64),

    #[error("invalid lease ttl: {0:?}")]
    InvalidTtl(std::time::Duration),

    #[error("campaign lost, current leader is {0}")]
    CampaignLost(String),

    #[error("{0} is not the current leader")]
    NotLeader(String),
}

impl StateError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Transaction(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::LeaseExpired(_)
                | StateError::CampaignLost(_)
        )
    }
}
