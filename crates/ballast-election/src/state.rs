//! Observable leadership state of one campaigning identity.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadershipState {
    /// No election round has run yet.
    #[default]
    Unknown,
    Follower,
    /// Leader key claimed, waiting on the lock or the leader handler.
    Campaigning,
    Leader,
}

impl LeadershipState {
    pub fn is_leader(self) -> bool {
        self == LeadershipState::Leader
    }
}
