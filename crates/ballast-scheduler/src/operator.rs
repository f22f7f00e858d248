//! Operators emitted by schedulers and the in-flight tracker.
//!
//! An `Operator` is immutable once built. Execution happens outside this
//! crate; the scheduling loop only hands operators over and keeps them in
//! an [`OperatorTracker`] until they finish or time out.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use ballast_core::{ContainerId, Peer, ResourceId, ResourceKind};

/// The change an operator asks the executor to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorAction {
    TransferLeader {
        resource_id: ResourceId,
        from_peer: Peer,
        to_peer: Peer,
    },
    MoveReplica {
        resource_id: ResourceId,
        from_peer: Peer,
        to_container: ContainerId,
    },
}

impl OperatorAction {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            OperatorAction::TransferLeader { resource_id, .. }
            | OperatorAction::MoveReplica { resource_id, .. } => *resource_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operator {
    scheduler: String,
    kind: ResourceKind,
    action: OperatorAction,
    created: Instant,
}

impl Operator {
    pub fn transfer_leader(
        scheduler: impl Into<String>,
        resource_id: ResourceId,
        from_peer: Peer,
        to_peer: Peer,
    ) -> Self {
        Self::new(
            scheduler,
            ResourceKind::Leader,
            OperatorAction::TransferLeader {
                resource_id,
                from_peer,
                to_peer,
            },
        )
    }

    pub fn move_replica(
        scheduler: impl Into<String>,
        resource_id: ResourceId,
        from_peer: Peer,
        to_container: ContainerId,
    ) -> Self {
        Self::new(
            scheduler,
            ResourceKind::Replica,
            OperatorAction::MoveReplica {
                resource_id,
                from_peer,
                to_container,
            },
        )
    }

    fn new(scheduler: impl Into<String>, kind: ResourceKind, action: OperatorAction) -> Self {
        Self {
            scheduler: scheduler.into(),
            kind,
            action,
            created: Instant::now(),
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.action.resource_id()
    }

    /// Name of the scheduler that emitted this operator.
    pub fn scheduler(&self) -> &str {
        &self.scheduler
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn action(&self) -> &OperatorAction {
        &self.action
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.age() >= timeout
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            OperatorAction::TransferLeader {
                resource_id,
                from_peer,
                to_peer,
            } => write!(
                f,
                "{}: transfer leader of resource {resource_id} from container {} to container {}",
                self.scheduler, from_peer.container_id, to_peer.container_id
            ),
            OperatorAction::MoveReplica {
                resource_id,
                from_peer,
                to_container,
            } => write!(
                f,
                "{}: move replica of resource {resource_id} from container {} to container {to_container}",
                self.scheduler, from_peer.container_id
            ),
        }
    }
}

/// In-flight operators, at most one per resource.
#[derive(Debug, Default)]
pub struct OperatorTracker {
    operators: HashMap<ResourceId, Operator>,
}

impl OperatorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `op`. Returns false and drops it when its resource is busy.
    pub fn add(&mut self, op: Operator) -> bool {
        let id = op.resource_id();
        if self.operators.contains_key(&id) {
            return false;
        }
        self.operators.insert(id, op);
        true
    }

    pub fn contains(&self, resource_id: ResourceId) -> bool {
        self.operators.contains_key(&resource_id)
    }

    pub fn get(&self, resource_id: ResourceId) -> Option<&Operator> {
        self.operators.get(&resource_id)
    }

    /// In-flight operators of `kind`.
    pub fn count(&self, kind: ResourceKind) -> u64 {
        self.operators.values().filter(|op| op.kind() == kind).count() as u64
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Mark the resource's operator as done.
    pub fn finish(&mut self, resource_id: ResourceId) -> Option<Operator> {
        self.operators.remove(&resource_id)
    }

    /// Drop and return every operator older than `timeout`.
    pub fn reclaim_expired(&mut self, timeout: Duration) -> Vec<Operator> {
        let expired: Vec<ResourceId> = self
            .operators
            .iter()
            .filter(|(_, op)| op.is_expired(timeout))
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.operators.remove(&id))
            .collect()
    }
}
