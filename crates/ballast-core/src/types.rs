//! Cluster data model shared across Ballast crates.
//!
//! These are plain values: the store persists them as JSON and the
//! scheduler runtime wraps them with derived metrics.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a container (storage node).
pub type ContainerId = u64;

/// Identifier of a resource (replicated data unit).
pub type ResourceId = u64;

/// Identifier of a single replica placement.
pub type PeerId = u64;

// ── Node ──────────────────────────────────────────────────────────

/// Identity of a control-plane participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub name: String,
    pub addr: String,
}

impl Node {
    pub fn new(id: u64, name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            addr: addr.into(),
        }
    }

    /// The string a node campaigns under: its JSON encoding.
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{}-{}", self.id, self.name))
    }

    /// Decode a signature written by [`Node::signature`].
    pub fn from_signature(signature: &str) -> Option<Self> {
        serde_json::from_str(signature).ok()
    }

    /// Leader matching compares `(id, name)`; the address may change.
    pub fn is_same(&self, other: &Node) -> bool {
        self.id == other.id && self.name == other.name
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})@{}", self.name, self.id, self.addr)
    }
}

// ── Container ─────────────────────────────────────────────────────

/// Administrative/health state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

/// A storage node hosting replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub address: String,
    /// Topology labels, e.g. `zone = "z1"`, `rack = "r3"`.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Used storage in percent (0..=100).
    #[serde(default)]
    pub storage_used_rate: u32,
    /// Relative leader capacity; leader score is `leader_count / leader_weight`.
    #[serde(default = "default_weight")]
    pub leader_weight: f64,
    #[serde(default)]
    pub state: ContainerState,
    /// Excluded from scheduling by an operator.
    #[serde(default)]
    pub blocked: bool,
    /// Unix timestamp (seconds) of the last heartbeat.
    #[serde(default)]
    pub last_heartbeat: u64,
}

fn default_weight() -> f64 {
    1.0
}

impl Container {
    pub fn new(id: ContainerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            labels: HashMap::new(),
            storage_used_rate: 0,
            leader_weight: 1.0,
            state: ContainerState::Up,
            blocked: false,
            last_heartbeat: 0,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Value of a location label, empty when absent.
    pub fn label_value(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn is_up(&self) -> bool {
        self.state == ContainerState::Up
    }
}

// ── Resource ──────────────────────────────────────────────────────

/// One replica of a resource, placed on a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub container_id: ContainerId,
}

impl Peer {
    pub fn new(id: PeerId, container_id: ContainerId) -> Self {
        Self { id, container_id }
    }
}

/// A replicated, leader/follower unit of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub peers: Vec<Peer>,
    /// Peer currently acting as leader, if one is known.
    pub leader_peer_id: Option<PeerId>,
}

impl Resource {
    pub fn new(id: ResourceId, peers: Vec<Peer>, leader_peer_id: Option<PeerId>) -> Self {
        Self {
            id,
            peers,
            leader_peer_id,
        }
    }

    pub fn leader_peer(&self) -> Option<&Peer> {
        let leader = self.leader_peer_id?;
        self.peers.iter().find(|p| p.id == leader)
    }

    pub fn follower_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers
            .iter()
            .filter(move |p| Some(p.id) != self.leader_peer_id)
    }

    /// The peer placed on the given container.
    pub fn container_peer(&self, container_id: ContainerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.container_id == container_id)
    }

    pub fn is_leader_on(&self, container_id: ContainerId) -> bool {
        self.leader_peer()
            .is_some_and(|p| p.container_id == container_id)
    }
}

// ── Scheduling ────────────────────────────────────────────────────

/// The dimension a scheduler balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Resource leaderships per container.
    Leader,
    /// Replicas per container.
    Replica,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Leader => f.write_str("leader"),
            ResourceKind::Replica => f.write_str("replica"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_signature_round_trip() {
        let node = Node::new(7, "ballast-1", "10.0.0.7:7000");
        let decoded = Node::from_signature(&node.signature()).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn node_match_ignores_address() {
        let a = Node::new(1, "n1", "10.0.0.1:7000");
        let b = Node::new(1, "n1", "10.0.0.9:7000");
        let c = Node::new(2, "n1", "10.0.0.1:7000");
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }

    #[test]
    fn resource_peer_roles() {
        let res = Resource::new(
            10,
            vec![Peer::new(1, 100), Peer::new(2, 200), Peer::new(3, 300)],
            Some(2),
        );

        assert_eq!(res.leader_peer().unwrap().container_id, 200);
        let followers: Vec<_> = res.follower_peers().map(|p| p.container_id).collect();
        assert_eq!(followers, vec![100, 300]);
        assert!(res.is_leader_on(200));
        assert!(!res.is_leader_on(100));
        assert_eq!(res.container_peer(300).unwrap().id, 3);
        assert!(res.container_peer(400).is_none());
    }

    #[test]
    fn resource_without_leader_has_only_followers() {
        let res = Resource::new(1, vec![Peer::new(1, 100), Peer::new(2, 200)], None);
        assert!(res.leader_peer().is_none());
        assert_eq!(res.follower_peers().count(), 2);
    }

    #[test]
    fn container_defaults_from_json() {
        let container: Container =
            serde_json::from_str(r#"{"id": 3, "address": "10.0.0.3:20160"}"#).unwrap();
        assert_eq!(container.leader_weight, 1.0);
        assert_eq!(container.state, ContainerState::Up);
        assert!(!container.blocked);
        assert_eq!(container.label_value("zone"), "");
    }
}
