//! In-memory cluster model used by the schedulers.
//!
//! A `Runtime` is a point-in-time snapshot built from the store in one
//! pass. It is never patched: a stale runtime is replaced by loading a new
//! one.

use std::collections::{BTreeMap, HashMap};

use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use ballast_core::{Config, Container, ContainerId, Peer, Resource, ResourceId, ResourceKind};
use ballast_state::Store;

use crate::error::SchedulerResult;

/// Base of the per-label weight in [`distinct_score`].
pub const REPLICA_BASE_SCORE: f64 = 100.0;

/// A container plus the counts derived from the resources placed on it.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    meta: Container,
    leader_count: u64,
    resource_count: u64,
}

impl ContainerRuntime {
    pub fn new(meta: Container) -> Self {
        Self {
            meta,
            leader_count: 0,
            resource_count: 0,
        }
    }

    pub fn id(&self) -> ContainerId {
        self.meta.id
    }

    pub fn meta(&self) -> &Container {
        &self.meta
    }

    pub fn leader_count(&self) -> u64 {
        self.leader_count
    }

    pub fn resource_count(&self) -> u64 {
        self.resource_count
    }

    /// Number of units of `kind` hosted here.
    pub fn count(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Leader => self.leader_count,
            ResourceKind::Replica => self.resource_count,
        }
    }

    /// `leader_count / leader_weight`. A non-positive weight counts as 1.
    pub fn leader_score(&self) -> f64 {
        self.leader_count as f64 / self.weight()
    }

    pub fn resource_score(&self) -> f64 {
        self.resource_count as f64
    }

    pub fn score(&self, kind: ResourceKind) -> f64 {
        self.score_with_delta(kind, 0)
    }

    /// Score this container would have after gaining (`delta > 0`) or
    /// losing (`delta < 0`) units of `kind`.
    pub fn score_with_delta(&self, kind: ResourceKind, delta: i64) -> f64 {
        let count = self.count(kind) as f64 + delta as f64;
        match kind {
            ResourceKind::Leader => count / self.weight(),
            ResourceKind::Replica => count,
        }
    }

    fn weight(&self) -> f64 {
        if self.meta.leader_weight > 0.0 {
            self.meta.leader_weight
        } else {
            1.0
        }
    }

    /// Index of the first location label whose value differs from
    /// `other`'s, or `None` when every label matches.
    pub fn compare_location(&self, other: &ContainerRuntime, labels: &[String]) -> Option<usize> {
        labels
            .iter()
            .position(|key| self.meta.label_value(key) != other.meta.label_value(key))
    }

    pub fn is_up(&self) -> bool {
        self.meta.is_up()
    }

    pub fn is_blocked(&self) -> bool {
        self.meta.blocked
    }

    /// Seconds since the last heartbeat as seen at `now` (unix seconds).
    pub fn down_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.meta.last_heartbeat)
    }
}

/// A resource as held by the runtime.
#[derive(Debug, Clone)]
pub struct ResourceRuntime {
    meta: Resource,
}

impl ResourceRuntime {
    pub fn new(meta: Resource) -> Self {
        Self { meta }
    }

    pub fn id(&self) -> ResourceId {
        self.meta.id
    }

    pub fn meta(&self) -> &Resource {
        &self.meta
    }

    pub fn peers(&self) -> &[Peer] {
        &self.meta.peers
    }

    pub fn leader_peer(&self) -> Option<&Peer> {
        self.meta.leader_peer()
    }

    pub fn follower_peers(&self) -> impl Iterator<Item = &Peer> {
        self.meta.follower_peers()
    }

    pub fn container_peer(&self, container_id: ContainerId) -> Option<&Peer> {
        self.meta.container_peer(container_id)
    }
}

/// Snapshot of containers and resources with per-container indexes.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    config: Config,
    containers: BTreeMap<ContainerId, ContainerRuntime>,
    resources: BTreeMap<ResourceId, ResourceRuntime>,
    /// Resources led by each container.
    leaders: HashMap<ContainerId, Vec<ResourceId>>,
    /// Resources where each container holds a non-leader peer.
    followers: HashMap<ContainerId, Vec<ResourceId>>,
}

impl Runtime {
    /// Bulk-load every container and resource from the store.
    pub async fn load(store: &dyn Store, config: &Config) -> SchedulerResult<Self> {
        let batch = config.load_batch_size.max(1);

        let mut containers = Vec::new();
        store
            .load_containers(batch, &mut |c: Container| containers.push(c))
            .await?;
        let mut resources = Vec::new();
        store
            .load_resources(batch, &mut |r: Resource| resources.push(r))
            .await?;

        let rt = Self::build(config.clone(), containers, resources);
        debug!(
            containers = rt.containers.len(),
            resources = rt.resources.len(),
            misreplicated = rt.misreplicated_resources().count(),
            "runtime loaded"
        );
        Ok(rt)
    }

    /// Assemble a runtime from already loaded metadata.
    pub fn build(config: Config, containers: Vec<Container>, resources: Vec<Resource>) -> Self {
        let mut rt = Self {
            config,
            ..Default::default()
        };
        for c in containers {
            rt.containers.insert(c.id, ContainerRuntime::new(c));
        }
        for r in resources {
            rt.index_resource(r);
        }
        rt
    }

    fn index_resource(&mut self, resource: Resource) {
        let id = resource.id;
        if resource.peers.len() != self.config.count_resource_replicas {
            warn!(
                resource = id,
                peers = resource.peers.len(),
                expected = self.config.count_resource_replicas,
                "resource replica count differs from configured count"
            );
        }
        for peer in &resource.peers {
            let Some(container) = self.containers.get_mut(&peer.container_id) else {
                warn!(
                    resource = id,
                    peer = peer.id,
                    container = peer.container_id,
                    "peer references unknown container, skipped"
                );
                continue;
            };
            container.resource_count += 1;
            if resource.leader_peer_id == Some(peer.id) {
                container.leader_count += 1;
                self.leaders.entry(peer.container_id).or_default().push(id);
            } else {
                self.followers.entry(peer.container_id).or_default().push(id);
            }
        }
        self.resources.insert(id, ResourceRuntime::new(resource));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// All containers ordered by id.
    pub fn containers(&self) -> Vec<&ContainerRuntime> {
        self.containers.values().collect()
    }

    pub fn container(&self, id: ContainerId) -> Option<&ContainerRuntime> {
        self.containers.get(&id)
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceRuntime> {
        self.resources.get(&id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceRuntime> {
        self.resources.values()
    }

    /// Resources whose peer count differs from `count_resource_replicas`.
    pub fn misreplicated_resources(&self) -> impl Iterator<Item = &ResourceRuntime> {
        let expected = self.config.count_resource_replicas;
        self.resources
            .values()
            .filter(move |r| r.peers().len() != expected)
    }

    /// Uniform pick among resources led by the container.
    pub fn rand_leader_resource(&self, container_id: ContainerId) -> Option<&ResourceRuntime> {
        self.rand_leader_resource_matching(container_id, |_| true)
    }

    /// Uniform pick among resources where the container holds a follower.
    pub fn rand_follower_resource(&self, container_id: ContainerId) -> Option<&ResourceRuntime> {
        self.rand_follower_resource_matching(container_id, |_| true)
    }

    pub fn rand_leader_resource_matching(
        &self,
        container_id: ContainerId,
        accept: impl Fn(&ResourceRuntime) -> bool,
    ) -> Option<&ResourceRuntime> {
        self.rand_from(self.leaders.get(&container_id), accept)
    }

    pub fn rand_follower_resource_matching(
        &self,
        container_id: ContainerId,
        accept: impl Fn(&ResourceRuntime) -> bool,
    ) -> Option<&ResourceRuntime> {
        self.rand_from(self.followers.get(&container_id), accept)
    }

    fn rand_from(
        &self,
        ids: Option<&Vec<ResourceId>>,
        accept: impl Fn(&ResourceRuntime) -> bool,
    ) -> Option<&ResourceRuntime> {
        let eligible: Vec<&ResourceRuntime> = ids?
            .iter()
            .filter_map(|id| self.resources.get(id))
            .filter(|r| accept(r))
            .collect();
        eligible.choose(&mut rand::rng()).copied()
    }

    /// Containers hosting a non-leader peer of the resource.
    pub fn resource_follower_containers(&self, resource: &ResourceRuntime) -> Vec<&ContainerRuntime> {
        resource
            .follower_peers()
            .filter_map(|p| self.containers.get(&p.container_id))
            .collect()
    }

    /// Containers hosting any peer of the resource.
    pub fn resource_containers(&self, resource: &ResourceRuntime) -> Vec<&ContainerRuntime> {
        resource
            .peers()
            .iter()
            .filter_map(|p| self.containers.get(&p.container_id))
            .collect()
    }

    /// Container hosting the resource's leader peer.
    pub fn resource_leader_container(&self, resource: &ResourceRuntime) -> Option<&ContainerRuntime> {
        resource
            .leader_peer()
            .and_then(|p| self.containers.get(&p.container_id))
    }
}

/// Placement diversity of `candidate` against `placement`.
///
/// For every other container in `placement`, find the first location
/// label (in `labels` order) where the two differ and add
/// `100^(labels.len() - index - 1)`. Identical locations add nothing, so
/// a difference at a higher-level label always outweighs any number of
/// lower-level differences for placements of fewer than 100 containers.
pub fn distinct_score(labels: &[String], placement: &[&ContainerRuntime], candidate: &ContainerRuntime) -> f64 {
    let depth = labels.len() as i32;
    placement
        .iter()
        .filter(|c| c.id() != candidate.id())
        .filter_map(|c| c.compare_location(candidate, labels))
        .map(|index| REPLICA_BASE_SCORE.powi(depth - index as i32 - 1))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["zone".into(), "rack".into(), "host".into()]
    }

    fn located(id: ContainerId, zone: &str, rack: &str, host: &str) -> ContainerRuntime {
        ContainerRuntime::new(
            Container::new(id, format!("10.0.0.{id}:20160"))
                .with_label("zone", zone)
                .with_label("rack", rack)
                .with_label("host", host),
        )
    }

    fn three_way(id: ResourceId, leader_on: ContainerId) -> Resource {
        let peers: Vec<Peer> = (1..=3).map(|c| Peer::new(id * 10 + c, c)).collect();
        let leader = peers.iter().find(|p| p.container_id == leader_on).map(|p| p.id);
        Resource::new(id, peers, leader)
    }

    #[test]
    fn counts_follow_peers() {
        let containers = (1..=3).map(|i| Container::new(i, "addr")).collect();
        let resources = vec![three_way(1, 1), three_way(2, 1), three_way(3, 2)];
        let rt = Runtime::build(Config::default(), containers, resources);

        let c1 = rt.container(1).unwrap();
        assert_eq!(c1.leader_count(), 2);
        assert_eq!(c1.resource_count(), 3);
        assert_eq!(rt.container(3).unwrap().leader_count(), 0);
        assert_eq!(rt.container(3).unwrap().resource_count(), 3);
    }

    #[test]
    fn rand_picks_respect_role() {
        let containers = (1..=3).map(|i| Container::new(i, "addr")).collect();
        let rt = Runtime::build(Config::default(), containers, vec![three_way(7, 2)]);

        assert_eq!(rt.rand_leader_resource(2).unwrap().id(), 7);
        assert!(rt.rand_leader_resource(1).is_none());
        assert_eq!(rt.rand_follower_resource(1).unwrap().id(), 7);
        assert!(rt.rand_follower_resource(2).is_none());
        assert!(rt.rand_follower_resource_matching(1, |_| false).is_none());
    }

    #[test]
    fn unknown_container_peer_is_skipped() {
        let containers = vec![Container::new(1, "a"), Container::new(2, "b")];
        let resource = Resource::new(1, vec![Peer::new(1, 1), Peer::new(2, 2), Peer::new(3, 99)], Some(3));
        let rt = Runtime::build(Config::default(), containers, vec![resource]);

        assert!(rt.container(99).is_none());
        let res = rt.resource(1).unwrap();
        assert_eq!(rt.resource_containers(res).len(), 2);
        assert!(rt.resource_leader_container(res).is_none());
        assert_eq!(rt.container(1).unwrap().resource_count(), 1);
    }

    #[test]
    fn misreplicated_resources_follow_configured_count() {
        let containers = (1..=3).map(|i| Container::new(i, "addr")).collect();
        let short = Resource::new(2, vec![Peer::new(21, 1), Peer::new(22, 2)], Some(21));
        let rt = Runtime::build(Config::default(), containers, vec![three_way(1, 1), short]);

        let ids: Vec<_> = rt.misreplicated_resources().map(|r| r.id()).collect();
        assert_eq!(ids, vec![2]);

        let mut cfg = Config::default();
        cfg.count_resource_replicas = 2;
        let containers = (1..=3).map(|i| Container::new(i, "addr")).collect();
        let short = Resource::new(2, vec![Peer::new(21, 1), Peer::new(22, 2)], Some(21));
        let rt = Runtime::build(cfg, containers, vec![three_way(1, 1), short]);
        let ids: Vec<_> = rt.misreplicated_resources().map(|r| r.id()).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn follower_containers_exclude_leader() {
        let containers = (1..=3).map(|i| Container::new(i, "addr")).collect();
        let rt = Runtime::build(Config::default(), containers, vec![three_way(1, 3)]);
        let res = rt.resource(1).unwrap();

        let ids: Vec<_> = rt.resource_follower_containers(res).iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(rt.resource_leader_container(res).unwrap().id(), 3);
    }

    #[test]
    fn leader_score_uses_weight() {
        let mut meta = Container::new(1, "a");
        meta.leader_weight = 2.0;
        let mut c = ContainerRuntime::new(meta);
        c.leader_count = 6;
        assert_eq!(c.leader_score(), 3.0);
        assert_eq!(c.score_with_delta(ResourceKind::Leader, -2), 2.0);

        let mut zero = ContainerRuntime::new(Container::new(2, "b"));
        zero.meta.leader_weight = 0.0;
        zero.leader_count = 4;
        assert_eq!(zero.leader_score(), 4.0);
    }

    #[test]
    fn compare_location_finds_first_difference() {
        let a = located(1, "z1", "r1", "h1");
        let b = located(2, "z1", "r2", "h1");
        let c = located(3, "z1", "r1", "h1");
        assert_eq!(a.compare_location(&b, &labels()), Some(1));
        assert_eq!(a.compare_location(&c, &labels()), None);
        assert_eq!(a.compare_location(&b, &[]), None);
    }

    #[test]
    fn distinct_score_weights_higher_labels() {
        let placed = [located(1, "z1", "r1", "h1"), located(2, "z1", "r1", "h2")];
        let placement: Vec<&ContainerRuntime> = placed.iter().collect();

        let other_zone = located(10, "z2", "r1", "h1");
        let other_rack = located(11, "z1", "r2", "h1");
        let other_host = located(12, "z1", "r1", "h3");
        let same_as_first = located(13, "z1", "r1", "h1");

        let zone = distinct_score(&labels(), &placement, &other_zone);
        let rack = distinct_score(&labels(), &placement, &other_rack);
        let host = distinct_score(&labels(), &placement, &other_host);
        let same = distinct_score(&labels(), &placement, &same_as_first);

        assert_eq!(zone, 20_000.0);
        assert_eq!(rack, 200.0);
        assert_eq!(host, 2.0);
        assert_eq!(same, 1.0);
        assert!(zone > rack && rack > host && host > same);
    }

    #[test]
    fn distinct_score_skips_candidate_itself() {
        let placed = [located(1, "z1", "r1", "h1"), located(2, "z2", "r1", "h1")];
        let placement: Vec<&ContainerRuntime> = placed.iter().collect();
        assert_eq!(distinct_score(&labels(), &placement, &placed[0]), 10_000.0);
    }

    #[test]
    fn missing_label_counts_as_empty() {
        let bare = ContainerRuntime::new(Container::new(1, "a"));
        let zoned = located(2, "z1", "r1", "h1");
        assert_eq!(distinct_score(&labels(), &[&bare], &zoned), 10_000.0);
        assert_eq!(distinct_score(&labels(), &[&bare], &ContainerRuntime::new(Container::new(3, "b"))), 0.0);
    }
}
