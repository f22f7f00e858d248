//! Replica balancing: move one replica from the container hosting the most
//! resources to one hosting fewer, without weakening placement diversity.

use std::sync::Arc;

use tracing::debug;

use ballast_core::{Config, ResourceKind};

use crate::filter::{
    BlockFilter, DistinctScoreFilter, ExcludedFilter, Filter, HealthFilter, StateFilter,
    StorageThresholdFilter,
};
use crate::operator::Operator;
use crate::policy::{BalancePolicy, DefaultBalancePolicy};
use crate::runtime::{ContainerRuntime, ResourceRuntime, Runtime};
use crate::scheduler::Scheduler;
use crate::selector::BalanceSelector;

pub const BALANCE_REPLICA_NAME: &str = "scheduler-rebalance-replica";

pub struct BalanceReplicaScheduler {
    limit: u64,
    max_limit: u64,
    selector: BalanceSelector,
    policy: Arc<dyn BalancePolicy>,
}

impl BalanceReplicaScheduler {
    pub fn new(cfg: &Config) -> Self {
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(BlockFilter),
            Box::new(StateFilter),
            Box::new(HealthFilter::new()),
        ];
        Self::with_filters(cfg, filters)
    }

    pub fn with_filters(cfg: &Config, filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            limit: 1,
            max_limit: cfg.max_rebalance_replica,
            selector: BalanceSelector::new(ResourceKind::Replica, filters),
            policy: Arc::new(DefaultBalancePolicy),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn BalancePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// A random resource on `source` with a valid new home. Followers move
    /// without disturbing leadership, so they are tried first.
    fn pick_move<'a>(
        &self,
        rt: &'a Runtime,
        source: &ContainerRuntime,
    ) -> Option<(&'a ResourceRuntime, &'a ContainerRuntime)> {
        let movable = |res: &ResourceRuntime| self.replica_target(rt, source, res).is_some();
        let resource = rt
            .rand_follower_resource_matching(source.id(), movable)
            .or_else(|| rt.rand_leader_resource_matching(source.id(), movable))?;
        let target = self.replica_target(rt, source, resource)?;
        Some((resource, target))
    }

    /// Best new home for the replica of `resource` on `source`.
    fn replica_target<'a>(
        &self,
        rt: &'a Runtime,
        source: &ContainerRuntime,
        resource: &ResourceRuntime,
    ) -> Option<&'a ContainerRuntime> {
        let cfg = rt.config();
        let placement = rt.resource_containers(resource);
        let hosting = ExcludedFilter::new([], placement.iter().map(|c| c.id()));
        let distinct = DistinctScoreFilter::new(&cfg.location_labels, &placement, source);
        let kept: Vec<&ContainerRuntime> = placement
            .iter()
            .copied()
            .filter(|c| c.id() != source.id())
            .collect();

        let candidates = rt.containers();
        self.selector
            .select_target(
                cfg,
                &candidates,
                &kept,
                &[&StorageThresholdFilter, &hosting, &distinct],
            )
            .filter(|target| self.policy.should_balance(source, target, ResourceKind::Replica))
    }
}

impl Scheduler for BalanceReplicaScheduler {
    fn name(&self) -> &str {
        BALANCE_REPLICA_NAME
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Replica
    }

    fn resource_limit(&self) -> u64 {
        self.limit.min(self.max_limit)
    }

    fn schedule(&mut self, rt: &Runtime) -> Option<Operator> {
        let containers = rt.containers();
        let mut tried = Vec::new();

        // Walk sources from the most loaded down until one has a movable replica.
        let (resource, source, target) = loop {
            let skip = ExcludedFilter::new(tried.iter().copied(), []);
            let source = self
                .selector
                .select_source(rt.config(), &containers, &[], &[&skip])?;
            if let Some((resource, target)) = self.pick_move(rt, source) {
                break (resource, source, target);
            }
            tried.push(source.id());
        };
        let from_peer = *resource.container_peer(source.id())?;

        self.limit = self
            .policy
            .adjust_limit(rt, ResourceKind::Replica, self.max_limit);
        debug!(
            resource = resource.id(),
            source = source.id(),
            target = target.id(),
            limit = self.limit,
            "replica move scheduled"
        );
        Some(Operator::move_replica(
            BALANCE_REPLICA_NAME,
            resource.id(),
            from_peer,
            target.id(),
        ))
    }
}
