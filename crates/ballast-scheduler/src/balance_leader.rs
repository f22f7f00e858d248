//! Leader balancing: move resource leaderships from the most loaded
//! container towards the least loaded one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use ballast_core::{Config, ContainerId, ResourceKind};

use crate::filter::{BlockFilter, ExcludedFilter, Filter, HealthFilter, StateFilter};
use crate::operator::Operator;
use crate::policy::{BalancePolicy, DefaultBalancePolicy};
use crate::runtime::{ContainerRuntime, ResourceRuntime, Runtime};
use crate::scheduler::Scheduler;
use crate::selector::{BalanceSelector, SCORE_EPSILON};

pub const BALANCE_LEADER_NAME: &str = "scheduler-rebalance-leader";

/// Outcome of one leader balancing attempt.
#[derive(Debug)]
pub enum TransferPlan<'a> {
    /// Nothing deviates from the average.
    Balanced,
    /// Move the leadership of `resource` from `source` to `target`.
    Transfer {
        resource: &'a ResourceRuntime,
        source: &'a ContainerRuntime,
        target: &'a ContainerRuntime,
    },
    /// The container anchoring this attempt has no valid move.
    Stuck(ContainerId),
}

/// Pick one leader transfer that brings the cluster closer to the
/// average leader score.
///
/// Whichever of the most and least loaded containers deviates more from
/// the average anchors the move. From the most loaded one, a random led
/// resource is moved to its least loaded follower; into the least loaded
/// one, a random resource it follows is taken over. Only candidates that
/// pass `should_balance` are drawn, so a valid move is found whenever one
/// exists for the anchor.
pub fn schedule_transfer_leader<'a>(
    rt: &'a Runtime,
    selector: &BalanceSelector,
    policy: &dyn BalancePolicy,
    extra: &[&dyn Filter],
) -> TransferPlan<'a> {
    let cfg = rt.config();
    let containers = rt.containers();
    if containers.is_empty() {
        return TransferPlan::Balanced;
    }

    let average =
        containers.iter().map(|c| c.leader_score()).sum::<f64>() / containers.len() as f64;

    let most = selector.select_source(cfg, &containers, &[], extra);
    let least = selector.select_target(cfg, &containers, &[], extra);
    let distance = |c: Option<&ContainerRuntime>| c.map_or(0.0, |c| (c.leader_score() - average).abs());
    let most_distance = distance(most);
    let least_distance = distance(least);

    if most_distance < SCORE_EPSILON && least_distance < SCORE_EPSILON {
        return TransferPlan::Balanced;
    }

    if most_distance > least_distance {
        let Some(source) = most else {
            return TransferPlan::Balanced;
        };
        let picked = rt.rand_leader_resource_matching(source.id(), |res| {
            follower_target(rt, selector, policy, source, res, extra).is_some()
        });
        let Some(resource) = picked else {
            return TransferPlan::Stuck(source.id());
        };
        match follower_target(rt, selector, policy, source, resource, extra) {
            Some(target) => TransferPlan::Transfer {
                resource,
                source,
                target,
            },
            None => TransferPlan::Stuck(source.id()),
        }
    } else {
        let Some(target) = least else {
            return TransferPlan::Balanced;
        };
        let leader_passes = |res: &ResourceRuntime| {
            rt.resource_leader_container(res).is_some_and(|leader| {
                selector.accepts_source(cfg, leader, extra)
                    && policy.should_balance(leader, target, ResourceKind::Leader)
            })
        };
        let picked = rt.rand_follower_resource_matching(target.id(), leader_passes);
        match picked.and_then(|res| rt.resource_leader_container(res).map(|source| (res, source))) {
            Some((resource, source)) => TransferPlan::Transfer {
                resource,
                source,
                target,
            },
            None => TransferPlan::Stuck(target.id()),
        }
    }
}

/// The least loaded eligible follower of `resource`, if moving the
/// leadership there from `source` is worth it.
fn follower_target<'a>(
    rt: &'a Runtime,
    selector: &BalanceSelector,
    policy: &dyn BalancePolicy,
    source: &ContainerRuntime,
    resource: &ResourceRuntime,
    extra: &[&dyn Filter],
) -> Option<&'a ContainerRuntime> {
    let followers = rt.resource_follower_containers(resource);
    let placement = rt.resource_containers(resource);
    selector
        .select_target(rt.config(), &followers, &placement, extra)
        .filter(|target| policy.should_balance(source, target, ResourceKind::Leader))
}

/// Balances leader score (`leader_count / leader_weight`) across containers.
pub struct BalanceLeaderScheduler {
    limit: u64,
    max_limit: u64,
    freeze: Duration,
    selector: BalanceSelector,
    policy: Arc<dyn BalancePolicy>,
    /// Containers skipped until the instant passes.
    frozen: HashMap<ContainerId, Instant>,
}

impl BalanceLeaderScheduler {
    pub fn new(cfg: &Config) -> Self {
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(BlockFilter),
            Box::new(StateFilter),
            Box::new(HealthFilter::new()),
        ];
        Self::with_filters(cfg, filters)
    }

    /// Build with a custom base filter set.
    pub fn with_filters(cfg: &Config, filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            limit: 1,
            max_limit: cfg.max_rebalance_leader,
            freeze: cfg.max_freeze_schedule_interval,
            selector: BalanceSelector::new(ResourceKind::Leader, filters),
            policy: Arc::new(DefaultBalancePolicy),
            frozen: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn BalancePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_frozen(&self, container_id: ContainerId) -> bool {
        self.frozen
            .get(&container_id)
            .is_some_and(|until| *until > Instant::now())
    }

    fn thaw(&mut self) {
        let now = Instant::now();
        self.frozen.retain(|_, until| *until > now);
    }
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        BALANCE_LEADER_NAME
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Leader
    }

    fn resource_limit(&self) -> u64 {
        self.limit.min(self.max_limit)
    }

    fn schedule(&mut self, rt: &Runtime) -> Option<Operator> {
        self.thaw();
        let frozen = ExcludedFilter::both(self.frozen.keys().copied());

        match schedule_transfer_leader(rt, &self.selector, self.policy.as_ref(), &[&frozen]) {
            TransferPlan::Balanced => None,
            TransferPlan::Stuck(container) => {
                debug!(container, freeze = ?self.freeze, "no leader move for container, freezing");
                self.frozen.insert(container, Instant::now() + self.freeze);
                None
            }
            TransferPlan::Transfer {
                resource,
                source,
                target,
            } => {
                let from_peer = resource.container_peer(source.id())?;
                let to_peer = resource.container_peer(target.id())?;
                self.limit = self
                    .policy
                    .adjust_limit(rt, ResourceKind::Leader, self.max_limit);
                debug!(
                    resource = resource.id(),
                    source = source.id(),
                    target = target.id(),
                    limit = self.limit,
                    "leader transfer scheduled"
                );
                Some(Operator::transfer_leader(
                    BALANCE_LEADER_NAME,
                    resource.id(),
                    *from_peer,
                    *to_peer,
                ))
            }
        }
    }
}
