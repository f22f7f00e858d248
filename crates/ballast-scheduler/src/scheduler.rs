//! The scheduler contract and the default scheduler set.

use ballast_core::{Config, ResourceKind};

use crate::balance_leader::BalanceLeaderScheduler;
use crate::balance_replica::BalanceReplicaScheduler;
use crate::error::SchedulerResult;
use crate::operator::Operator;
use crate::runtime::Runtime;

/// One balancing strategy. Each instance is driven serially.
pub trait Scheduler: Send {
    fn name(&self) -> &str;

    fn resource_kind(&self) -> ResourceKind;

    /// Operators of this kind allowed in flight right now.
    fn resource_limit(&self) -> u64;

    /// Called before a schedule cycle. An error skips the cycle.
    fn prepare(&mut self, _rt: &Runtime) -> SchedulerResult<()> {
        Ok(())
    }

    /// Called after a schedule cycle, whatever its outcome.
    fn cleanup(&mut self, _rt: &Runtime) {}

    /// Compute the next operator, or `None` when nothing should move.
    fn schedule(&mut self, rt: &Runtime) -> Option<Operator>;
}

/// Replica balance followed by leader balance.
pub fn default_schedulers(cfg: &Config) -> Vec<Box<dyn Scheduler>> {
    vec![
        Box::new(BalanceReplicaScheduler::new(cfg)),
        Box::new(BalanceLeaderScheduler::new(cfg)),
    ]
}
