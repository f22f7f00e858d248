//! ballast-scheduler — cluster model and rebalancing decisions.
//!
//! Turns a snapshot of the cluster into at most one corrective operator
//! per scheduler per cycle:
//!
//! - `Runtime` holds containers and resources loaded from a `Store`, with
//!   per-container leader/follower indexes and derived scores
//! - `Filter`s and the `BalanceSelector` pick the source and target of a
//!   move, breaking ties by placement diversity (`distinct_score`)
//! - `Scheduler` implementations emit `Operator`s; a `BalancePolicy`
//!   decides whether a move is worth it and how many may run at once
//!
//! # Architecture
//!
//! ```text
//! Store ──load──▶ Runtime ──▶ Scheduler::schedule
//!                               ├── BalanceSelector (filters, distinct score)
//!                               ├── BalancePolicy (should_balance, adjust_limit)
//!                               └──▶ Operator ──▶ OperatorTracker (in flight)
//! ```

pub mod balance_leader;
pub mod balance_replica;
pub mod error;
pub mod filter;
pub mod operator;
pub mod policy;
pub mod runtime;
pub mod scheduler;
pub mod selector;

pub use balance_leader::{BALANCE_LEADER_NAME, BalanceLeaderScheduler, TransferPlan, schedule_transfer_leader};
pub use balance_replica::{BALANCE_REPLICA_NAME, BalanceReplicaScheduler};
pub use error::{SchedulerError, SchedulerResult};
pub use filter::{
    BlockFilter, DistinctScoreFilter, ExcludedFilter, Filter, HealthFilter, StateFilter,
    StorageThresholdFilter,
};
pub use operator::{Operator, OperatorAction, OperatorTracker};
pub use policy::{BalancePolicy, DefaultBalancePolicy};
pub use runtime::{ContainerRuntime, ResourceRuntime, Runtime, distinct_score};
pub use scheduler::{Scheduler, default_schedulers};
pub use selector::BalanceSelector;
