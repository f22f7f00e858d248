//! ballast-election — lease-based leader election per election group.
//!
//! An election group is an independent leadership scope. For each group
//! the [`Elector`] guarantees that at most one campaigning identity has an
//! active `become_leader` transition at a time, with automatic failover
//! when the holder stops renewing its lease.
//!
//! # State machine
//!
//! ```text
//! Follower ──(leader key absent)──▶ Campaigning ──(CAS won [+ lock])──▶ Leader
//!    ▲                                   │                                │
//!    └──────────(CAS lost)───────────────┘                                │
//!    └──(stop / lease lost / key lost / transfer hint) ◀──────────────────┘
//! ```
//!
//! With lock gating enabled a second, lease-bound lock must be acquired
//! before `become_leader` runs, and it is released only after
//! `become_follower` returns, so the outgoing leader's follower handler
//! bounds the handover delay.

pub mod elector;
pub mod error;
pub mod state;

pub use ballast_state::LeadershipObserver;
pub use elector::{Elector, ElectorOptions};
pub use error::{ElectionError, ElectionResult};
pub use state::LeadershipState;
