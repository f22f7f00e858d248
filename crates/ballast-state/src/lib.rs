//! ballast-state — the coordination store contract for Ballast.
//!
//! Two seams are defined here:
//!
//! - **`LeaseBackend`** — linearizable key/value primitives with TTL leases
//!   (grant, keep-alive, revoke, create-if-absent, watch). The elector is
//!   built on these.
//! - **`Store`** — the process-level contract: leader campaign/resign/watch
//!   plus bulk metadata load, upsert and ID allocation.
//!
//! `LocalStore` implements both for a single process: leases live in memory
//! (`MemoryLeases`) and metadata is kept in [redb](https://docs.rs/redb),
//! on disk or in memory. A production deployment swaps in an etcd-backed
//! implementation of the same traits.

pub mod error;
pub mod lease;
pub mod local;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use lease::{LeaseBackend, LeaseId, MemoryLeases};
pub use local::LocalStore;
pub use store::{LEADER_GROUP, LEADER_KEY, LEADER_PATH_PREFIX, LeadershipObserver, Store};
