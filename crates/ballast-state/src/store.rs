//! The `Store` contract consumed by the leadership driver and the runtime.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use ballast_core::{Container, Node, Resource};

use crate::error::StateResult;
use crate::lease::LeaseBackend;

/// Path prefix of the process-level election on a store's lease backend.
pub const LEADER_PATH_PREFIX: &str = "/ballast/process";

/// Election group of the process-level leader.
pub const LEADER_GROUP: u64 = 0;

/// Key holding the process leader's signature:
/// `{LEADER_PATH_PREFIX}/{LEADER_GROUP}/leader`, the key an elector
/// campaigning on the store's lease backend writes.
pub const LEADER_KEY: &str = "/ballast/process/0/leader";

/// Transition handlers invoked when an identity gains or loses leadership.
///
/// Calls for one campaign are strictly ordered: `become_leader` completes
/// before the matching `become_follower` starts. Both must finish in
/// bounded time since a lock-gated handover waits on them.
#[async_trait]
pub trait LeadershipObserver: Send + Sync {
    async fn become_leader(&self);

    async fn become_follower(&self);
}

/// Linearizable coordination + metadata store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Try to become leader under a lease of `ttl_secs`.
    ///
    /// On success calls `observer.become_leader()` and does not return
    /// until leadership is lost (lease expiry, resignation, or `shutdown`),
    /// after which it calls `observer.become_follower()` and returns.
    async fn campaign_leader(
        &self,
        node: &Node,
        ttl_secs: i64,
        observer: &dyn LeadershipObserver,
        shutdown: watch::Receiver<bool>,
    ) -> StateResult<()>;

    /// Relinquish leadership. Fails when `node` is not the recorded leader.
    async fn resign_leader(&self, node: &Node) -> StateResult<()>;

    /// Point-in-time read of the recorded leader.
    async fn get_current_leader(&self) -> StateResult<Option<Node>>;

    /// Block until the recorded leader is gone or `shutdown` fires.
    async fn watch_leader(&self, shutdown: watch::Receiver<bool>);

    async fn put_resource(&self, resource: &Resource) -> StateResult<()>;

    async fn put_container(&self, container: &Container) -> StateResult<()>;

    /// Visit every resource, reading `limit` records per batch.
    async fn load_resources(
        &self,
        limit: u64,
        visit: &mut (dyn FnMut(Resource) + Send),
    ) -> StateResult<()>;

    /// Visit every container, reading `limit` records per batch.
    async fn load_containers(
        &self,
        limit: u64,
        visit: &mut (dyn FnMut(Container) + Send),
    ) -> StateResult<()>;

    /// Monotonically increasing unique identifier.
    async fn alloc_id(&self) -> StateResult<u64>;

    /// The lease backend holding [`LEADER_KEY`], for electors that campaign
    /// for the process leadership on this store.
    fn lease_backend(&self) -> Arc<dyn LeaseBackend>;
}
