//! Leadership driver — one per process.
//!
//! Campaigns for the process-level leader key with an [`Elector`] running
//! on the store's lease backend, so lock gating and leader transfer apply
//! to the process leader too. While this node leads, a freshly loaded
//! `Runtime` is published for the schedulers; otherwise the recorded
//! leader is remembered for forwarding and the driver waits for it to go
//! away.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ballast_core::{Config, Node};
use ballast_election::{ElectionResult, Elector, ElectorOptions, LeadershipState};
use ballast_scheduler::{Runtime, SchedulerResult};
use ballast_state::{LEADER_GROUP, LEADER_PATH_PREFIX, LeadershipObserver, Store};

/// Driver tunables.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// TTL of the leader lease in seconds.
    pub lease_ttl_secs: i64,
    /// Hold the leader lock from before `become_leader` until after
    /// `become_follower`, so a successor never overlaps the outgoing leader.
    pub lock_if_become_leader: bool,
    /// Back-off after a failed store call.
    pub loop_interval: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 5,
            lock_if_become_leader: false,
            loop_interval: Duration::from_millis(200),
        }
    }
}

/// Handle to the process-level leadership state. Cheap to clone.
#[derive(Clone)]
pub struct LeadershipDriver {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn Store>,
    elector: Elector,
    node: Node,
    config: Config,
    options: DriverOptions,
    state: watch::Sender<LeadershipState>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    leader: RwLock<Option<Node>>,
    /// Bumped every time an election round settles.
    settled: watch::Sender<u64>,
}

impl LeadershipDriver {
    /// Fails when the lease TTL is not positive.
    pub fn new(
        store: Arc<dyn Store>,
        node: Node,
        config: Config,
        options: DriverOptions,
    ) -> ElectionResult<Self> {
        let elector = Elector::new(
            store.lease_backend(),
            ElectorOptions::default()
                .with_path_prefix(LEADER_PATH_PREFIX)
                .with_leader_lease_seconds(options.lease_ttl_secs)
                .with_lock_if_become_leader(options.lock_if_become_leader)
                .with_loop_interval(options.loop_interval),
        )?;
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                elector,
                node,
                config,
                options,
                state: watch::channel(LeadershipState::Unknown).0,
                runtime: RwLock::new(None),
                leader: RwLock::new(None),
                settled: watch::channel(0).0,
            }),
        })
    }

    /// Spawn the election loop and wait until the first round settles
    /// (this node leads with a loaded runtime, or another leader is known).
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut settled = self.shared.settled.subscribe();
        let shared = self.shared.clone();
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            shared.run(loop_shutdown).await;
        });

        let mut shutdown = shutdown;
        tokio::select! {
            _ = settled.wait_for(|n| *n > 0) => {
                info!(node = %self.shared.node, leader = self.is_leader(), "election settled");
            }
            _ = wait_shutdown(&mut shutdown) => {}
        }
        handle
    }

    pub fn node(&self) -> &Node {
        &self.shared.node
    }

    pub fn is_leader(&self) -> bool {
        self.shared.state.borrow().is_leader()
    }

    pub fn state(&self) -> LeadershipState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.shared.state.subscribe()
    }

    /// The runtime snapshot; `None` unless this node leads.
    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.shared
            .runtime
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The last known leader, for forwarding requests.
    pub fn leader_node(&self) -> Option<Node> {
        self.shared
            .leader
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask this node, the current leader, to hand leadership to `to`.
    ///
    /// This node steps down and sits out while `to` campaigns; if `to` never
    /// does, another node wins once the request expires.
    pub async fn transfer_leadership(&self, to: &Node) -> ElectionResult<()> {
        self.shared
            .elector
            .change_leader_to(LEADER_GROUP, &self.shared.node.signature(), &to.signature())
            .await
    }

    /// Replace the runtime snapshot with a fresh load. No-op unless leader.
    pub async fn reload_runtime(&self) -> SchedulerResult<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let rt = Runtime::load(self.shared.store.as_ref(), &self.shared.config).await?;
        // Leadership may have ended during the load.
        if self.is_leader() {
            self.shared.publish_runtime(Some(Arc::new(rt)));
        }
        Ok(())
    }
}

impl Shared {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.node, "leader election loop started");
        let observer = Activation { shared: self };
        let signature = self.node.signature();

        while !*shutdown.borrow() {
            match self.store.get_current_leader().await {
                Err(e) => {
                    if e.is_transient() {
                        warn!(error = %e, "failed to read current leader");
                    } else {
                        error!(error = %e, "failed to read current leader");
                    }
                    self.back_off(&mut shutdown).await;
                    continue;
                }
                Ok(Some(leader)) if leader.is_same(&self.node) => {
                    // Left over from an earlier campaign of this node, possibly
                    // under another address.
                    warn!(leader = %leader, "leader matches this node, resigning to campaign again");
                    if let Err(e) = self.store.resign_leader(&leader).await {
                        warn!(error = %e, "failed to resign stale leadership");
                        self.back_off(&mut shutdown).await;
                        continue;
                    }
                }
                Ok(Some(leader)) => {
                    info!(leader = %leader, "following leader");
                    self.set_leader(Some(leader));
                    self.state.send_replace(LeadershipState::Follower);
                    self.notify_settled();
                    self.store.watch_leader(shutdown.clone()).await;
                    debug!("leader gone, campaigning");
                }
                Ok(None) => {}
            }

            if *shutdown.borrow() {
                break;
            }
            self.state.send_replace(LeadershipState::Campaigning);
            let result = self
                .elector
                .campaign(LEADER_GROUP, &signature, &observer, shutdown.clone())
                .await;
            if let Err(e) = result {
                if e.is_transient() {
                    warn!(error = %e, "campaign failed, retrying");
                } else {
                    error!(error = %e, "campaign failed");
                }
                self.state.send_replace(LeadershipState::Follower);
                self.back_off(&mut shutdown).await;
            }
        }

        self.state.send_replace(LeadershipState::Follower);
        self.publish_runtime(None);
        info!(node = %self.node, "leader election loop exited");
    }

    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.loop_interval) => {}
            _ = wait_shutdown(shutdown) => {}
        }
    }

    fn publish_runtime(&self, rt: Option<Arc<Runtime>>) {
        *self.runtime.write().unwrap_or_else(|e| e.into_inner()) = rt;
    }

    fn set_leader(&self, leader: Option<Node>) {
        *self.leader.write().unwrap_or_else(|e| e.into_inner()) = leader;
    }

    fn notify_settled(&self) {
        self.settled.send_modify(|n| *n += 1);
    }
}

/// Transition handlers handed to the elector.
struct Activation<'a> {
    shared: &'a Shared,
}

#[async_trait]
impl LeadershipObserver for Activation<'_> {
    async fn become_leader(&self) {
        let shared = self.shared;
        info!(node = %shared.node, "became leader");
        match Runtime::load(shared.store.as_ref(), &shared.config).await {
            Ok(rt) => shared.publish_runtime(Some(Arc::new(rt))),
            Err(e) => error!(error = %e, "failed to load runtime, scheduling paused until reload"),
        }
        shared.set_leader(Some(shared.node.clone()));
        shared.state.send_replace(LeadershipState::Leader);
        shared.notify_settled();
    }

    async fn become_follower(&self) {
        let shared = self.shared;
        shared.state.send_replace(LeadershipState::Follower);
        shared.publish_runtime(None);
        shared.set_leader(None);
        info!(node = %shared.node, "became follower");
    }
}

/// Resolve once `shutdown` is true; never if its sender is gone.
pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::Container;
    use ballast_election::ElectionError;
    use ballast_state::{LEADER_KEY, LeaseBackend, LocalStore};

    fn options() -> DriverOptions {
        DriverOptions {
            lease_ttl_secs: 1,
            loop_interval: Duration::from_millis(50),
            ..DriverOptions::default()
        }
    }

    fn driver(store: &LocalStore, id: u64) -> LeadershipDriver {
        LeadershipDriver::new(
            Arc::new(store.clone()),
            Node::new(id, format!("node-{id}"), format!("127.0.0.1:{}", 7000 + id)),
            Config::default(),
            options(),
        )
        .unwrap()
    }

    #[test]
    fn non_positive_lease_is_rejected() {
        let store = LocalStore::open_in_memory().unwrap();
        let result = LeadershipDriver::new(
            Arc::new(store),
            Node::new(1, "node-1", "a"),
            Config::default(),
            DriverOptions {
                lease_ttl_secs: 0,
                ..options()
            },
        );
        assert!(matches!(result, Err(ElectionError::InvalidLease(0))));
    }

    #[tokio::test]
    async fn lone_node_leads_with_runtime() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_container(&Container::new(1, "a")).await.unwrap();
        let d = driver(&store, 1);
        let (tx, rx) = watch::channel(false);

        let handle = d.start(rx).await;
        assert!(d.is_leader());
        assert_eq!(d.runtime().unwrap().containers().len(), 1);
        assert!(d.leader_node().unwrap().is_same(d.node()));

        tx.send_replace(true);
        handle.await.unwrap();
        assert!(!d.is_leader());
        assert!(d.runtime().is_none());
    }

    #[tokio::test]
    async fn stale_own_key_is_resigned() {
        let store = LocalStore::open_in_memory().unwrap();
        let node = Node::new(1, "node-1", "old-addr:7000");
        let lease = store.leases().grant(Duration::from_secs(30)).await.unwrap();
        store
            .leases()
            .create(LEADER_KEY, &node.signature(), lease)
            .await
            .unwrap();

        let d = driver(&store, 1);
        let (tx, rx) = watch::channel(false);
        let handle = d.start(rx).await;
        assert!(d.is_leader());

        tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn elected_leader_is_recorded_in_the_store() {
        let store = LocalStore::open_in_memory().unwrap();
        let d = driver(&store, 1);
        let (tx, rx) = watch::channel(false);
        let handle = d.start(rx).await;

        let leader = store.get_current_leader().await.unwrap().unwrap();
        assert!(leader.is_same(d.node()));
        assert_eq!(
            store.leases().get(LEADER_KEY).await.unwrap(),
            Some(d.node().signature())
        );

        tx.send_replace(true);
        handle.await.unwrap();
        assert!(store.get_current_leader().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_gated_driver_leads() {
        let store = LocalStore::open_in_memory().unwrap();
        let d = LeadershipDriver::new(
            Arc::new(store.clone()),
            Node::new(1, "node-1", "127.0.0.1:7001"),
            Config::default(),
            DriverOptions {
                lock_if_become_leader: true,
                ..options()
            },
        )
        .unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = d.start(rx).await;
        assert!(d.is_leader());
        assert!(
            store
                .leases()
                .get(&format!("{LEADER_PATH_PREFIX}/{LEADER_GROUP}/lock"))
                .await
                .unwrap()
                .is_some()
        );

        tx.send_replace(true);
        handle.await.unwrap();
        assert!(!d.is_leader());
    }

    #[tokio::test]
    async fn follower_cannot_transfer_leadership() {
        let store = LocalStore::open_in_memory().unwrap();
        let d = driver(&store, 1);
        let err = d
            .transfer_leadership(&Node::new(2, "node-2", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ElectionError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn reload_is_noop_for_follower() {
        let store = LocalStore::open_in_memory().unwrap();
        let d = driver(&store, 1);
        d.reload_runtime().await.unwrap();
        assert!(d.runtime().is_none());
        assert_eq!(d.state(), LeadershipState::Unknown);
    }
}
