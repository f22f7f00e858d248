//! LocalStore — single-process implementation of the store contract.
//!
//! Leadership lives in a [`MemoryLeases`] backend under [`LEADER_KEY`];
//! container/resource metadata and the ID counter live in redb. The
//! store is `Clone` + `Send` + `Sync` and can be shared across tasks;
//! clones share both the lease backend and the database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use ballast_core::{Container, Node, Resource};

use crate::error::{StateError, StateResult};
use crate::lease::{LeaseBackend, MemoryLeases};
use crate::store::{LEADER_KEY, LeadershipObserver, Store};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Embedded coordination + metadata store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    leases: MemoryLeases,
}

impl LocalStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            leases: MemoryLeases::new(),
        };
        store.ensure_tables()?;
        debug!(?path, "local store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            leases: MemoryLeases::new(),
        };
        store.ensure_tables()?;
        debug!("in-memory local store opened");
        Ok(store)
    }

    /// The lease backend shared with any elector built on this store.
    pub fn leases(&self) -> &MemoryLeases {
        &self.leases
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_record<T: Serialize>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        id: u64,
        record: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read one batch of up to `limit` records with keys `>= start`.
    fn read_batch<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        start: u64,
        limit: usize,
    ) -> StateResult<Vec<(u64, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut batch = Vec::with_capacity(limit);
        for entry in table.range(start..).map_err(map_err!(Read))?.take(limit) {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            batch.push((key.value(), record));
        }
        Ok(batch)
    }

    fn load_all<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        limit: u64,
        visit: &mut (dyn FnMut(T) + Send),
    ) -> StateResult<()> {
        let limit = limit.max(1) as usize;
        let mut start = 0u64;
        loop {
            let batch: Vec<(u64, T)> = self.read_batch(table, start, limit)?;
            let count = batch.len();
            let Some(last) = batch.last().map(|(key, _)| *key) else {
                break;
            };
            for (_, record) in batch {
                visit(record);
            }
            if count < limit || last == u64::MAX {
                break;
            }
            start = last + 1;
        }
        Ok(())
    }

    fn alloc_id_sync(&self) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(ALLOC_ID_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(ALLOC_ID_KEY, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn campaign_leader(
        &self,
        node: &Node,
        ttl_secs: i64,
        observer: &dyn LeadershipObserver,
        mut shutdown: watch::Receiver<bool>,
    ) -> StateResult<()> {
        let ttl = Duration::from_secs(ttl_secs.max(0) as u64);
        let signature = node.signature();

        let lease = self.leases.grant(ttl).await?;
        if !self.leases.create(LEADER_KEY, &signature, lease).await? {
            self.leases.revoke(lease).await?;
            let current = self.leases.get(LEADER_KEY).await?.unwrap_or_default();
            return Err(StateError::CampaignLost(current));
        }

        let mut leader = self.leases.watch(LEADER_KEY);
        leader.borrow_and_update();

        info!(node = %node, "campaign won");
        observer.become_leader().await;

        let mut keep_alive = tokio::time::interval(ttl / 3);
        keep_alive.tick().await;
        loop {
            tokio::select! {
                _ = keep_alive.tick() => {
                    if let Err(e) = self.leases.keep_alive(lease).await {
                        warn!(node = %node, error = %e, "leader lease lost");
                        break;
                    }
                }
                changed = leader.changed() => {
                    if changed.is_err() || leader.borrow().as_deref() != Some(signature.as_str()) {
                        info!(node = %node, "leader key changed, stepping down");
                        break;
                    }
                }
                _ = stopped(&mut shutdown) => {
                    debug!(node = %node, "campaign cancelled");
                    break;
                }
            }
        }

        // The follower handler runs before the key is released so a successor
        // never activates while this node still acts as leader.
        observer.become_follower().await;
        if let Err(e) = self.leases.revoke(lease).await {
            warn!(node = %node, error = %e, "failed to revoke leader lease");
        }
        Ok(())
    }

    async fn resign_leader(&self, node: &Node) -> StateResult<()> {
        if self.leases.delete_if(LEADER_KEY, &node.signature()).await? {
            info!(node = %node, "resigned leadership");
            Ok(())
        } else {
            Err(StateError::NotLeader(node.to_string()))
        }
    }

    async fn get_current_leader(&self) -> StateResult<Option<Node>> {
        match self.leases.get(LEADER_KEY).await? {
            Some(signature) => Node::from_signature(&signature)
                .map(Some)
                .ok_or(StateError::Deserialize(signature)),
            None => Ok(None),
        }
    }

    async fn watch_leader(&self, mut shutdown: watch::Receiver<bool>) {
        let mut leader = self.leases.watch(LEADER_KEY);
        loop {
            if leader.borrow_and_update().is_none() {
                return;
            }
            tokio::select! {
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = stopped(&mut shutdown) => return,
            }
        }
    }

    async fn put_resource(&self, resource: &Resource) -> StateResult<()> {
        self.put_record(RESOURCES, resource.id, resource)?;
        debug!(resource = resource.id, "resource stored");
        Ok(())
    }

    async fn put_container(&self, container: &Container) -> StateResult<()> {
        self.put_record(CONTAINERS, container.id, container)?;
        debug!(container = container.id, "container stored");
        Ok(())
    }

    async fn load_resources(
        &self,
        limit: u64,
        visit: &mut (dyn FnMut(Resource) + Send),
    ) -> StateResult<()> {
        self.load_all(RESOURCES, limit, visit)
    }

    async fn load_containers(
        &self,
        limit: u64,
        visit: &mut (dyn FnMut(Container) + Send),
    ) -> StateResult<()> {
        self.load_all(CONTAINERS, limit, visit)
    }

    async fn alloc_id(&self) -> StateResult<u64> {
        self.alloc_id_sync()
    }

    fn lease_backend(&self) -> Arc<dyn LeaseBackend> {
        Arc::new(self.leases.clone())
    }
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
