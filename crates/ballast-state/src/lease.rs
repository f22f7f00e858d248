//! TTL leases and lease-bound keys.
//!
//! `LeaseBackend` is the slice of a linearizable coordination service
//! (etcd or equivalent) that leader election needs. `MemoryLeases` is the
//! in-process implementation: every operation takes one mutex, so the
//! create-if-absent check is linearizable within the process.
//!
//! Expired leases are purged lazily on every call and by a background
//! reaper task, so watchers observe the deletion of keys whose holder
//! stopped renewing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{StateError, StateResult};

/// Identifier of a granted lease.
pub type LeaseId = u64;

/// How often the reaper looks for expired leases.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Lease-bound key/value primitives.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Grant a lease that expires after `ttl` unless kept alive.
    async fn grant(&self, ttl: Duration) -> StateResult<LeaseId>;

    /// Push the lease deadline out by its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> StateResult<()>;

    /// Revoke a lease, deleting every key bound to it. Unknown leases are ignored.
    async fn revoke(&self, lease: LeaseId) -> StateResult<()>;

    /// Create `key` bound to `lease` only if the key is absent.
    async fn create(&self, key: &str, value: &str, lease: LeaseId) -> StateResult<bool>;

    /// Write `key` bound to `lease`, replacing any existing value.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> StateResult<()>;

    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    /// Delete `key` only if it currently holds `value`.
    async fn delete_if(&self, key: &str, value: &str) -> StateResult<bool>;

    /// Observe the value of `key`. The receiver starts at the current value.
    fn watch(&self, key: &str) -> watch::Receiver<Option<String>>;
}

struct Entry {
    value: String,
    lease: LeaseId,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    kv: HashMap<String, Entry>,
    watchers: HashMap<String, watch::Sender<Option<String>>>,
}

impl Inner {
    fn notify(&mut self, key: &str) {
        let value = self.kv.get(key).map(|e| e.value.clone());
        if let Some(tx) = self.watchers.get(key) {
            tx.send_replace(value);
        }
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(entry) = self.kv.remove(key) {
            if let Some(lease) = self.leases.get_mut(&entry.lease) {
                lease.keys.remove(key);
            }
            self.notify(key);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) {
        if let Some(lease) = self.leases.remove(&id) {
            for key in lease.keys {
                self.kv.remove(&key);
                self.notify(&key);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "lease expired");
            self.drop_lease(id);
        }
    }

    fn attach(&mut self, key: &str, value: &str, lease: LeaseId) -> StateResult<()> {
        let record = self
            .leases
            .get_mut(&lease)
            .ok_or(StateError::LeaseExpired(lease))?;
        record.keys.insert(key.to_string());
        if let Some(old) = self.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        ) && old.lease != lease
            && let Some(previous) = self.leases.get_mut(&old.lease)
        {
            previous.keys.remove(key);
        }
        self.notify(key);
        Ok(())
    }
}

/// In-process lease backend.
#[derive(Clone, Default)]
pub struct MemoryLeases {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLeases {
    /// Create a backend. Inside a tokio runtime a reaper task is spawned
    /// that expires leases even when no other call arrives.
    pub fn new() -> Self {
        let leases = Self::default();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&leases.inner);
            handle.spawn(reap_loop(weak));
        }
        leases
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.purge_expired(Instant::now());
        inner
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    fn grant_sync(&self, ttl: Duration) -> StateResult<LeaseId> {
        if ttl.is_zero() {
            return Err(StateError::InvalidTtl(ttl));
        }
        let deadline = Instant::now()
            .checked_add(ttl)
            .ok_or(StateError::InvalidTtl(ttl))?;
        let mut inner = self.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline,
                keys: HashSet::new(),
            },
        );
        trace!(lease = id, ?ttl, "lease granted");
        Ok(id)
    }

    fn keep_alive_sync(&self, lease: LeaseId) -> StateResult<()> {
        let mut inner = self.lock();
        let record = inner
            .leases
            .get_mut(&lease)
            .ok_or(StateError::LeaseExpired(lease))?;
        record.deadline = Instant::now()
            .checked_add(record.ttl)
            .ok_or(StateError::InvalidTtl(record.ttl))?;
        Ok(())
    }

    fn create_sync(&self, key: &str, value: &str, lease: LeaseId) -> StateResult<bool> {
        let mut inner = self.lock();
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.attach(key, value, lease)?;
        Ok(true)
    }

    fn delete_if_sync(&self, key: &str, value: &str) -> StateResult<bool> {
        let mut inner = self.lock();
        match inner.kv.get(key) {
            Some(entry) if entry.value == value => {
                inner.remove_key(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

async fn reap_loop(inner: Weak<Mutex<Inner>>) {
    let mut tick = tokio::time::interval(REAP_INTERVAL);
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.purge_expired(Instant::now());
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeases {
    async fn grant(&self, ttl: Duration) -> StateResult<LeaseId> {
        self.grant_sync(ttl)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
        self.keep_alive_sync(lease)
    }

    async fn revoke(&self, lease: LeaseId) -> StateResult<()> {
        self.lock().drop_lease(lease);
        trace!(lease, "lease revoked");
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, lease: LeaseId) -> StateResult<bool> {
        self.create_sync(key, value, lease)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> StateResult<()> {
        self.lock().attach(key, value, lease)
    }

    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        Ok(self.lock().kv.get(key).map(|e| e.value.clone()))
    }

    async fn delete_if(&self, key: &str, value: &str) -> StateResult<bool> {
        self.delete_if_sync(key, value)
    }

    fn watch(&self, key: &str) -> watch::Receiver<Option<String>> {
        let mut inner = self.lock();
        let current = inner.kv.get(key).map(|e| e.value.clone());
        let tx = inner
            .watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(current.clone()).0);
        tx.send_replace(current);
        tx.subscribe()
    }
}
