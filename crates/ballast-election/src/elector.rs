//! Elector — campaign loop, forced transfer, leader query, and stop.
//!
//! Keys used per group `g` (under `ElectorOptions::path_prefix`):
//!
//! - `{prefix}/{g}/leader`   — id of the current leader, bound to its lease
//! - `{prefix}/{g}/lock`     — activation lock (lock gating only)
//! - `{prefix}/{g}/transfer` — transfer hint written by `change_leader_to`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ballast_state::{LeadershipObserver, LeaseBackend, LeaseId, StateError};

use crate::error::{ElectionError, ElectionResult};
use crate::state::LeadershipState;

/// Election tunables.
#[derive(Debug, Clone)]
pub struct ElectorOptions {
    /// TTL of the leader lease. Must be positive.
    pub leader_lease_seconds: i64,
    /// Require the group lock before running `become_leader`.
    pub lock_if_become_leader: bool,
    pub path_prefix: String,
    /// Back-off after a failed round and while deferring to a transfer target.
    pub loop_interval: Duration,
}

impl Default for ElectorOptions {
    fn default() -> Self {
        Self {
            leader_lease_seconds: 5,
            lock_if_become_leader: false,
            path_prefix: "/ballast/election".to_string(),
            loop_interval: Duration::from_millis(200),
        }
    }
}

impl ElectorOptions {
    pub fn with_leader_lease_seconds(mut self, seconds: i64) -> Self {
        self.leader_lease_seconds = seconds;
        self
    }

    pub fn with_lock_if_become_leader(mut self, enabled: bool) -> Self {
        self.lock_if_become_leader = enabled;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }
}

/// Hint asking `from` to step down in favour of `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TransferHint {
    from: String,
    to: String,
}

/// Why a leader left the hold phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepDown {
    Stopped,
    LeaseLost,
    KeyLost,
    Transfer,
}

/// Per-group leader election built on a [`LeaseBackend`].
///
/// Cheap to clone; clones share the same groups and states.
#[derive(Clone)]
pub struct Elector {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn LeaseBackend>,
    options: ElectorOptions,
    ttl: Duration,
    /// Stop signal per group; removed (and fired) by `stop`.
    groups: Mutex<HashMap<u64, watch::Sender<bool>>>,
    states: Mutex<HashMap<(u64, String), watch::Sender<LeadershipState>>>,
}

impl Elector {
    /// Create an elector. Fails when the lease is not positive.
    pub fn new(backend: Arc<dyn LeaseBackend>, options: ElectorOptions) -> ElectionResult<Self> {
        if options.leader_lease_seconds <= 0 {
            return Err(ElectionError::InvalidLease(options.leader_lease_seconds));
        }
        let ttl = Duration::from_secs(options.leader_lease_seconds as u64);
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                options,
                ttl,
                groups: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> &ElectorOptions {
        &self.inner.options
    }

    /// Campaign for `group` as `id` until the group is stopped or
    /// `shutdown` turns true.
    ///
    /// Transient backend errors are logged and retried after the loop
    /// interval; they never end the loop.
    pub async fn election_loop(
        &self,
        group: u64,
        id: &str,
        observer: &dyn LeadershipObserver,
        shutdown: watch::Receiver<bool>,
    ) {
        let mut cancel = Cancel {
            group: self.group_stop(group),
            caller: shutdown,
        };
        let state = self.state_sender(group, id);
        state.send_replace(LeadershipState::Follower);
        info!(group, %id, "election loop started");

        while !cancel.is_cancelled() {
            if let Err(e) = self.run_round(group, id, observer, &state, &mut cancel).await {
                if e.is_transient() {
                    warn!(group, %id, error = %e, "election round failed, retrying");
                } else {
                    error!(group, %id, error = %e, "election round failed, retrying");
                }
                state.send_replace(LeadershipState::Follower);
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.options.loop_interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        state.send_replace(LeadershipState::Follower);
        info!(group, %id, "election loop exited");
    }

    /// Run one election round for `group` as `id` and return when it ends.
    ///
    /// The round waits for the leader key to be vacant, races for it and,
    /// if won, holds leadership until it is lost or handed over or the
    /// round is cancelled. Losing the race is not an error. Callers that
    /// want to keep campaigning loop around this; [`Elector::election_loop`]
    /// is that loop with back-off.
    pub async fn campaign(
        &self,
        group: u64,
        id: &str,
        observer: &dyn LeadershipObserver,
        shutdown: watch::Receiver<bool>,
    ) -> ElectionResult<()> {
        let mut cancel = Cancel {
            group: self.group_stop(group),
            caller: shutdown,
        };
        let state = self.state_sender(group, id);
        let result = self.run_round(group, id, observer, &state, &mut cancel).await;
        if result.is_err() {
            state.send_replace(LeadershipState::Follower);
        }
        result
    }

    /// Ask the leader `from_id` of `group` to hand leadership to `to_id`.
    ///
    /// Fails with [`ElectionError::NotLeader`] and changes nothing unless
    /// `from_id` is the recorded leader. The handover is best-effort:
    /// `from_id` always steps down, and while the hint lives only `to_id`
    /// may campaign. If `to_id` is not campaigning the hint expires after
    /// one lease TTL and another candidate wins; `from_id` stays out of
    /// the race for two TTLs.
    pub async fn change_leader_to(&self, group: u64, from_id: &str, to_id: &str) -> ElectionResult<()> {
        let backend = &self.inner.backend;
        let current = backend.get(&self.leader_key(group)).await?;
        if current.as_deref() != Some(from_id) {
            return Err(ElectionError::NotLeader {
                group,
                id: from_id.to_string(),
            });
        }

        let hint = TransferHint {
            from: from_id.to_string(),
            to: to_id.to_string(),
        };
        let value = serde_json::to_string(&hint).map_err(|e| StateError::Serialize(e.to_string()))?;
        let lease = backend.grant(self.inner.ttl).await?;
        backend.put(&self.transfer_key(group), &value, lease).await?;
        info!(group, from = %from_id, to = %to_id, "leader transfer requested");
        Ok(())
    }

    /// The identity currently recorded as leader of `group`.
    pub async fn current_leader(&self, group: u64) -> ElectionResult<String> {
        self.inner
            .backend
            .get(&self.leader_key(group))
            .await?
            .ok_or(ElectionError::NoLeader(group))
    }

    /// Terminate every election loop of `group`. Idempotent.
    pub fn stop(&self, group: u64) {
        let sender = self
            .inner
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&group);
        if let Some(tx) = sender {
            tx.send_replace(true);
            info!(group, "election group stopped");
        }
    }

    /// Last published state of `id` in `group`.
    pub fn state(&self, group: u64, id: &str) -> LeadershipState {
        *self.state_sender(group, id).borrow()
    }

    /// Follow state transitions of `id` in `group`.
    pub fn subscribe(&self, group: u64, id: &str) -> watch::Receiver<LeadershipState> {
        self.state_sender(group, id).subscribe()
    }

    // ── Round ─────────────────────────────────────────────────────

    async fn run_round(
        &self,
        group: u64,
        id: &str,
        observer: &dyn LeadershipObserver,
        state: &watch::Sender<LeadershipState>,
        cancel: &mut Cancel,
    ) -> ElectionResult<()> {
        if !self.wait_for_vacancy(group, id, cancel).await? {
            return Ok(());
        }

        if let Some(hint) = self.transfer_hint(group).await?
            && hint.to != id
        {
            debug!(group, %id, to = %hint.to, "deferring campaign to transfer target");
            tokio::select! {
                _ = tokio::time::sleep(self.inner.options.loop_interval) => {}
                _ = cancel.cancelled() => {}
            }
            return Ok(());
        }

        let backend = &self.inner.backend;
        let leader_key = self.leader_key(group);
        state.send_replace(LeadershipState::Campaigning);

        let lease = backend.grant(self.inner.ttl).await?;
        if !backend.create(&leader_key, id, lease).await? {
            backend.revoke(lease).await?;
            state.send_replace(LeadershipState::Follower);
            debug!(group, %id, "campaign lost");
            return Ok(());
        }
        let mut keep_alive = KeepAlive::spawn(Arc::clone(backend), lease, self.inner.ttl);

        let lock = if self.inner.options.lock_if_become_leader {
            match self.acquire_lock(group, id, &mut keep_alive, cancel).await {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    self.release(lease, keep_alive, None).await;
                    state.send_replace(LeadershipState::Follower);
                    return Ok(());
                }
                Err(e) => {
                    self.release(lease, keep_alive, None).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.clear_transfer_hint(group, id).await;

        // Leader is published only once the handler has returned.
        observer.become_leader().await;
        state.send_replace(LeadershipState::Leader);
        info!(group, %id, "became leader");

        let reason = self.hold(group, id, &mut keep_alive, cancel).await;
        info!(group, %id, ?reason, "stepping down");

        state.send_replace(LeadershipState::Follower);
        observer.become_follower().await;
        self.release(lease, keep_alive, lock).await;

        if reason == StepDown::Transfer {
            // The hint expires after one TTL; sit out one more so another
            // identity takes over even when the target never campaigns.
            tokio::select! {
                _ = tokio::time::sleep(self.inner.ttl.saturating_mul(2)) => {}
                _ = cancel.cancelled() => {}
            }
        }
        Ok(())
    }

    /// Wait until no leader is recorded. Returns false when cancelled.
    async fn wait_for_vacancy(&self, group: u64, id: &str, cancel: &mut Cancel) -> ElectionResult<bool> {
        let leader_key = self.leader_key(group);
        let mut leader = self.inner.backend.watch(&leader_key);
        loop {
            let current = leader.borrow_and_update().clone();
            match current {
                None => return Ok(true),
                Some(holder) if holder == id => {
                    // A previous round of this identity left the key behind.
                    warn!(group, %id, "stale leader key for own id, deleting");
                    self.inner.backend.delete_if(&leader_key, id).await?;
                }
                Some(_) => {
                    tokio::select! {
                        changed = leader.changed() => {
                            changed.map_err(|_| ElectionError::WatchClosed(leader_key.clone()))?;
                        }
                        _ = cancel.cancelled() => return Ok(false),
                    }
                }
            }
        }
    }

    /// Acquire the group lock while keeping the leader lease alive.
    ///
    /// Returns `None` when cancelled or when leadership was lost meanwhile.
    async fn acquire_lock(
        &self,
        group: u64,
        id: &str,
        keep_alive: &mut KeepAlive,
        cancel: &mut Cancel,
    ) -> ElectionResult<Option<LockGuard>> {
        let backend = &self.inner.backend;
        let lock_key = self.lock_key(group);
        let leader_key = self.leader_key(group);

        let lock_lease = backend.grant(self.inner.ttl).await?;
        let lock_keep_alive = KeepAlive::spawn(Arc::clone(backend), lock_lease, self.inner.ttl);
        let mut lock = backend.watch(&lock_key);
        let mut leader = backend.watch(&leader_key);
        leader.borrow_and_update();

        loop {
            if backend.create(&lock_key, id, lock_lease).await? {
                debug!(group, %id, "acquired leader lock");
                return Ok(Some(LockGuard {
                    lease: lock_lease,
                    keep_alive: lock_keep_alive,
                }));
            }
            if lock.borrow_and_update().is_none() {
                continue;
            }
            debug!(group, %id, "waiting for leader lock");

            let give_up = tokio::select! {
                changed = lock.changed() => changed.is_err(),
                _ = keep_alive.lost() => true,
                changed = leader.changed() => {
                    changed.is_err() || leader.borrow().as_deref() != Some(id)
                }
                _ = cancel.cancelled() => true,
            };
            if give_up {
                drop(lock_keep_alive);
                backend.revoke(lock_lease).await?;
                return Ok(None);
            }
        }
    }

    async fn hold(&self, group: u64, id: &str, keep_alive: &mut KeepAlive, cancel: &mut Cancel) -> StepDown {
        let backend = &self.inner.backend;
        let mut leader = backend.watch(&self.leader_key(group));
        let mut hint = backend.watch(&self.transfer_key(group));

        loop {
            if leader.borrow_and_update().as_deref() != Some(id) {
                return StepDown::KeyLost;
            }
            let requested = hint
                .borrow_and_update()
                .as_deref()
                .and_then(|raw| serde_json::from_str::<TransferHint>(raw).ok());
            if let Some(h) = requested
                && h.from == id
                && h.to != id
            {
                return StepDown::Transfer;
            }

            tokio::select! {
                changed = leader.changed() => {
                    if changed.is_err() {
                        return StepDown::KeyLost;
                    }
                }
                changed = hint.changed() => {
                    if changed.is_err() {
                        return StepDown::KeyLost;
                    }
                }
                _ = keep_alive.lost() => return StepDown::LeaseLost,
                _ = cancel.cancelled() => return StepDown::Stopped,
            }
        }
    }

    async fn release(&self, lease: LeaseId, keep_alive: KeepAlive, lock: Option<LockGuard>) {
        drop(keep_alive);
        let backend = &self.inner.backend;
        if let Err(e) = backend.revoke(lease).await {
            warn!(lease, error = %e, "failed to revoke leader lease");
        }
        if let Some(lock) = lock {
            let LockGuard { lease, keep_alive } = lock;
            drop(keep_alive);
            if let Err(e) = backend.revoke(lease).await {
                warn!(lease, error = %e, "failed to release leader lock");
            }
        }
    }

    async fn transfer_hint(&self, group: u64) -> ElectionResult<Option<TransferHint>> {
        let raw = self.inner.backend.get(&self.transfer_key(group)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    /// Drop a transfer hint addressed to `id` once it has taken over.
    async fn clear_transfer_hint(&self, group: u64, id: &str) {
        let key = self.transfer_key(group);
        let backend = &self.inner.backend;
        let Ok(Some(raw)) = backend.get(&key).await else {
            return;
        };
        let addressed_to_us = serde_json::from_str::<TransferHint>(&raw).is_ok_and(|h| h.to == id);
        if addressed_to_us && let Err(e) = backend.delete_if(&key, &raw).await {
            warn!(group, %id, error = %e, "failed to clear transfer hint");
        }
    }

    // ── Bookkeeping ───────────────────────────────────────────────

    fn group_stop(&self, group: u64) -> watch::Receiver<bool> {
        self.inner
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(group)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn state_sender(&self, group: u64, id: &str) -> watch::Sender<LeadershipState> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((group, id.to_string()))
            .or_insert_with(|| watch::channel(LeadershipState::Unknown).0)
            .clone()
    }

    fn leader_key(&self, group: u64) -> String {
        format!("{}/{group}/leader", self.inner.options.path_prefix)
    }

    fn lock_key(&self, group: u64) -> String {
        format!("{}/{group}/lock", self.inner.options.path_prefix)
    }

    fn transfer_key(&self, group: u64) -> String {
        format!("{}/{group}/transfer", self.inner.options.path_prefix)
    }
}

/// Cancellation from either the group (`stop`) or the caller.
struct Cancel {
    group: watch::Receiver<bool>,
    caller: watch::Receiver<bool>,
}

impl Cancel {
    fn is_cancelled(&self) -> bool {
        *self.group.borrow() || self.group.has_changed().is_err() || *self.caller.borrow()
    }

    async fn cancelled(&mut self) {
        tokio::select! {
            _ = wait_for_true(&mut self.group, true) => {}
            _ = wait_for_true(&mut self.caller, false) => {}
        }
    }
}

/// Resolve once the flag is true. A dropped sender counts as true only
/// when `closed_is_stop` is set; otherwise the future never resolves.
async fn wait_for_true(rx: &mut watch::Receiver<bool>, closed_is_stop: bool) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if closed_is_stop {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Background keep-alive for one lease; aborted on drop.
struct KeepAlive {
    lost: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    fn spawn(backend: Arc<dyn LeaseBackend>, lease: LeaseId, ttl: Duration) -> Self {
        let (lost_tx, lost) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl / 3);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = backend.keep_alive(lease).await {
                    warn!(lease, error = %e, "lease keep-alive failed");
                    lost_tx.send_replace(true);
                    return;
                }
            }
        });
        Self { lost, handle }
    }

    /// Resolve once the lease could not be renewed.
    async fn lost(&mut self) {
        wait_for_true(&mut self.lost, false).await;
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct LockGuard {
    lease: LeaseId,
    keep_alive: KeepAlive,
}
