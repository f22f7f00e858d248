//! Scheduling loop — drives each scheduler on its own cadence.
//!
//! Every scheduler gets a spawned task. A tick runs only while this node
//! leads and a runtime snapshot is published:
//!
//! ```text
//! tick ─▶ reclaim expired ─▶ leader? ─▶ in flight < limit?
//!                                          │
//!             prepare ─▶ schedule (≤ retries) ─▶ track ─▶ sink.dispatch
//!                                          │
//!                                       cleanup
//! ```
//!
//! The cadence starts at `min_schedule_interval`, doubles after every idle
//! tick up to `max_schedule_interval`, and snaps back once an operator is
//! emitted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ballast_core::{Config, ResourceId, ResourceKind};
use ballast_scheduler::{Operator, OperatorTracker, Runtime, Scheduler};

use crate::leadership::{LeadershipDriver, wait_shutdown};

/// Receives every operator the loop emits. Execution is out of scope here;
/// the executor reports completion through [`ScheduleLoop::finish`].
#[async_trait]
pub trait OperatorSink: Send + Sync {
    async fn dispatch(&self, op: &Operator) -> anyhow::Result<()>;
}

/// Sink that only logs operators.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl OperatorSink for LoggingSink {
    async fn dispatch(&self, op: &Operator) -> anyhow::Result<()> {
        let action = serde_json::to_string(op.action())?;
        info!(scheduler = op.scheduler(), %action, "operator emitted: {op}");
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScheduleLoop {
    driver: LeadershipDriver,
    config: Config,
    sink: Arc<dyn OperatorSink>,
    tracker: Arc<Mutex<OperatorTracker>>,
    refresh_interval: Duration,
}

impl ScheduleLoop {
    pub fn new(driver: LeadershipDriver, config: Config, sink: Arc<dyn OperatorSink>) -> Self {
        Self {
            driver,
            config,
            sink,
            tracker: Arc::new(Mutex::new(OperatorTracker::new())),
            refresh_interval: Duration::from_secs(1),
        }
    }

    /// How often the leader reloads its runtime snapshot from the store.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Spawn one task per scheduler plus the runtime refresher.
    pub fn spawn(
        &self,
        schedulers: Vec<Box<dyn Scheduler>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(schedulers.len() + 1);
        for scheduler in schedulers {
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.run_scheduler(scheduler, shutdown).await;
            }));
        }
        let this = self.clone();
        handles.push(tokio::spawn(async move {
            this.run_refresher(shutdown).await;
        }));
        handles
    }

    /// Operators of `kind` currently in flight.
    pub fn in_flight(&self, kind: ResourceKind) -> u64 {
        self.lock_tracker().count(kind)
    }

    /// Report the operator on `resource_id` as done.
    pub fn finish(&self, resource_id: ResourceId) -> Option<Operator> {
        let op = self.lock_tracker().finish(resource_id);
        if let Some(op) = &op {
            debug!(resource = resource_id, age_ms = op.age().as_millis() as u64, "operator finished");
        }
        op
    }

    async fn run_scheduler(&self, mut scheduler: Box<dyn Scheduler>, mut shutdown: watch::Receiver<bool>) {
        let min = self.config.min_schedule_interval;
        let max = self.config.max_schedule_interval;
        let mut interval = min;
        info!(scheduler = scheduler.name(), "scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_shutdown(&mut shutdown) => break,
            }

            let emitted = self.tick(scheduler.as_mut()).await;
            interval = next_interval(interval, emitted, min, max);
        }

        info!(scheduler = scheduler.name(), "scheduler stopped");
    }

    /// One scheduling tick. Returns true when an operator was dispatched.
    async fn tick(&self, scheduler: &mut dyn Scheduler) -> bool {
        let expired = self
            .lock_tracker()
            .reclaim_expired(self.config.timeout_wait_operator_complete);
        for op in expired {
            warn!(resource = op.resource_id(), scheduler = op.scheduler(), "operator timed out");
        }

        if !self.driver.is_leader() {
            return false;
        }
        let Some(rt) = self.driver.runtime() else {
            return false;
        };

        let kind = scheduler.resource_kind();
        let in_flight = self.in_flight(kind);
        if in_flight >= scheduler.resource_limit() {
            debug!(
                scheduler = scheduler.name(),
                in_flight,
                limit = scheduler.resource_limit(),
                "operator limit reached"
            );
            return false;
        }

        let Some(op) = self.cycle(scheduler, &rt) else {
            return false;
        };
        if let Err(e) = self.sink.dispatch(&op).await {
            warn!(resource = op.resource_id(), error = %e, "operator dispatch failed");
            self.finish(op.resource_id());
            return false;
        }
        true
    }

    /// `prepare`, up to `max_schedule_retries` schedule attempts, `cleanup`.
    /// The emitted operator is already tracked.
    fn cycle(&self, scheduler: &mut dyn Scheduler, rt: &Runtime) -> Option<Operator> {
        if let Err(e) = scheduler.prepare(rt) {
            debug!(scheduler = scheduler.name(), error = %e, "prepare failed, skipping cycle");
            return None;
        }

        let mut emitted = None;
        for _ in 0..self.config.max_schedule_retries {
            let Some(op) = scheduler.schedule(rt) else {
                continue;
            };
            // A resource with an operator in flight is not touched twice.
            if self.lock_tracker().add(op.clone()) {
                emitted = Some(op);
                break;
            }
        }

        scheduler.cleanup(rt);
        emitted
    }

    async fn run_refresher(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval) => {}
                _ = wait_shutdown(&mut shutdown) => break,
            }
            if let Err(e) = self.driver.reload_runtime().await {
                warn!(error = %e, "failed to refresh runtime");
            }
        }
    }

    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, OperatorTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Snap back to `min` after an emitted operator, otherwise double up to `max`.
fn next_interval(current: Duration, emitted: bool, min: Duration, max: Duration) -> Duration {
    if emitted {
        min
    } else {
        current.saturating_mul(2).min(max)
    }
}
