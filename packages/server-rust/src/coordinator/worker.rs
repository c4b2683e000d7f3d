//! Background workers driving the coordinator's periodic engines.
//!
//! A [`TickWorker`] owns one tokio task that calls its [`TickRunnable`] at a
//! fixed period until stopped. The daemon runs three of them: the migration
//! engine, the replication-sync engine and the stats poller. Ticks never
//! overlap themselves; a tick that runs long simply delays the next one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::core::Coordinator;

// ---------------------------------------------------------------------------
// TickRunnable trait
// ---------------------------------------------------------------------------

/// Periodic job executed by a [`TickWorker`].
#[async_trait]
pub trait TickRunnable: Send + 'static {
    /// Worker name used in logs.
    const NAME: &'static str;

    /// One pass of the job. Called once per period, never concurrently with
    /// itself. The first call happens one period after start, not
    /// immediately.
    async fn on_tick(&mut self);

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn on_shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// TickWorker
// ---------------------------------------------------------------------------

/// Handle to one spawned periodic worker.
pub struct TickWorker {
    name: &'static str,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TickWorker {
    /// Start a worker tokio task calling `runnable` every `period`.
    pub fn start<R: TickRunnable>(mut runnable: R, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // A tick may outlast the period; run late instead of bursting
            // to catch up.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick so on_tick doesn't fire at
            // startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.on_shutdown().await;
            debug!(worker = R::NAME, "worker drained");
        });

        info!(worker = R::NAME, period_ms = period.as_millis() as u64, "worker started");
        Self {
            name: R::NAME,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stop the worker gracefully, waiting for the task to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.await.is_err() {
                warn!(worker = self.name, "worker task panicked");
            } else {
                info!(worker = self.name, "worker stopped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator runnables
// ---------------------------------------------------------------------------

/// Drives queued slot migrations and settles expansion-plan watches.
pub struct MigrationRunnable {
    coordinator: Arc<Coordinator>,
}

impl MigrationRunnable {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl TickRunnable for MigrationRunnable {
    const NAME: &'static str = "migration-engine";

    async fn on_tick(&mut self) {
        self.coordinator.tick_slot_actions().await;
        self.coordinator.settle_plan_watches().await;
    }
}

/// Drives queued replication sync actions.
pub struct ReplicationRunnable {
    coordinator: Arc<Coordinator>,
}

impl ReplicationRunnable {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl TickRunnable for ReplicationRunnable {
    const NAME: &'static str = "replication-sync";

    async fn on_tick(&mut self) {
        self.coordinator.tick_sync_actions().await;
    }
}

/// Refreshes the stats registry from every server, proxy and watchdog.
pub struct PollRunnable {
    coordinator: Arc<Coordinator>,
}

impl PollRunnable {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl TickRunnable for PollRunnable {
    const NAME: &'static str = "stats-poller";

    async fn on_tick(&mut self) {
        // Spread polls out so restarts don't probe the whole fleet in
        // lockstep.
        let jitter = rand::rng().random_range(0..100);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        self.coordinator.poll_once().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
