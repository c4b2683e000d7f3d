//! Coordinated shutdown for the admin endpoint.
//!
//! One [`ShutdownController`] is shared by the HTTP module, the health
//! handlers, and the binary's signal loop. The shutdown RPC and SIGINT both
//! funnel into [`trigger_shutdown`](ShutdownController::trigger_shutdown);
//! every admin call holds an [`InFlightGuard`] so draining can wait for the
//! calls that are already past the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// Health state
// ---------------------------------------------------------------------------

/// Lifecycle of the admin endpoint as reported by `/healthz`.
///
/// Moves strictly forward: `Starting` until the listener is bound, `Ready`
/// while serving, `Draining` once shutdown is triggered, `Stopped` when the
/// last in-flight call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<HealthState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    /// Mark the endpoint ready. Called once the listener is bound.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// A receiver that flips to `true` when shutdown is triggered. The server
    /// loop selects on this to start its graceful teardown.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Flip into `Draining` and wake every shutdown receiver. Idempotent.
    pub fn trigger_shutdown(&self) {
        if **self.state.load() == HealthState::Draining {
            return;
        }
        info!("shutdown triggered, draining in-flight admin calls");
        self.state.store(Arc::new(HealthState::Draining));
        // Send fails only when no receiver is alive, which means nothing is
        // serving anymore.
        let _ = self.signal.send(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Count one admin call for the lifetime of the returned guard.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every in-flight call has finished or `timeout` elapses.
    ///
    /// Returns `true` when the endpoint fully drained; the state ends at
    /// `Stopped` on success and stays `Draining` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                info!(
                    remaining = self.in_flight_count(),
                    "drain timed out with calls still in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.state.store(Arc::new(HealthState::Stopped));
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count when dropped, panics included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
