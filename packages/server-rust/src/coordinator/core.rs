//! Coordinator state and the topology write path.
//!
//! The coordinator is the only writer of cluster topology. Every mutation
//! follows the same discipline: read a fresh snapshot from the store, apply
//! and re-validate the change against it, then submit with compare-and-swap.
//! Interrupted writers can therefore never resurrect overwritten state; they
//! lose the swap and retry from the winner's document.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use serde::Serialize;
use shardhelm_core::{
    ExpansionPlan, Group, PlanAction, PlanStep, Proxy, ProxyAdmin, ProxyStats, SentinelGate,
    ServerCommands, ServerStatus, SlotMapping, Topology,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::CoordConfig;
use super::poller::{Probe, StatsRegistry};
use super::reconciler::MasterConflict;
use crate::error::CoordError;
use crate::store::{Snapshot, StoreError, TopologyStore};

/// Longest interval (seconds) the engine will sleep between migration
/// batches of one slot.
pub const MAX_ACTION_INTERVAL_SECS: u64 = 600;

/// Stale-write retries before a mutation gives the conflict back to the
/// caller.
const MAX_CAS_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Self-description of this coordinator instance, exposed on the model
/// endpoints so tooling can tell instances and restarts apart.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorModel {
    pub cluster: String,
    pub admin_addr: String,
    /// Random per-process token, fresh on every start.
    pub token: String,
    pub start_unix: u64,
    pub pid: u32,
    pub build_version: String,
}

impl CoordinatorModel {
    fn new(config: &CoordConfig) -> Self {
        Self {
            cluster: config.cluster.clone(),
            admin_addr: config.admin_addr.clone(),
            token: uuid::Uuid::new_v4().simple().to_string(),
            start_unix: unix_secs(),
            pid: std::process::id(),
            build_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    config: CoordConfig,
    model: CoordinatorModel,
    store: Arc<dyn TopologyStore>,
    servers: Arc<dyn ServerCommands>,
    proxies: Arc<dyn ProxyAdmin>,
    sentinels: Arc<dyn SentinelGate>,
    /// Last snapshot this process read or wrote. Reads of cluster state go
    /// through here; writes always re-read the store first.
    cache: ArcSwap<Snapshot>,
    registry: StatsRegistry,
    plans: Mutex<Vec<ExpansionPlan>>,
    /// Seconds to sleep between migration batches of one slot. Not
    /// persisted; restarts reset it to 0.
    action_interval_secs: AtomicU64,
    /// Migration engine kill switch. Not persisted.
    action_disabled: AtomicBool,
    /// Slots with a batch loop running right now.
    executing: AtomicUsize,
    /// Operator-facing one-line progress of the most recent migration work.
    progress: ArcSwapOption<String>,
    /// Give-up deadline per plan whose slot migrations are being watched.
    /// In-memory only; a restart re-arms from the persisted plan step.
    plan_watches: DashMap<u64, Instant>,
}

impl Coordinator {
    /// Load topology and plans from the store and build the coordinator.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or an unreadable store.
    pub async fn bootstrap(
        config: CoordConfig,
        store: Arc<dyn TopologyStore>,
        servers: Arc<dyn ServerCommands>,
        proxies: Arc<dyn ProxyAdmin>,
        sentinels: Arc<dyn SentinelGate>,
    ) -> Result<Arc<Self>, CoordError> {
        config.validate()?;
        let snapshot = store.read().await?;
        let mut plans = store.load_plans().await?;
        // Sync and backup phases run inside one admin call and keep no
        // resume cursor, so a `Running` step loaded from the store can only
        // mean the previous coordinator died mid-phase. Reset those to let
        // the operator re-run the phase; queued slot migrations and the
        // clean pipeline resume on their own.
        let mut interrupted = 0;
        for plan in &mut plans {
            if plan.step == PlanStep::Running
                && matches!(plan.action, PlanAction::DataSync | PlanAction::Backup)
            {
                plan.step = PlanStep::Nothing;
                plan.error = "interrupted by a coordinator restart; re-run this step".to_string();
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            store.save_plans(&plans).await?;
            info!(interrupted, "reset expansion phases interrupted by restart");
        }
        let model = CoordinatorModel::new(&config);
        info!(
            cluster = %config.cluster,
            version = snapshot.version,
            groups = snapshot.topology.groups.len(),
            proxies = snapshot.topology.proxies.len(),
            plans = plans.len(),
            "topology loaded"
        );
        Ok(Arc::new(Self {
            config,
            model,
            store,
            servers,
            proxies,
            sentinels,
            cache: ArcSwap::from_pointee(snapshot),
            registry: StatsRegistry::new(),
            plans: Mutex::new(plans),
            action_interval_secs: AtomicU64::new(0),
            action_disabled: AtomicBool::new(false),
            executing: AtomicUsize::new(0),
            progress: ArcSwapOption::empty(),
            plan_watches: DashMap::new(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    #[must_use]
    pub fn model(&self) -> &CoordinatorModel {
        &self.model
    }

    #[must_use]
    pub fn xauth(&self) -> &str {
        &self.config.xauth
    }

    #[must_use]
    pub fn registry(&self) -> &StatsRegistry {
        &self.registry
    }

    pub(crate) fn server_commands(&self) -> &dyn ServerCommands {
        self.servers.as_ref()
    }

    pub(crate) fn proxy_admin(&self) -> &dyn ProxyAdmin {
        self.proxies.as_ref()
    }

    pub(crate) fn sentinel_gate(&self) -> &dyn SentinelGate {
        self.sentinels.as_ref()
    }

    // -----------------------------------------------------------------------
    // Topology access
    // -----------------------------------------------------------------------

    /// Last known snapshot, without touching the store.
    #[must_use]
    pub fn cached(&self) -> Arc<Snapshot> {
        self.cache.load_full()
    }

    /// Re-read the store and refresh the cache.
    ///
    /// # Errors
    ///
    /// Fails when the store is unavailable.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, CoordError> {
        let snapshot = Arc::new(self.store.read().await?);
        self.cache.store(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Apply one topology mutation with compare-and-swap semantics.
    ///
    /// `apply` runs against a topology freshly read from the store, so all
    /// validation inside it sees the latest state. On a lost swap the whole
    /// read-apply-swap cycle repeats, up to [`MAX_CAS_ATTEMPTS`] times;
    /// the final stale write surfaces as a conflict.
    pub(crate) async fn mutate<T, F>(&self, mut apply: F) -> Result<T, CoordError>
    where
        T: Send,
        F: FnMut(&mut Topology) -> Result<T, CoordError> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let snapshot = self.store.read().await?;
            let mut next = (*snapshot.topology).clone();
            let value = apply(&mut next)?;
            next.validate()
                .map_err(|err| CoordError::fatal(format!("mutation broke topology: {err}")))?;
            match self.store.compare_and_swap(snapshot.version, next).await {
                Ok(committed) => {
                    metrics::gauge!("coordinator_topology_version").set(committed.version as f64);
                    self.cache.store(Arc::new(committed));
                    return Ok(value);
                }
                Err(StoreError::StaleWrite { expected, actual }) => {
                    if attempt >= MAX_CAS_ATTEMPTS {
                        return Err(StoreError::StaleWrite { expected, actual }.into());
                    }
                    metrics::counter!("coordinator_cas_retries_total").increment(1);
                    debug!(expected, actual, attempt, "lost topology swap, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    pub(crate) async fn lock_plans(&self) -> MutexGuard<'_, Vec<ExpansionPlan>> {
        self.plans.lock().await
    }

    /// Arm (or re-arm) the give-up deadline for a plan's migration watch.
    pub(crate) fn plan_watch_arm(&self, id: u64, deadline: Instant) {
        self.plan_watches.insert(id, deadline);
    }

    pub(crate) fn plan_watch_clear(&self, id: u64) {
        self.plan_watches.remove(&id);
    }

    pub(crate) fn plan_watch_deadline(&self, id: u64) -> Option<Instant> {
        self.plan_watches.get(&id).map(|entry| *entry.value())
    }

    pub(crate) async fn persist_plans(
        &self,
        plans: &[ExpansionPlan],
    ) -> Result<(), CoordError> {
        self.store.save_plans(plans).await.map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Migration pacing
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn action_interval_secs(&self) -> u64 {
        self.action_interval_secs.load(Ordering::Relaxed)
    }

    /// Set the inter-batch sleep, clamped into `0..=MAX_ACTION_INTERVAL_SECS`.
    pub fn set_action_interval_secs(&self, secs: u64) {
        let clamped = secs.min(MAX_ACTION_INTERVAL_SECS);
        self.action_interval_secs.store(clamped, Ordering::Relaxed);
        info!(interval_secs = clamped, "migration interval updated");
    }

    #[must_use]
    pub fn action_disabled(&self) -> bool {
        self.action_disabled.load(Ordering::Relaxed)
    }

    pub fn set_action_disabled(&self, disabled: bool) {
        self.action_disabled.store(disabled, Ordering::Relaxed);
        info!(disabled, "migration engine toggled");
    }

    /// Number of slots with a live batch loop.
    #[must_use]
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Relaxed)
    }

    pub(crate) fn executor_guard(&self) -> ExecutorGuard<'_> {
        self.executing.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("coordinator_migrations_executing").increment(1.0);
        ExecutorGuard {
            executing: &self.executing,
        }
    }

    #[must_use]
    pub fn progress(&self) -> Option<String> {
        self.progress.load_full().map(|line| (*line).clone())
    }

    pub(crate) fn set_progress(&self, line: impl Into<String>) {
        self.progress.store(Some(Arc::new(line.into())));
    }

    pub(crate) fn clear_progress(&self) {
        self.progress.store(None);
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Assemble the full stats payload from the cached snapshot and the
    /// probe registry.
    pub async fn stats(&self) -> StatsPayload {
        let snapshot = self.cached();
        let topology = &snapshot.topology;
        let plans = self.lock_plans().await.clone();

        let servers = self
            .registry
            .servers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let proxy_stats = self
            .registry
            .proxies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let watchdogs = self
            .registry
            .watchdogs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        StatsPayload {
            cluster: self.config.cluster.clone(),
            version: snapshot.version,
            slots: topology.slots.clone(),
            groups: topology.groups.values().cloned().collect(),
            proxies: topology.proxies.values().cloned().collect(),
            sentinel: SentinelSection {
                servers: topology.sentinel.servers.clone(),
                out_of_sync: topology.sentinel.out_of_sync,
                observed_masters: (*self.registry.observed_masters()).clone(),
                conflicts: self.conflicts(),
            },
            servers,
            proxy_stats,
            watchdogs,
            migration: MigrationSection {
                interval_secs: self.action_interval_secs(),
                disabled: self.action_disabled(),
                executing: self.executing(),
                progress: self.progress(),
            },
            plans,
        }
    }
}

/// RAII count of running slot executors; promotion refuses while nonzero.
pub(crate) struct ExecutorGuard<'a> {
    executing: &'a AtomicUsize,
}

impl Drop for ExecutorGuard<'_> {
    fn drop(&mut self) {
        self.executing.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("coordinator_migrations_executing").decrement(1.0);
    }
}

// ---------------------------------------------------------------------------
// Stats payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub cluster: String,
    pub version: u64,
    pub slots: Vec<SlotMapping>,
    pub groups: Vec<Group>,
    pub proxies: Vec<Proxy>,
    pub sentinel: SentinelSection,
    pub servers: BTreeMap<String, Probe<ServerStatus>>,
    pub proxy_stats: BTreeMap<String, Probe<ProxyStats>>,
    pub watchdogs: BTreeMap<String, Probe<BTreeMap<u32, String>>>,
    pub migration: MigrationSection,
    pub plans: Vec<ExpansionPlan>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSection {
    pub servers: Vec<String>,
    pub out_of_sync: bool,
    pub observed_masters: BTreeMap<u32, String>,
    pub conflicts: Vec<MasterConflict>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSection {
    pub interval_secs: u64,
    pub disabled: bool,
    pub executing: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}
