//! Advisory stats poller.
//!
//! One pass fans out to every known storage server, proxy and watchdog
//! concurrently, each probe bounded by the configured timeout, and lands the
//! results in lock-free caches. Probe results are advisory: they feed the
//! stats payload, the promote safety check and the failover reconciler, but
//! a dead target never changes topology by itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::future;
use serde::Serialize;
use shardhelm_core::{ProxyStats, ServerStatus};
use tokio::time::error::Elapsed;
use tracing::debug;

use super::core::Coordinator;

// ---------------------------------------------------------------------------
// Probe results
// ---------------------------------------------------------------------------

/// Classification of the most recent probe against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeState {
    /// Registered but never successfully probed yet.
    Pending,
    /// The target did not answer within the probe budget.
    Timeout,
    /// The target answered with a failure.
    Error,
    Healthy,
}

/// Latest probe outcome for one target, plus the payload when healthy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe<T> {
    pub state: ProbeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix millis when the probe completed; 0 while pending.
    pub checked_at_ms: u64,
    pub elapsed_ms: u64,
}

impl<T> Probe<T> {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: ProbeState::Pending,
            data: None,
            error: None,
            checked_at_ms: 0,
            elapsed_ms: 0,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == ProbeState::Healthy
    }
}

pub type ServerProbe = Probe<ServerStatus>;
pub type ProxyProbe = Probe<ProxyStats>;
/// Watchdog probes carry the masters the watchdog reports, keyed by group.
pub type WatchdogProbe = Probe<BTreeMap<u32, String>>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared caches the poller writes and everyone else reads.
///
/// Server probes are keyed by server address, proxy probes by proxy token,
/// watchdog probes by watchdog address.
pub struct StatsRegistry {
    pub servers: DashMap<String, ServerProbe>,
    pub proxies: DashMap<String, ProxyProbe>,
    pub watchdogs: DashMap<String, WatchdogProbe>,
    /// Masters as agreed by the watchdogs, merged by vote across healthy
    /// probes. Empty when no watchdog has answered.
    observed: ArcSwap<BTreeMap<u32, String>>,
}

impl StatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            proxies: DashMap::new(),
            watchdogs: DashMap::new(),
            observed: ArcSwap::from_pointee(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn observed_masters(&self) -> Arc<BTreeMap<u32, String>> {
        self.observed.load_full()
    }

    /// Master the watchdogs currently observe for `gid`, if any reported.
    #[must_use]
    pub fn observed_master(&self, gid: u32) -> Option<String> {
        self.observed.load().get(&gid).cloned()
    }

    pub(crate) fn set_observed(&self, masters: BTreeMap<u32, String>) {
        self.observed.store(Arc::new(masters));
    }

    #[must_use]
    pub fn server(&self, addr: &str) -> Option<ServerProbe> {
        self.servers.get(addr).map(|probe| probe.clone())
    }

    /// Drop cache entries for targets that left the topology.
    fn prune(
        &self,
        servers: &BTreeSet<String>,
        proxies: &BTreeSet<String>,
        watchdogs: &BTreeSet<String>,
    ) {
        self.servers.retain(|addr, _| servers.contains(addr));
        self.proxies.retain(|token, _| proxies.contains(token));
        self.watchdogs.retain(|addr, _| watchdogs.contains(addr));
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Poll pass
// ---------------------------------------------------------------------------

impl Coordinator {
    /// Probe every known target once. Never fails; per-target outcomes land
    /// in the registry.
    pub async fn poll_once(&self) {
        let snap = self.cached();
        let topology = &snap.topology;

        let server_addrs: BTreeSet<String> = topology
            .groups
            .values()
            .flat_map(|group| group.servers.iter().map(|server| server.addr.clone()))
            .collect();
        let proxy_models: Vec<_> = topology.proxies.values().cloned().collect();
        let proxy_tokens: BTreeSet<String> =
            proxy_models.iter().map(|proxy| proxy.token.clone()).collect();
        let watchdog_addrs: BTreeSet<String> =
            topology.sentinel.servers.iter().cloned().collect();

        let registry = self.registry();
        registry.prune(&server_addrs, &proxy_tokens, &watchdog_addrs);
        for addr in &server_addrs {
            registry
                .servers
                .entry(addr.clone())
                .or_insert_with(Probe::pending);
        }
        for token in &proxy_tokens {
            registry
                .proxies
                .entry(token.clone())
                .or_insert_with(Probe::pending);
        }
        for addr in &watchdog_addrs {
            registry
                .watchdogs
                .entry(addr.clone())
                .or_insert_with(Probe::pending);
        }

        let budget = self.config().probe_timeout;

        let server_probes = server_addrs.iter().map(|addr| {
            let addr = addr.clone();
            async move {
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(budget, self.server_commands().status(&addr)).await;
                (addr, settle(outcome, started))
            }
        });
        let proxy_probes = proxy_models.iter().map(|proxy| {
            let token = proxy.token.clone();
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(budget, self.proxy_admin().stats(proxy)).await;
                (token, settle(outcome, started))
            }
        });
        let cluster = self.config().cluster.clone();
        let watchdog_probes = watchdog_addrs.iter().map(|addr| {
            let addr = addr.clone();
            let cluster = cluster.clone();
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(
                    budget,
                    self.sentinel_gate().monitored_masters(&addr, &cluster),
                )
                .await;
                (addr, settle(outcome, started))
            }
        });

        let (servers, proxies, watchdogs) = future::join3(
            future::join_all(server_probes),
            future::join_all(proxy_probes),
            future::join_all(watchdog_probes),
        )
        .await;

        let mut timeouts = 0u64;
        for (addr, probe) in servers {
            if probe.state == ProbeState::Timeout {
                timeouts += 1;
            }
            registry.servers.insert(addr, probe);
        }
        for (token, probe) in proxies {
            if probe.state == ProbeState::Timeout {
                timeouts += 1;
            }
            registry.proxies.insert(token, probe);
        }
        let mut reports = Vec::new();
        for (addr, probe) in watchdogs {
            if probe.state == ProbeState::Timeout {
                timeouts += 1;
            }
            if let Some(masters) = &probe.data {
                reports.push(masters.clone());
            }
            registry.watchdogs.insert(addr, probe);
        }
        registry.set_observed(merge_observed(&reports));

        if timeouts > 0 {
            metrics::counter!("coordinator_probe_timeouts_total").increment(timeouts);
            debug!(timeouts, "stats poll finished with timeouts");
        }
    }
}

fn settle<T>(outcome: Result<anyhow::Result<T>, Elapsed>, started: Instant) -> Probe<T> {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let checked_at_ms = unix_ms();
    match outcome {
        Ok(Ok(data)) => Probe {
            state: ProbeState::Healthy,
            data: Some(data),
            error: None,
            checked_at_ms,
            elapsed_ms,
        },
        Ok(Err(err)) => Probe {
            state: ProbeState::Error,
            data: None,
            error: Some(err.to_string()),
            checked_at_ms,
            elapsed_ms,
        },
        Err(_) => Probe {
            state: ProbeState::Timeout,
            data: None,
            error: None,
            checked_at_ms,
            elapsed_ms,
        },
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}

/// Merge per-watchdog master reports into one view by majority vote. Ties
/// resolve toward the lexicographically smallest address so the result is
/// stable across polls.
pub(crate) fn merge_observed(reports: &[BTreeMap<u32, String>]) -> BTreeMap<u32, String> {
    let mut votes: BTreeMap<u32, BTreeMap<String, usize>> = BTreeMap::new();
    for report in reports {
        for (gid, addr) in report {
            *votes
                .entry(*gid)
                .or_default()
                .entry(addr.clone())
                .or_default() += 1;
        }
    }
    votes
        .into_iter()
        .filter_map(|(gid, candidates)| {
            candidates
                .into_iter()
                .max_by(|(addr_a, votes_a), (addr_b, votes_b)| {
                    votes_a.cmp(votes_b).then_with(|| addr_b.cmp(addr_a))
                })
                .map(|(addr, _)| (gid, addr))
        })
        .collect()
}
