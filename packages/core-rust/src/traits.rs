//! Command interfaces to the processes the coordinator administers.
//!
//! Storage servers, proxies and failover watchdogs are reached over their
//! admin endpoints. The coordinator only ever talks to them through these
//! traits, so engine and reconciler logic is testable against in-memory
//! doubles and the HTTP clients stay in one place.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::proxy::Proxy;
use crate::slots::SlotView;

// ---------------------------------------------------------------------------
// Status payloads
// ---------------------------------------------------------------------------

/// Replication role a storage server reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    Master,
    Replica,
}

/// Point-in-time status of one storage server, as reported by its admin
/// endpoint. Latency aggregates are means; the poller publishes them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub role: ServerRole,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub master_addr: Option<String>,
    /// Whether the replication link to `master_addr` is established.
    #[serde(default)]
    pub master_link_up: bool,
    pub keys: u64,
    pub mem_used_bytes: u64,
    pub ops_per_sec: u64,
    pub mean_latency_us: u64,
    /// A slot-index reload is running (set between `reload_slots` and its
    /// completion).
    #[serde(default)]
    pub reload_in_progress: bool,
    /// A slot purge is running (set between `purge_slots` and completion).
    #[serde(default)]
    pub purge_in_progress: bool,
}

/// Binlog position of one storage server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    pub role: ServerRole,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub master_addr: Option<String>,
    pub binlog_file: u64,
    pub binlog_offset: u64,
    #[serde(default)]
    pub link_up: bool,
}

/// Point-in-time load counters of one proxy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub ops_total: u64,
    pub ops_fails: u64,
    pub sessions_alive: u64,
    pub rusage_mem_bytes: u64,
    pub rusage_cpu: f64,
}

// ---------------------------------------------------------------------------
// ServerCommands
// ---------------------------------------------------------------------------

/// Admin commands against a storage server, addressed by `host:port`.
#[async_trait]
pub trait ServerCommands: Send + Sync {
    async fn status(&self, addr: &str) -> anyhow::Result<ServerStatus>;

    async fn replication_status(&self, addr: &str) -> anyhow::Result<ReplicationStatus>;

    /// Point the server at `master`, or detach it into a standalone master
    /// with `None`. `from_start` replays the master's binlog from offset
    /// zero instead of the current tail.
    async fn replicate_from(
        &self,
        addr: &str,
        master: Option<&str>,
        from_start: bool,
    ) -> anyhow::Result<()>;

    /// Cap replication throughput, in MB/s (0 lifts the cap).
    async fn set_sync_speed(&self, addr: &str, mb_per_sec: u32) -> anyhow::Result<()>;

    /// Keep binlog segments for at least `hours`.
    async fn set_binlog_retention(&self, addr: &str, hours: u32) -> anyhow::Result<()>;

    async fn set_migrate_enabled(&self, addr: &str, enabled: bool) -> anyhow::Result<()>;

    async fn set_readonly(&self, addr: &str, readonly: bool) -> anyhow::Result<()>;

    /// Move at most one batch of keys in `slot` to `target`. Returns the
    /// number of keys still left in the slot afterwards; zero means done.
    async fn migrate_slot_batch(
        &self,
        addr: &str,
        slot: usize,
        target: &str,
    ) -> anyhow::Result<u64>;

    /// Rebuild the per-slot key indexes (asynchronous; progress is visible as
    /// `ServerStatus::reload_in_progress`).
    async fn reload_slots(&self, addr: &str) -> anyhow::Result<()>;

    /// Drop data of every slot NOT in `owned` (asynchronous; progress is
    /// visible as `ServerStatus::purge_in_progress`).
    async fn purge_slots(&self, addr: &str, owned: &[usize]) -> anyhow::Result<()>;

    /// Drop the key index of one slot.
    async fn purge_slot_index(&self, addr: &str, slot: usize) -> anyhow::Result<()>;

    async fn compact(&self, addr: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ProxyAdmin
// ---------------------------------------------------------------------------

/// Admin commands against a proxy.
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Fetch the proxy's self-description from its admin address.
    async fn model(&self, admin_addr: &str) -> anyhow::Result<Proxy>;

    async fn stats(&self, proxy: &Proxy) -> anyhow::Result<ProxyStats>;

    /// Push resolved routing state for the given slots.
    async fn fill_slots(&self, proxy: &Proxy, slots: &[SlotView]) -> anyhow::Result<()>;

    /// Switch the proxy from its waiting-room state into serving.
    async fn start(&self, proxy: &Proxy) -> anyhow::Result<()>;

    async fn shutdown(&self, proxy: &Proxy) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// SentinelGate
// ---------------------------------------------------------------------------

/// Commands against one failover watchdog, addressed by `host:port`.
///
/// `cluster` scopes every call: watchdogs monitor masters for many clusters
/// at once, keyed by cluster name and group id.
#[async_trait]
pub trait SentinelGate: Send + Sync {
    async fn ping(&self, addr: &str) -> anyhow::Result<()>;

    /// Masters the watchdog currently reports for `cluster`, keyed by group.
    async fn monitored_masters(
        &self,
        addr: &str,
        cluster: &str,
    ) -> anyhow::Result<BTreeMap<u32, String>>;

    /// Register (or update) the given group masters for monitoring.
    async fn monitor_groups(
        &self,
        addr: &str,
        cluster: &str,
        masters: &BTreeMap<u32, String>,
    ) -> anyhow::Result<()>;

    /// Drop the given groups from monitoring.
    async fn forget_groups(&self, addr: &str, cluster: &str, groups: &[u32])
        -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_defaults_cover_optional_flags() {
        let json = r#"{"role":"Master","keys":10,"memUsedBytes":1,"opsPerSec":2,"meanLatencyUs":3}"#;
        let status: ServerStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.role, ServerRole::Master);
        assert!(status.master_addr.is_none());
        assert!(!status.reload_in_progress);
        assert!(!status.purge_in_progress);
    }

    #[test]
    fn replication_status_round_trips() {
        let status = ReplicationStatus {
            role: ServerRole::Replica,
            master_addr: Some("a:1".to_string()),
            binlog_file: 4,
            binlog_offset: 1024,
            link_up: true,
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: ReplicationStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
