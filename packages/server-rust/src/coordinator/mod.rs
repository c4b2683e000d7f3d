//! Cluster coordination: topology writes, migration and replication
//! engines, expansion plans, failover reconciliation and stats polling.
//!
//! All state flows through [`Coordinator`]. Operator RPCs and background
//! engines share the same mutation path, so every write is validated and
//! version-checked no matter who initiates it.

pub mod config;
pub mod core;
pub mod expansion;
pub mod groups;
pub mod poller;
pub mod proxies;
pub mod rebalance;
pub mod reconciler;
pub mod slots;
pub mod worker;

pub use config::CoordConfig;
pub use core::{Coordinator, CoordinatorModel, StatsPayload};
pub use poller::{Probe, ProbeState, StatsRegistry};
pub use rebalance::SlotMove;
pub use reconciler::MasterConflict;
pub use worker::{
    MigrationRunnable, PollRunnable, ReplicationRunnable, TickRunnable, TickWorker,
};

#[cfg(test)]
pub(crate) mod testkit {
    //! In-memory doubles for the three command interfaces, shared by the
    //! coordinator test suites.

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use shardhelm_core::{
        Group, GroupServer, Proxy, ProxyAdmin, ProxyStats, ReplicationStatus, SentinelGate,
        ServerCommands, ServerRole, ServerStatus, SlotView, Topology,
    };

    use super::config::CoordConfig;
    use super::core::Coordinator;
    use crate::store::{MemoryStore, TopologyStore};

    /// Keys drained from a slot per `migrate_slot_batch` call.
    pub const MOCK_BATCH_KEYS: u64 = 100;

    /// One double behind all three command traits. Targets are keyed by
    /// address (admin address for proxies); `hang` entries never answer,
    /// `fail` entries answer with the configured error.
    #[derive(Default)]
    pub struct MockBackend {
        pub statuses: DashMap<String, ServerStatus>,
        pub replication: DashMap<String, ReplicationStatus>,
        pub remaining: DashMap<usize, u64>,
        pub watchdog: DashMap<String, BTreeMap<u32, String>>,
        pub proxy_models: DashMap<String, Proxy>,
        hang: DashMap<String, ()>,
        fail: DashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockBackend {
        pub fn hang(&self, addr: &str) {
            self.hang.insert(addr.to_string(), ());
        }

        pub fn fail(&self, addr: &str, msg: &str) {
            self.fail.insert(addr.to_string(), msg.to_string());
        }

        pub fn clear_fail(&self, addr: &str) {
            self.fail.remove(addr);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter(|call| call.starts_with(prefix))
                .cloned()
                .collect()
        }

        pub fn set_remaining(&self, slot: usize, keys: u64) {
            self.remaining.insert(slot, keys);
        }

        pub fn set_replication(
            &self,
            addr: &str,
            master: Option<&str>,
            file: u64,
            offset: u64,
            link_up: bool,
        ) {
            self.replication.insert(
                addr.to_string(),
                ReplicationStatus {
                    role: if master.is_some() {
                        ServerRole::Replica
                    } else {
                        ServerRole::Master
                    },
                    master_addr: master.map(str::to_string),
                    binlog_file: file,
                    binlog_offset: offset,
                    link_up,
                },
            );
        }

        pub fn watchdog_reports(&self, addr: &str, masters: &[(u32, &str)]) {
            self.watchdog.insert(
                addr.to_string(),
                masters
                    .iter()
                    .map(|(gid, master)| (*gid, (*master).to_string()))
                    .collect(),
            );
        }

        /// Give every group server a healthy status matching its position.
        pub fn healthy_defaults(&self, topology: &Topology) {
            for group in topology.groups.values() {
                let master = group.master_addr().map(str::to_string);
                for (index, server) in group.servers.iter().enumerate() {
                    let status = if index == 0 {
                        base_status(ServerRole::Master, None)
                    } else {
                        base_status(ServerRole::Replica, master.clone())
                    };
                    self.statuses.insert(server.addr.clone(), status);
                }
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        async fn gate(&self, key: &str) -> anyhow::Result<()> {
            if self.hang.contains_key(key) {
                std::future::pending::<()>().await;
            }
            if let Some(msg) = self.fail.get(key) {
                anyhow::bail!("{}", msg.clone());
            }
            Ok(())
        }
    }

    fn base_status(role: ServerRole, master_addr: Option<String>) -> ServerStatus {
        ServerStatus {
            role,
            master_link_up: master_addr.is_some(),
            master_addr,
            keys: 1000,
            mem_used_bytes: 1 << 20,
            ops_per_sec: 50,
            mean_latency_us: 120,
            reload_in_progress: false,
            purge_in_progress: false,
        }
    }

    #[async_trait]
    impl ServerCommands for MockBackend {
        async fn status(&self, addr: &str) -> anyhow::Result<ServerStatus> {
            self.gate(addr).await?;
            self.statuses
                .get(addr)
                .map(|status| status.clone())
                .ok_or_else(|| anyhow::anyhow!("no status configured for {addr}"))
        }

        async fn replication_status(&self, addr: &str) -> anyhow::Result<ReplicationStatus> {
            self.gate(addr).await?;
            self.replication
                .get(addr)
                .map(|status| status.clone())
                .ok_or_else(|| anyhow::anyhow!("no replication status configured for {addr}"))
        }

        async fn replicate_from(
            &self,
            addr: &str,
            master: Option<&str>,
            from_start: bool,
        ) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!(
                "replicate {addr} master={} from_start={from_start}",
                master.unwrap_or("none")
            ));
            Ok(())
        }

        async fn set_sync_speed(&self, addr: &str, mb_per_sec: u32) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("sync-speed {addr} {mb_per_sec}"));
            Ok(())
        }

        async fn set_binlog_retention(&self, addr: &str, hours: u32) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("binlog-retention {addr} {hours}"));
            Ok(())
        }

        async fn set_migrate_enabled(&self, addr: &str, enabled: bool) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("migrate-enabled {addr} {enabled}"));
            Ok(())
        }

        async fn set_readonly(&self, addr: &str, readonly: bool) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("readonly {addr} {readonly}"));
            Ok(())
        }

        async fn migrate_slot_batch(
            &self,
            addr: &str,
            slot: usize,
            target: &str,
        ) -> anyhow::Result<u64> {
            self.gate(addr).await?;
            let left = {
                let mut entry = self.remaining.entry(slot).or_insert(0);
                *entry = entry.saturating_sub(MOCK_BATCH_KEYS);
                *entry
            };
            self.record(format!("migrate {addr} slot={slot} target={target}"));
            Ok(left)
        }

        async fn reload_slots(&self, addr: &str) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("reload-slots {addr}"));
            Ok(())
        }

        async fn purge_slots(&self, addr: &str, owned: &[usize]) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("purge-slots {addr} owned={}", owned.len()));
            Ok(())
        }

        async fn purge_slot_index(&self, addr: &str, slot: usize) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("purge-slot-index {addr} {slot}"));
            Ok(())
        }

        async fn compact(&self, addr: &str) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("compact {addr}"));
            Ok(())
        }
    }

    #[async_trait]
    impl ProxyAdmin for MockBackend {
        async fn model(&self, admin_addr: &str) -> anyhow::Result<Proxy> {
            self.gate(admin_addr).await?;
            self.record(format!("proxy-model {admin_addr}"));
            let model = self
                .proxy_models
                .entry(admin_addr.to_string())
                .or_insert_with(|| Proxy {
                    id: 0,
                    token: uuid::Uuid::new_v4().simple().to_string(),
                    admin_addr: admin_addr.to_string(),
                    proxy_addr: format!("{admin_addr}-proxy"),
                    datacenter: None,
                    start_time: "2026-01-01 00:00:00".to_string(),
                });
            Ok(model.clone())
        }

        async fn stats(&self, proxy: &Proxy) -> anyhow::Result<ProxyStats> {
            self.gate(&proxy.admin_addr).await?;
            self.record(format!("proxy-stats {}", proxy.token));
            Ok(ProxyStats::default())
        }

        async fn fill_slots(&self, proxy: &Proxy, slots: &[SlotView]) -> anyhow::Result<()> {
            self.gate(&proxy.admin_addr).await?;
            let locked = slots.iter().filter(|view| view.locked).count();
            self.record(format!(
                "fill {} n={} locked={locked}",
                proxy.admin_addr,
                slots.len()
            ));
            Ok(())
        }

        async fn start(&self, proxy: &Proxy) -> anyhow::Result<()> {
            self.gate(&proxy.admin_addr).await?;
            self.record(format!("proxy-start {}", proxy.admin_addr));
            Ok(())
        }

        async fn shutdown(&self, proxy: &Proxy) -> anyhow::Result<()> {
            self.gate(&proxy.admin_addr).await?;
            self.record(format!("proxy-shutdown {}", proxy.admin_addr));
            Ok(())
        }
    }

    #[async_trait]
    impl SentinelGate for MockBackend {
        async fn ping(&self, addr: &str) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("wd-ping {addr}"));
            Ok(())
        }

        async fn monitored_masters(
            &self,
            addr: &str,
            _cluster: &str,
        ) -> anyhow::Result<BTreeMap<u32, String>> {
            self.gate(addr).await?;
            self.record(format!("wd-masters {addr}"));
            Ok(self
                .watchdog
                .get(addr)
                .map(|masters| masters.clone())
                .unwrap_or_default())
        }

        async fn monitor_groups(
            &self,
            addr: &str,
            _cluster: &str,
            masters: &BTreeMap<u32, String>,
        ) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("wd-monitor {addr} n={}", masters.len()));
            self.watchdog.insert(addr.to_string(), masters.clone());
            Ok(())
        }

        async fn forget_groups(
            &self,
            addr: &str,
            _cluster: &str,
            groups: &[u32],
        ) -> anyhow::Result<()> {
            self.gate(addr).await?;
            self.record(format!("wd-forget {addr} n={}", groups.len()));
            if let Some(mut entry) = self.watchdog.get_mut(addr) {
                entry.retain(|gid, _| !groups.contains(gid));
            }
            Ok(())
        }
    }

    /// Topology with the given groups and servers, all slots unassigned.
    pub fn topology(groups: &[(u32, &[&str])]) -> Topology {
        let mut topology = Topology::new();
        for (gid, addrs) in groups {
            let mut group = Group::new(*gid);
            for addr in *addrs {
                group.servers.push(GroupServer::new(*addr, None));
            }
            topology.groups.insert(*gid, group);
        }
        topology
    }

    /// Same, with inclusive slot ranges assigned to groups.
    pub fn topology_with_slots(
        groups: &[(u32, &[&str])],
        ranges: &[(usize, usize, u32)],
    ) -> Topology {
        let mut topology = topology(groups);
        for (beg, end, gid) in ranges {
            for sid in *beg..=*end {
                if let Some(slot) = topology.slot_mut(sid) {
                    slot.group_id = *gid;
                }
            }
        }
        topology
    }

    pub async fn coordinator_with(topology: Topology) -> (Arc<Coordinator>, Arc<MockBackend>) {
        coordinator_on(Arc::new(MemoryStore::with_topology(topology))).await
    }

    /// Same, with the config adjusted before bootstrap.
    pub async fn coordinator_tuned(
        topology: Topology,
        tweak: impl FnOnce(&mut CoordConfig),
    ) -> (Arc<Coordinator>, Arc<MockBackend>) {
        let store = Arc::new(MemoryStore::with_topology(topology));
        let backend = Arc::new(MockBackend::default());
        let mut config = CoordConfig::new("demo-test", "127.0.0.1:18080");
        tweak(&mut config);
        let coordinator = Coordinator::bootstrap(
            config,
            store as Arc<dyn TopologyStore>,
            Arc::clone(&backend) as _,
            Arc::clone(&backend) as _,
            Arc::clone(&backend) as _,
        )
        .await
        .unwrap();
        (coordinator, backend)
    }

    pub async fn coordinator_on(
        store: Arc<MemoryStore>,
    ) -> (Arc<Coordinator>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        let config = CoordConfig::new("demo-test", "127.0.0.1:18080");
        let coordinator = Coordinator::bootstrap(
            config,
            store as Arc<dyn TopologyStore>,
            Arc::clone(&backend) as _,
            Arc::clone(&backend) as _,
            Arc::clone(&backend) as _,
        )
        .await
        .unwrap();
        (coordinator, backend)
    }
}
