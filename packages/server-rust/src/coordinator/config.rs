//! Coordinator runtime configuration.

use std::time::Duration;

use shardhelm_core::auth;

use crate::error::CoordError;

/// Tunables for the coordinator's background engines and outbound probes.
///
/// Network listener settings live in [`crate::network::NetworkConfig`]; this
/// struct only covers cluster identity and pacing.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Cluster (product) name. One coordinator governs one cluster.
    pub cluster: String,
    /// Auth token derived from the cluster name, checked on every
    /// authenticated admin route.
    pub xauth: String,
    /// Advertised `host:port` of the admin API, echoed in the model.
    pub admin_addr: String,
    /// Upper bound on slot migrations executed concurrently per tick.
    pub migration_parallel: usize,
    /// Per-target budget for one stats probe.
    pub probe_timeout: Duration,
    /// Cadence of the stats poller.
    pub poll_interval: Duration,
    /// Cadence of the migration and replication engines.
    pub engine_interval: Duration,
    /// How long an expansion plan's slot migrations may run before the
    /// background watcher gives up and records an error.
    pub migrate_watch_timeout: Duration,
}

impl CoordConfig {
    #[must_use]
    pub fn new(cluster: &str, admin_addr: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            xauth: auth::derive_xauth(cluster),
            admin_addr: admin_addr.to_string(),
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Rejects malformed cluster names, a zero migration width, and probe or
    /// poll budgets of zero.
    pub fn validate(&self) -> Result<(), CoordError> {
        if !auth::valid_cluster_name(&self.cluster) {
            return Err(CoordError::validation(format!(
                "invalid cluster name: {:?}",
                self.cluster
            )));
        }
        if self.migration_parallel == 0 {
            return Err(CoordError::validation("migration parallelism must be >= 1"));
        }
        if self.probe_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(CoordError::validation("probe timeout and poll interval must be nonzero"));
        }
        Ok(())
    }
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            cluster: "shardhelm-demo".to_string(),
            xauth: auth::derive_xauth("shardhelm-demo"),
            admin_addr: "127.0.0.1:18080".to_string(),
            migration_parallel: 100,
            probe_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            engine_interval: Duration::from_secs(1),
            migrate_watch_timeout: Duration::from_secs(6 * 60 * 60),
        }
    }
}
