//! Registered proxy instances.
//!
//! Proxies self-describe: the coordinator fetches the model from the proxy's
//! admin endpoint and registers it under the proxy-generated token. Ids are
//! assigned from the topology's monotonic `proxy_seq` at registration time.

use serde::{Deserialize, Serialize};

/// A proxy registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    /// Coordinator-assigned ordinal, unique for the lifetime of the cluster.
    #[serde(default)]
    pub id: u64,
    /// Proxy-generated instance token (UUID); the registry key.
    pub token: String,
    /// `host:port` the coordinator administers the proxy on.
    pub admin_addr: String,
    /// `host:port` clients connect to.
    pub proxy_addr: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub datacenter: Option<String>,
    /// Wall-clock start time reported by the proxy, as an opaque string.
    #[serde(default)]
    pub start_time: String,
}
