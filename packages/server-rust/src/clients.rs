//! HTTP clients for the processes the coordinator administers.
//!
//! One implementation per command trait, all over a shared `reqwest` client
//! with the probe timeout applied. Mutating endpoints answer `"Success"`;
//! the clients only check the status code and surface the body on failure.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shardhelm_core::{
    auth, Proxy, ProxyAdmin, ProxyStats, ReplicationStatus, SentinelGate, ServerCommands,
    ServerStatus, SlotView,
};

fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

fn url(addr: &str, path: &str) -> String {
    format!("http://{addr}{path}")
}

async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{status}: {body}")
}

// ---------------------------------------------------------------------------
// Storage servers
// ---------------------------------------------------------------------------

/// Talks to storage server admin endpoints under `/admin`.
pub struct ServerApiClient {
    http: Client,
}

impl ServerApiClient {
    /// # Errors
    ///
    /// Fails when the underlying HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplicateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    master: Option<&'a str>,
    from_start: bool,
}

#[derive(Serialize)]
struct MigrateSlotRequest<'a> {
    slot: usize,
    target: &'a str,
}

#[derive(Deserialize)]
struct MigrateSlotResponse {
    remaining: u64,
}

#[derive(Serialize)]
struct PurgeSlotsRequest<'a> {
    owned: &'a [usize],
}

#[async_trait]
impl ServerCommands for ServerApiClient {
    async fn status(&self, addr: &str) -> anyhow::Result<ServerStatus> {
        let response = check(self.http.get(url(addr, "/admin/status")).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn replication_status(&self, addr: &str) -> anyhow::Result<ReplicationStatus> {
        let response =
            check(self.http.get(url(addr, "/admin/replication")).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn replicate_from(
        &self,
        addr: &str,
        master: Option<&str>,
        from_start: bool,
    ) -> anyhow::Result<()> {
        let body = ReplicateRequest { master, from_start };
        check(
            self.http
                .put(url(addr, "/admin/replicate"))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn set_sync_speed(&self, addr: &str, mb_per_sec: u32) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(addr, &format!("/admin/sync-speed/{mb_per_sec}")))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn set_binlog_retention(&self, addr: &str, hours: u32) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(addr, &format!("/admin/binlog-retention/{hours}")))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn set_migrate_enabled(&self, addr: &str, enabled: bool) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(
                    addr,
                    &format!("/admin/migrate-enabled/{}", u8::from(enabled)),
                ))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn set_readonly(&self, addr: &str, readonly: bool) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(addr, &format!("/admin/readonly/{}", u8::from(readonly))))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn migrate_slot_batch(
        &self,
        addr: &str,
        slot: usize,
        target: &str,
    ) -> anyhow::Result<u64> {
        let body = MigrateSlotRequest { slot, target };
        let response = check(
            self.http
                .post(url(addr, "/admin/migrate-slot"))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        let parsed: MigrateSlotResponse = response.json().await?;
        Ok(parsed.remaining)
    }

    async fn reload_slots(&self, addr: &str) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(addr, "/admin/slots/reload"))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn purge_slots(&self, addr: &str, owned: &[usize]) -> anyhow::Result<()> {
        let body = PurgeSlotsRequest { owned };
        check(
            self.http
                .put(url(addr, "/admin/slots/purge"))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn purge_slot_index(&self, addr: &str, slot: usize) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(addr, &format!("/admin/slots/{slot}/purge-index")))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn compact(&self, addr: &str) -> anyhow::Result<()> {
        check(self.http.put(url(addr, "/admin/compact")).send().await?).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Proxies
// ---------------------------------------------------------------------------

/// Talks to proxy admin endpoints under `/api/proxy`. Proxies derive their
/// token from the cluster name the same way the coordinator does, so one
/// client serves every proxy of the cluster.
pub struct ProxyApiClient {
    http: Client,
    xauth: String,
}

impl ProxyApiClient {
    /// # Errors
    ///
    /// Fails when the underlying HTTP client cannot be built.
    pub fn new(cluster: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            xauth: auth::derive_xauth(cluster),
        })
    }
}

#[async_trait]
impl ProxyAdmin for ProxyApiClient {
    async fn model(&self, admin_addr: &str) -> anyhow::Result<Proxy> {
        let response = check(
            self.http
                .get(url(admin_addr, "/api/proxy/model"))
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    async fn stats(&self, proxy: &Proxy) -> anyhow::Result<ProxyStats> {
        let response = check(
            self.http
                .get(url(
                    &proxy.admin_addr,
                    &format!("/api/proxy/stats/{}", self.xauth),
                ))
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    async fn fill_slots(&self, proxy: &Proxy, slots: &[SlotView]) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(
                    &proxy.admin_addr,
                    &format!("/api/proxy/fill-slots/{}", self.xauth),
                ))
                .json(&slots)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn start(&self, proxy: &Proxy) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(
                    &proxy.admin_addr,
                    &format!("/api/proxy/start/{}", self.xauth),
                ))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn shutdown(&self, proxy: &Proxy) -> anyhow::Result<()> {
        check(
            self.http
                .put(url(
                    &proxy.admin_addr,
                    &format!("/api/proxy/shutdown/{}", self.xauth),
                ))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Watchdogs
// ---------------------------------------------------------------------------

/// Talks to failover watchdog endpoints under `/api/watchdog`.
pub struct SentinelApiClient {
    http: Client,
}

impl SentinelApiClient {
    /// # Errors
    ///
    /// Fails when the underlying HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
        })
    }
}

#[derive(Serialize)]
struct MonitorRequest<'a> {
    masters: &'a BTreeMap<u32, String>,
}

#[derive(Serialize)]
struct ForgetRequest<'a> {
    groups: &'a [u32],
}

#[derive(Deserialize)]
struct MastersResponse {
    masters: BTreeMap<u32, String>,
}

#[async_trait]
impl SentinelGate for SentinelApiClient {
    async fn ping(&self, addr: &str) -> anyhow::Result<()> {
        check(self.http.get(url(addr, "/api/watchdog/ping")).send().await?).await?;
        Ok(())
    }

    async fn monitored_masters(
        &self,
        addr: &str,
        cluster: &str,
    ) -> anyhow::Result<BTreeMap<u32, String>> {
        let response = check(
            self.http
                .get(url(addr, &format!("/api/watchdog/masters/{cluster}")))
                .send()
                .await?,
        )
        .await?;
        let parsed: MastersResponse = response.json().await?;
        Ok(parsed.masters)
    }

    async fn monitor_groups(
        &self,
        addr: &str,
        cluster: &str,
        masters: &BTreeMap<u32, String>,
    ) -> anyhow::Result<()> {
        let body = MonitorRequest { masters };
        check(
            self.http
                .put(url(addr, &format!("/api/watchdog/monitor/{cluster}")))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn forget_groups(
        &self,
        addr: &str,
        cluster: &str,
        groups: &[u32],
    ) -> anyhow::Result<()> {
        let body = ForgetRequest { groups };
        check(
            self.http
                .put(url(addr, &format!("/api/watchdog/forget/{cluster}")))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}
