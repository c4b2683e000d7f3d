//! Failover watchdog roster and the master reconciliation view.
//!
//! Watchdog observation is advisory. The reconciler flags groups where the
//! watchdog-elected live master disagrees with the logical one; it never
//! rewrites topology on its own. Switching masters stays an operator call
//! (`promote` with force), made with this conflict list in hand.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::core::Coordinator;
use crate::error::{Conflict, CoordError};

/// A group whose watchdog-observed master disagrees with `servers[0]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterConflict {
    pub group: u32,
    /// `None` when the watchdogs report a master for a group that has no
    /// servers anymore (stale registration).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_master: Option<String>,
    pub ha_real_master: String,
}

impl Coordinator {
    // -----------------------------------------------------------------------
    // Reconciliation view
    // -----------------------------------------------------------------------

    /// Groups whose observed live master differs from the logical one.
    #[must_use]
    pub fn conflicts(&self) -> Vec<MasterConflict> {
        let snapshot = self.cached();
        let logical = snapshot.topology.logical_masters();
        self.registry()
            .observed_masters()
            .iter()
            .filter_map(|(gid, observed)| {
                let logical_master = logical.get(gid).cloned();
                (logical_master.as_deref() != Some(observed.as_str())).then(|| MasterConflict {
                    group: *gid,
                    logical_master,
                    ha_real_master: observed.clone(),
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Roster
    // -----------------------------------------------------------------------

    /// Add a watchdog to the roster. The watchdog must answer a ping; a
    /// roster entry that was never reachable helps nobody.
    pub async fn add_sentinel(&self, addr: &str) -> Result<(), CoordError> {
        if !shardhelm_core::auth::valid_addr(addr) {
            return Err(CoordError::validation(format!(
                "invalid watchdog address {addr:?}"
            )));
        }
        self.sentinel_gate()
            .ping(addr)
            .await
            .map_err(|err| CoordError::unreachable(addr, err))?;

        self.mutate(|topology| {
            if topology.sentinel.contains(addr) {
                return Err(Conflict::AlreadyExists {
                    resource: format!("sentinel {addr}"),
                }
                .into());
            }
            topology.sentinel.servers.push(addr.to_string());
            topology.sentinel.out_of_sync = true;
            Ok(())
        })
        .await?;
        info!(watchdog = addr, "sentinel added");
        Ok(())
    }

    /// Remove a watchdog from the roster.
    ///
    /// Its group registrations are forgotten best-effort first; an
    /// unreachable watchdog needs `force`.
    pub async fn del_sentinel(&self, addr: &str, force: bool) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        if !snapshot.topology.sentinel.contains(addr) {
            return Err(CoordError::validation(format!(
                "{addr} is not in the watchdog roster"
            )));
        }

        if let Err(err) = self.sentinel_gate().ping(addr).await {
            if !force {
                return Err(CoordError::unreachable(addr, err));
            }
            warn!(watchdog = addr, %err, "removing unreachable watchdog");
        } else {
            let gids: Vec<u32> = snapshot.topology.groups.keys().copied().collect();
            if let Err(err) = self
                .sentinel_gate()
                .forget_groups(addr, &self.config().cluster, &gids)
                .await
            {
                warn!(watchdog = addr, %err, "forget on departing watchdog failed");
            }
        }

        let addr_owned = addr.to_string();
        self.mutate(move |topology| {
            topology.sentinel.servers.retain(|s| s != &addr_owned);
            topology.sentinel.out_of_sync = true;
            Ok(())
        })
        .await?;
        info!(watchdog = addr, "sentinel removed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registration pushes
    // -----------------------------------------------------------------------

    /// Push every group's logical master to every watchdog.
    ///
    /// Strict: any watchdog failure surfaces as `Unreachable` and leaves the
    /// roster flagged out-of-sync. A partial push while masters are disputed
    /// would teach some watchdogs the wrong master.
    pub async fn resync_all(&self) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let masters = snapshot.topology.logical_masters();
        let roster = snapshot.topology.sentinel.servers.clone();

        let masters = &masters;
        let cluster = self.config().cluster.as_str();
        let pushes = roster.iter().map(|addr| async move {
            self.sentinel_gate()
                .monitor_groups(addr, cluster, masters)
                .await
                .map_err(|err| (addr.clone(), err.to_string()))
        });
        let failed: Vec<(String, String)> = join_all(pushes)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        let in_sync = failed.is_empty();
        self.mutate(move |topology| {
            topology.sentinel.out_of_sync = !in_sync;
            Ok(())
        })
        .await?;
        if in_sync {
            info!(watchdogs = roster.len(), "watchdog roster resynced");
            Ok(())
        } else {
            let (target, detail) = join_failures(failed);
            Err(CoordError::Unreachable { target, detail })
        }
    }

    /// Deregister every group from every watchdog, keeping the roster.
    ///
    /// Strict for the same reason as [`Coordinator::resync_all`]; a watchdog
    /// that keeps stale registrations will keep electing masters for groups
    /// nobody asked it to watch.
    pub async fn remove_all(&self) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let gids: Vec<u32> = snapshot.topology.groups.keys().copied().collect();
        let roster = snapshot.topology.sentinel.servers.clone();

        let failed = self.forget_on_roster(&roster, &gids).await;
        if !failed.is_empty() {
            let (target, detail) = join_failures(failed);
            return Err(CoordError::Unreachable { target, detail });
        }

        // Monitoring is gone; stale observations must not keep producing
        // conflicts.
        self.registry().set_observed(BTreeMap::new());
        // The groups still exist unmonitored, so the roster is out of step
        // until an explicit resync-all re-registers them.
        self.mutate(|topology| {
            topology.sentinel.out_of_sync = true;
            Ok(())
        })
        .await?;
        info!("watchdog registrations removed");
        Ok(())
    }

    /// Deregister a single group from every watchdog, after the group itself
    /// is gone.
    pub async fn remove_group_monitoring(&self, gid: u32) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let roster = snapshot.topology.sentinel.servers.clone();

        let failed = self.forget_on_roster(&roster, &[gid]).await;
        if !failed.is_empty() {
            let (target, detail) = join_failures(failed);
            return Err(CoordError::Unreachable { target, detail });
        }
        info!(group = gid, "group deregistered from watchdogs");
        Ok(())
    }

    async fn forget_on_roster(&self, roster: &[String], gids: &[u32]) -> Vec<(String, String)> {
        let cluster = self.config().cluster.as_str();
        let pushes = roster.iter().map(|addr| async move {
            self.sentinel_gate()
                .forget_groups(addr, cluster, gids)
                .await
                .map_err(|err| (addr.clone(), err.to_string()))
        });
        join_all(pushes)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

fn join_failures(failed: Vec<(String, String)>) -> (String, String) {
    let detail = failed
        .first()
        .map(|(_, err)| err.clone())
        .unwrap_or_default();
    let target = failed
        .into_iter()
        .map(|(addr, _)| addr)
        .collect::<Vec<_>>()
        .join(", ");
    (target, detail)
}
