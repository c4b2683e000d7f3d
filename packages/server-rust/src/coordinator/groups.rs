//! Group membership, replication sync actions and master promotion.
//!
//! Groups order their servers by role: `servers[0]` is the logical master,
//! the rest are replicas. Promotion is a two-phase swap (prepare pauses the
//! group's slots everywhere, commit reorders the roster) and is re-entrant
//! per phase, so a coordinator restart mid-promotion resumes instead of
//! wedging. The coordinator never promotes on its own; watchdog observation
//! only gates what operators may do without force.

use shardhelm_core::{
    valid_group_id, ActionState, Group, GroupServer, PromotePhase, Promoting, SyncAction,
    SyncState,
};
use tracing::{info, warn};

use super::core::Coordinator;
use crate::error::{Conflict, CoordError};

impl Coordinator {
    // -----------------------------------------------------------------------
    // Group CRUD
    // -----------------------------------------------------------------------

    /// Register an empty group.
    pub async fn create_group(&self, gid: u32) -> Result<(), CoordError> {
        if !valid_group_id(gid) {
            return Err(CoordError::validation(format!(
                "group id {gid} outside [1, {}]",
                shardhelm_core::MAX_GROUP_ID
            )));
        }
        self.mutate(move |topology| {
            if topology.group(gid).is_some() {
                return Err(Conflict::AlreadyExists {
                    resource: format!("group {gid}"),
                }
                .into());
            }
            topology.groups.insert(gid, Group::new(gid));
            Ok(())
        })
        .await?;
        info!(group = gid, "group created");
        Ok(())
    }

    /// Remove a group that holds no servers and no slots.
    pub async fn remove_group(&self, gid: u32) -> Result<(), CoordError> {
        self.mutate(move |topology| {
            let Some(group) = topology.group(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            if group.is_promoting() {
                return Err(Conflict::GroupNotReady { group: gid }.into());
            }
            if !group.servers.is_empty() || topology.group_in_use(gid) {
                return Err(Conflict::GroupNotEmpty { group: gid }.into());
            }
            topology.groups.remove(&gid);
            Ok(())
        })
        .await?;
        info!(group = gid, "group removed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Add a server to a group. The first server becomes the logical master.
    pub async fn add_group_server(
        &self,
        gid: u32,
        addr: &str,
        datacenter: Option<String>,
    ) -> Result<(), CoordError> {
        if !shardhelm_core::auth::valid_addr(addr) {
            return Err(CoordError::validation(format!(
                "invalid server address {addr:?}"
            )));
        }
        self.mutate(|topology| {
            if let Some(owner) = topology.group_of_server(addr) {
                return Err(Conflict::ServerAlreadyAssigned {
                    server: addr.to_string(),
                    group: owner.id,
                }
                .into());
            }
            let Some(group) = topology.group_mut(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            if group.is_promoting() {
                return Err(Conflict::GroupNotReady { group: gid }.into());
            }
            let becomes_master = group.servers.is_empty();
            group
                .servers
                .push(GroupServer::new(addr, datacenter.clone()));
            group.out_of_sync = true;
            if becomes_master {
                // A new master exists; the watchdog roster is stale.
                topology.sentinel.out_of_sync = true;
            }
            Ok(())
        })
        .await?;
        info!(group = gid, server = addr, "server added to group");
        Ok(())
    }

    /// Remove a server from its group.
    ///
    /// The logical master can only be removed when it is the last server and
    /// the group holds no slots; otherwise promote a replica first.
    pub async fn remove_group_server(&self, gid: u32, addr: &str) -> Result<(), CoordError> {
        self.mutate(|topology| {
            let in_use = topology.group_in_use(gid);
            let Some(group) = topology.group_mut(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            if group.is_promoting() {
                return Err(Conflict::GroupNotReady { group: gid }.into());
            }
            let Some(index) = group.index_of(addr) else {
                return Err(CoordError::validation(format!(
                    "{addr} is not a member of group {gid}"
                )));
            };
            let state = group.servers[index].sync.state;
            if matches!(state, SyncState::Pending | SyncState::Syncing) {
                return Err(Conflict::ActionPending {
                    server: addr.to_string(),
                }
                .into());
            }
            if index == 0 {
                if group.servers.len() > 1 || in_use {
                    return Err(Conflict::GroupNotEmpty { group: gid }.into());
                }
                group.servers.clear();
                group.out_of_sync = true;
                topology.sentinel.out_of_sync = true;
            } else {
                group.servers.remove(index);
                group.out_of_sync = true;
            }
            Ok(())
        })
        .await?;
        info!(group = gid, server = addr, "server removed from group");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Promotion
    // -----------------------------------------------------------------------

    /// Prepare the promotion of `addr` to master of its group.
    ///
    /// Without `force`, the request is refused unless the watchdog roster is
    /// empty or the watchdogs already observe `addr` as the live master; the
    /// refusal carries both views so the operator can decide. `force` is
    /// validated here, server side, never by tooling.
    ///
    /// Re-entrant: preparing the same server again resumes the pause push.
    pub async fn promote_server(
        &self,
        gid: u32,
        addr: &str,
        force: bool,
    ) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let topology = &snapshot.topology;
        let Some(group) = topology.group(gid) else {
            return Err(CoordError::validation(format!("group {gid} does not exist")));
        };
        if group.servers.is_empty() {
            return Err(CoordError::fatal(format!(
                "group {gid} has no servers; nothing can be promoted"
            )));
        }
        let Some(index) = group.index_of(addr) else {
            return Err(CoordError::validation(format!(
                "{addr} is not a member of group {gid}"
            )));
        };

        let resuming = match group.promoting {
            Some(promoting) if promoting.index == index => true,
            Some(_) => return Err(Conflict::GroupNotReady { group: gid }.into()),
            None => false,
        };
        if !resuming {
            if index == 0 {
                return Err(CoordError::validation(format!(
                    "{addr} is already the master of group {gid}"
                )));
            }
            let migrating = topology
                .slots
                .iter()
                .filter(|slot| {
                    matches!(&slot.action, Some(action) if action.state == ActionState::Migrating)
                })
                .count()
                .max(self.executing());
            if migrating > 0 {
                return Err(Conflict::MigrationsRunning { active: migrating }.into());
            }
            if !force && !topology.sentinel.is_empty() {
                let observed = self.registry().observed_master(gid);
                if observed.as_deref() != Some(addr) {
                    return Err(Conflict::Promote {
                        group: gid,
                        logical_master: group.master_addr().map(str::to_string),
                        observed_real_master: observed,
                    }
                    .into());
                }
            }
        }

        // Phase 1: record the promotion, then pause the group's slots on
        // every proxy. Both steps are idempotent for the same server.
        let addr_owned = addr.to_string();
        self.mutate(move |topology| {
            let Some(group) = topology.group_mut(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            let Some(index) = group.index_of(&addr_owned) else {
                return Err(CoordError::validation(format!(
                    "{addr_owned} left group {gid} while promoting"
                )));
            };
            match group.promoting {
                Some(promoting) if promoting.index != index => {
                    return Err(Conflict::GroupNotReady { group: gid }.into())
                }
                Some(_) => {}
                None => {
                    group.promoting = Some(Promoting {
                        index,
                        phase: PromotePhase::Preparing,
                    });
                }
            }
            group.out_of_sync = true;
            Ok(())
        })
        .await?;

        let paused = self.cached().topology.slots_of_group(gid);
        self.push_slot_views(Some(&paused)).await?;

        // Phase 2: everyone has paused; mark prepared and wait for commit.
        self.mutate(move |topology| {
            let Some(group) = topology.group_mut(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            match &mut group.promoting {
                Some(promoting) => {
                    promoting.phase = PromotePhase::Prepared;
                    Ok(())
                }
                None => Err(Conflict::GroupNotReady { group: gid }.into()),
            }
        })
        .await?;
        info!(group = gid, server = addr, "promotion prepared");
        Ok(())
    }

    /// Commit a prepared promotion: reorder the roster to
    /// `[promoted, remaining replicas.., old master]`, clear every sync
    /// action, detach the new master and resync routing.
    pub async fn promote_commit(&self, gid: u32) -> Result<(), CoordError> {
        let promoted_addr = self
            .mutate(move |topology| {
                let Some(group) = topology.group_mut(gid) else {
                    return Err(CoordError::validation(format!("group {gid} does not exist")));
                };
                let Some(promoting) = group.promoting else {
                    return Err(Conflict::GroupNotReady { group: gid }.into());
                };
                if promoting.phase != PromotePhase::Prepared {
                    return Err(Conflict::GroupNotReady { group: gid }.into());
                }
                let mut servers = std::mem::take(&mut group.servers);
                let promoted = servers.remove(promoting.index);
                let old_master = servers.remove(0);
                let addr = promoted.addr.clone();
                let mut reordered = Vec::with_capacity(servers.len() + 2);
                reordered.push(promoted);
                reordered.extend(servers);
                reordered.push(old_master);
                for server in &mut reordered {
                    server.sync = SyncAction::default();
                }
                group.servers = reordered;
                group.promoting = None;
                group.out_of_sync = true;
                topology.sentinel.out_of_sync = true;
                Ok(addr)
            })
            .await?;

        // Detach the new master. It may be the only live server in the
        // group, and a dead old master must not block the switch.
        if let Err(err) = self
            .server_commands()
            .replicate_from(&promoted_addr, None, false)
            .await
        {
            warn!(group = gid, server = %promoted_addr, %err, "detach of promoted master failed");
        }

        self.resync_group(gid).await?;
        info!(group = gid, master = %promoted_addr, "promotion committed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Replication sync actions
    // -----------------------------------------------------------------------

    /// Queue a replication sync for one server.
    pub async fn create_sync_action(&self, addr: &str) -> Result<(), CoordError> {
        self.mutate(|topology| {
            let next_index = topology.max_sync_index() + 1;
            let Some(gid) = topology.group_of_server(addr).map(|group| group.id) else {
                return Err(CoordError::validation(format!(
                    "{addr} is not a member of any group"
                )));
            };
            let Some(group) = topology.group_mut(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            if group.is_promoting() {
                return Err(Conflict::GroupNotReady { group: gid }.into());
            }
            let Some(index) = group.index_of(addr) else {
                return Err(CoordError::validation(format!(
                    "{addr} is not a member of group {gid}"
                )));
            };
            let server = &mut group.servers[index];
            if matches!(server.sync.state, SyncState::Pending | SyncState::Syncing) {
                return Err(Conflict::ActionPending {
                    server: addr.to_string(),
                }
                .into());
            }
            server.sync = SyncAction {
                state: SyncState::Pending,
                index: next_index,
            };
            Ok(())
        })
        .await?;
        info!(server = addr, "replication sync queued");
        Ok(())
    }

    /// Drop a queued sync action, or clear a finished result.
    pub async fn remove_sync_action(&self, addr: &str) -> Result<(), CoordError> {
        self.mutate(|topology| {
            let Some(gid) = topology.group_of_server(addr).map(|group| group.id) else {
                return Err(CoordError::validation(format!(
                    "{addr} is not a member of any group"
                )));
            };
            let group = topology
                .group_mut(gid)
                .ok_or_else(|| CoordError::validation(format!("group {gid} does not exist")))?;
            let Some(index) = group.index_of(addr) else {
                return Err(CoordError::validation(format!(
                    "{addr} is not a member of group {gid}"
                )));
            };
            let server = &mut group.servers[index];
            match server.sync.state {
                SyncState::Nothing => Err(CoordError::validation(format!(
                    "{addr} has no sync action"
                ))),
                SyncState::Syncing => Err(Conflict::ActionPending {
                    server: addr.to_string(),
                }
                .into()),
                _ => {
                    server.sync = SyncAction::default();
                    Ok(())
                }
            }
        })
        .await?;
        info!(server = addr, "replication sync removed");
        Ok(())
    }

    /// One replication engine pass: take the lowest-index pending sync
    /// action and point that server at its group master (or detach it if it
    /// is the master). Returns how many actions were processed.
    pub async fn tick_sync_actions(&self) -> usize {
        let snapshot = match self.refresh().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "sync tick skipped, store unreadable");
                return 0;
            }
        };
        let Some((gid, addr)) = next_sync_action(&snapshot.topology) else {
            return 0;
        };

        // Capture the master as of the moment we mark the action syncing.
        let addr_for_mark = addr.clone();
        let master = match self
            .mutate(move |topology| {
                let Some(group) = topology.group_mut(gid) else {
                    return Err(CoordError::validation(format!("group {gid} disappeared")));
                };
                let Some(index) = group.index_of(&addr_for_mark) else {
                    return Err(CoordError::validation(format!(
                        "{addr_for_mark} left group {gid}"
                    )));
                };
                if group.servers[index].sync.state != SyncState::Pending {
                    return Err(CoordError::validation("sync action vanished"));
                }
                group.servers[index].sync.state = SyncState::Syncing;
                let master = if index == 0 {
                    None
                } else {
                    group.master_addr().map(str::to_string)
                };
                Ok(master)
            })
            .await
        {
            Ok(master) => master,
            Err(_) => return 0,
        };

        let outcome = self
            .server_commands()
            .replicate_from(&addr, master.as_deref(), false)
            .await;
        let next_state = match &outcome {
            Ok(()) => SyncState::Synced,
            Err(err) => {
                warn!(group = gid, server = %addr, %err, "replication sync failed");
                SyncState::SyncedFailed
            }
        };

        let addr_for_result = addr.clone();
        let settled = self
            .mutate(move |topology| {
                if let Some(group) = topology.group_mut(gid) {
                    if let Some(index) = group.index_of(&addr_for_result) {
                        if group.servers[index].sync.state == SyncState::Syncing {
                            group.servers[index].sync.state = next_state;
                        }
                    }
                }
                Ok(())
            })
            .await;
        if let Err(err) = settled {
            warn!(group = gid, server = %addr, %err, "sync result write failed");
        }
        1
    }

    // -----------------------------------------------------------------------
    // Proxy resync
    // -----------------------------------------------------------------------

    /// Re-push routing for one group's slots and clear its out-of-sync flag.
    pub async fn resync_group(&self, gid: u32) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        if snapshot.topology.group(gid).is_none() {
            return Err(CoordError::validation(format!("group {gid} does not exist")));
        }
        let slots = snapshot.topology.slots_of_group(gid);
        self.push_slot_views(Some(&slots)).await?;
        self.mutate(move |topology| {
            if let Some(group) = topology.group_mut(gid) {
                group.out_of_sync = false;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Re-push the full routing table to every proxy and clear all group
    /// out-of-sync flags.
    pub async fn resync_all_groups(&self) -> Result<(), CoordError> {
        self.refresh().await?;
        self.push_slot_views(None).await?;
        self.mutate(|topology| {
            for group in topology.groups.values_mut() {
                group.out_of_sync = false;
            }
            Ok(())
        })
        .await?;
        info!("all groups resynced");
        Ok(())
    }
}

/// The pending sync action with the lowest queue index, skipping groups that
/// are mid-promotion.
fn next_sync_action(topology: &shardhelm_core::Topology) -> Option<(u32, String)> {
    topology
        .groups
        .values()
        .filter(|group| !group.is_promoting())
        .flat_map(|group| {
            group.servers.iter().filter_map(|server| {
                (server.sync.state == SyncState::Pending)
                    .then(|| (server.sync.index, group.id, server.addr.clone()))
            })
        })
        .min()
        .map(|(_, gid, addr)| (gid, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testkit;
    use shardhelm_core::SlotAction;

    fn replicated_cluster() -> shardhelm_core::Topology {
        testkit::topology_with_slots(
            &[(1, &["m:1", "r:1", "r:2"]), (2, &["n:1"])],
            &[(0, 511, 1), (512, 1023, 2)],
        )
    }

    #[tokio::test]
    async fn create_group_twice_conflicts_and_changes_nothing() {
        let (coordinator, _backend) = testkit::coordinator_with(testkit::topology(&[])).await;
        coordinator.create_group(5).await.unwrap();
        let version = coordinator.cached().version;

        let err = coordinator.create_group(5).await.unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::AlreadyExists {
                resource: "group 5".to_string()
            })
        );
        assert_eq!(coordinator.cached().version, version);
    }

    #[tokio::test]
    async fn group_id_bounds_are_enforced() {
        let (coordinator, _backend) = testkit::coordinator_with(testkit::topology(&[])).await;
        assert!(coordinator.create_group(0).await.is_err());
        assert!(coordinator.create_group(10_000).await.is_err());
        coordinator.create_group(9999).await.unwrap();
    }

    #[tokio::test]
    async fn remove_group_requires_empty_and_unused() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        let err = coordinator.remove_group(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::GroupNotEmpty { group: 1 }));

        coordinator.create_group(3).await.unwrap();
        coordinator.remove_group(3).await.unwrap();
        assert!(coordinator.cached().topology.group(3).is_none());
    }

    #[tokio::test]
    async fn server_can_join_only_one_group() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator.create_group(3).await.unwrap();

        let err = coordinator
            .add_group_server(3, "r:1", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::ServerAlreadyAssigned {
                server: "r:1".to_string(),
                group: 1
            })
        );

        coordinator.add_group_server(3, "x:1", None).await.unwrap();
        let snap = coordinator.cached();
        assert_eq!(snap.topology.group(3).unwrap().master_addr(), Some("x:1"));
        assert!(snap.topology.sentinel.out_of_sync);
    }

    #[tokio::test]
    async fn master_removal_is_guarded() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;

        // Master with replicas and slots: refused.
        let err = coordinator.remove_group_server(1, "m:1").await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::GroupNotEmpty { group: 1 }));

        // Replica removal is fine.
        coordinator.remove_group_server(1, "r:2").await.unwrap();
        assert!(!coordinator.cached().topology.group(1).unwrap().contains("r:2"));

        // Last server of a group with no slots can go.
        coordinator.create_group(3).await.unwrap();
        coordinator.add_group_server(3, "x:1", None).await.unwrap();
        coordinator.remove_group_server(3, "x:1").await.unwrap();
        assert!(coordinator.cached().topology.group(3).unwrap().servers.is_empty());
    }

    #[tokio::test]
    async fn promote_without_force_requires_watchdog_agreement() {
        let mut topology = replicated_cluster();
        topology.sentinel.servers = vec!["w:1".to_string()];
        let (coordinator, _backend) = testkit::coordinator_with(topology).await;
        coordinator
            .registry()
            .set_observed([(1, "x:9".to_string())].into_iter().collect());

        let err = coordinator.promote_server(1, "r:1", false).await.unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::Promote {
                group: 1,
                logical_master: Some("m:1".to_string()),
                observed_real_master: Some("x:9".to_string()),
            })
        );
        assert!(!coordinator.cached().topology.group(1).unwrap().is_promoting());
    }

    #[tokio::test]
    async fn promote_without_force_allowed_when_watchdogs_agree_or_absent() {
        // Watchdogs observe the target as the live master.
        let mut topology = replicated_cluster();
        topology.sentinel.servers = vec!["w:1".to_string()];
        let (coordinator, _backend) = testkit::coordinator_with(topology).await;
        coordinator
            .registry()
            .set_observed([(1, "r:1".to_string())].into_iter().collect());
        coordinator.promote_server(1, "r:1", false).await.unwrap();

        // Empty roster: no observation to contradict.
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator.promote_server(1, "r:1", false).await.unwrap();
    }

    #[tokio::test]
    async fn forced_promote_and_commit_reorder_the_roster() {
        let mut topology = replicated_cluster();
        topology.sentinel.servers = vec!["w:1".to_string()];
        let (coordinator, backend) = testkit::coordinator_with(topology).await;
        coordinator
            .registry()
            .set_observed([(1, "x:9".to_string())].into_iter().collect());

        coordinator.promote_server(1, "r:1", true).await.unwrap();
        let snap = coordinator.cached();
        let promoting = snap.topology.group(1).unwrap().promoting.unwrap();
        assert_eq!(promoting.index, 1);
        assert_eq!(promoting.phase, PromotePhase::Prepared);

        coordinator.promote_commit(1).await.unwrap();
        let snap = coordinator.cached();
        let group = snap.topology.group(1).unwrap();
        let order: Vec<&str> = group.servers.iter().map(|server| server.addr.as_str()).collect();
        assert_eq!(order, vec!["r:1", "r:2", "m:1"]);
        assert!(!group.is_promoting());
        assert!(group
            .servers
            .iter()
            .all(|server| server.sync.state == SyncState::Nothing));
        assert!(snap.topology.sentinel.out_of_sync);

        let detaches = backend.calls_matching("replicate r:1 master=none");
        assert_eq!(detaches.len(), 1);
    }

    #[tokio::test]
    async fn promote_is_reentrant_for_the_same_server_only() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator.promote_server(1, "r:1", false).await.unwrap();
        coordinator.promote_server(1, "r:1", false).await.unwrap();

        let err = coordinator.promote_server(1, "r:2", false).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::GroupNotReady { group: 1 }));
    }

    #[tokio::test]
    async fn promote_refuses_while_migrations_run() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator
            .mutate(|topology| {
                topology.slot_mut(0).unwrap().action = Some(SlotAction {
                    state: ActionState::Migrating,
                    index: 1,
                    target_id: 2,
                });
                Ok(())
            })
            .await
            .unwrap();

        let err = coordinator.promote_server(1, "r:1", true).await.unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::MigrationsRunning { active: 1 })
        );
    }

    #[tokio::test]
    async fn promote_on_empty_group_is_fatal() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator.create_group(3).await.unwrap();
        let err = coordinator.promote_server(3, "x:1", false).await.unwrap_err();
        assert!(matches!(err, CoordError::Fatal(_)));
    }

    #[tokio::test]
    async fn commit_requires_prepared_phase() {
        let (coordinator, _backend) = testkit::coordinator_with(replicated_cluster()).await;
        let err = coordinator.promote_commit(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::GroupNotReady { group: 1 }));
    }

    #[tokio::test]
    async fn sync_actions_queue_and_tick_in_index_order() {
        let (coordinator, backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator.create_sync_action("r:2").await.unwrap();
        coordinator.create_sync_action("r:1").await.unwrap();

        let err = coordinator.create_sync_action("r:1").await.unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::ActionPending {
                server: "r:1".to_string()
            })
        );

        // First tick serves r:2 (queued first), second serves r:1.
        assert_eq!(coordinator.tick_sync_actions().await, 1);
        let state = |addr: &str| {
            let snap = coordinator.cached();
            let group = snap.topology.group(1).unwrap().clone();
            let index = group.index_of(addr).unwrap();
            group.servers[index].sync.state
        };
        assert_eq!(state("r:2"), SyncState::Synced);
        assert_eq!(state("r:1"), SyncState::Pending);

        assert_eq!(coordinator.tick_sync_actions().await, 1);
        assert_eq!(state("r:1"), SyncState::Synced);
        assert_eq!(coordinator.tick_sync_actions().await, 0);

        let calls = backend.calls_matching("replicate ");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "replicate r:2 master=m:1 from_start=false");
        assert_eq!(calls[1], "replicate r:1 master=m:1 from_start=false");
    }

    #[tokio::test]
    async fn failed_sync_is_recorded_and_removable() {
        let (coordinator, backend) = testkit::coordinator_with(replicated_cluster()).await;
        backend.fail("r:1", "server offline");
        coordinator.create_sync_action("r:1").await.unwrap();

        assert_eq!(coordinator.tick_sync_actions().await, 1);
        let snap = coordinator.cached();
        let group = snap.topology.group(1).unwrap();
        assert_eq!(group.servers[1].sync.state, SyncState::SyncedFailed);

        coordinator.remove_sync_action("r:1").await.unwrap();
        let snap = coordinator.cached();
        assert_eq!(
            snap.topology.group(1).unwrap().servers[1].sync.state,
            SyncState::Nothing
        );
    }

    #[tokio::test]
    async fn master_sync_action_detaches_instead_of_replicating() {
        let (coordinator, backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator.create_sync_action("m:1").await.unwrap();
        assert_eq!(coordinator.tick_sync_actions().await, 1);
        assert_eq!(
            backend.calls_matching("replicate m:1"),
            vec!["replicate m:1 master=none from_start=false".to_string()]
        );
    }

    #[tokio::test]
    async fn resync_group_clears_flag_only_when_proxies_answer() {
        let (coordinator, backend) = testkit::coordinator_with(replicated_cluster()).await;
        coordinator
            .mutate(|topology| {
                topology.proxy_seq += 1;
                topology.proxies.insert(
                    "t1".to_string(),
                    shardhelm_core::Proxy {
                        id: 1,
                        token: "t1".to_string(),
                        admin_addr: "p:1".to_string(),
                        proxy_addr: "p:2".to_string(),
                        datacenter: None,
                        start_time: String::new(),
                    },
                );
                topology.group_mut(1).unwrap().out_of_sync = true;
                Ok(())
            })
            .await
            .unwrap();

        backend.fail("p:1", "proxy down");
        let err = coordinator.resync_group(1).await.unwrap_err();
        assert!(matches!(err, CoordError::Unreachable { .. }));
        assert!(coordinator.cached().topology.group(1).unwrap().out_of_sync);

        backend.clear_fail("p:1");
        coordinator.resync_group(1).await.unwrap();
        assert!(!coordinator.cached().topology.group(1).unwrap().out_of_sync);
    }
}
