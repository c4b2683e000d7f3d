//! Staged group-expansion plans.
//!
//! A plan moves a slot range from a source group onto a freshly added, still
//! empty target group in four operator-driven phases: full data sync, replica
//! backup fan-out, slot-migration cut-over, and source-side cleanup. Every
//! phase is one admin call that validates its predecessor finished, so a
//! stalled pipeline resumes where it stopped but never runs out of order.
//! Plans persist next to the topology and survive coordinator restarts; the
//! slot-migration phase is the only one watched in the background, through
//! [`Coordinator::settle_plan_watches`] on the engine tick.

use shardhelm_core::{
    AddPlanRequest, CleanStep, ExpansionPlan, PlanAction, PlanStep, ServerStatus, Topology,
};
use tokio::time::Instant;
use tracing::{info, warn};

use super::core::Coordinator;
use crate::error::{Conflict, CoordError};

/// Binlog distance (bytes) the destination may still trail by when the
/// cut-over starts. Anything further behind must keep replicating first.
const MAX_BINLOG_GAP: u64 = 4 << 20;

impl Coordinator {
    // -----------------------------------------------------------------------
    // Plan CRUD
    // -----------------------------------------------------------------------

    /// Register a plan from its `src$dst$slots$speed$retention` head form and
    /// return the assigned id.
    ///
    /// The source group must own every named slot with no migration queued on
    /// it, the target group must hold servers but no slots, and neither group
    /// may appear in another plan or be mid-promotion.
    pub async fn add_plan(&self, text: &str) -> Result<u64, CoordError> {
        let req = AddPlanRequest::parse(text).map_err(|err| CoordError::validation(err.to_string()))?;
        let snapshot = self.refresh().await?;
        let topology = &snapshot.topology;
        for gid in [req.src_group, req.dst_group] {
            let Some(group) = topology.group(gid) else {
                return Err(CoordError::validation(format!("group {gid} does not exist")));
            };
            if group.servers.is_empty() {
                return Err(CoordError::validation(format!("group {gid} has no servers")));
            }
            if group.is_promoting() {
                return Err(Conflict::GroupNotReady { group: gid }.into());
            }
        }
        if topology.group_in_use(req.dst_group) {
            return Err(Conflict::GroupNotEmpty {
                group: req.dst_group,
            }
            .into());
        }
        for &sid in &req.slots {
            let Some(slot) = topology.slot(sid) else {
                return Err(CoordError::validation(format!("slot {sid} out of range")));
            };
            if slot.has_action() {
                return Err(Conflict::SlotBusy { slot: sid }.into());
            }
            if slot.group_id != req.src_group {
                return Err(CoordError::validation(format!(
                    "slot {sid} is owned by group {}, not source group {}",
                    slot.group_id, req.src_group
                )));
            }
        }

        let mut plans = self.lock_plans().await;
        for plan in plans.iter() {
            let taken = [plan.src_group, plan.dst_group];
            if taken.contains(&req.src_group) || taken.contains(&req.dst_group) {
                return Err(Conflict::PlanBusy { plan: plan.id }.into());
            }
        }
        let id = plans.iter().map(|plan| plan.id).max().unwrap_or(0) + 1;
        plans.push(ExpansionPlan::new(id, &req));
        self.persist_plans(&plans).await?;
        info!(
            plan = id,
            src = req.src_group,
            dst = req.dst_group,
            slots = req.slots.len(),
            "expansion plan added"
        );
        Ok(id)
    }

    /// All plans in their one-line record form, newest last.
    pub async fn pull_plan(&self) -> String {
        let plans = self.lock_plans().await;
        plans
            .iter()
            .map(ExpansionPlan::to_record)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Delete a settled plan. Plans with work in flight must finish or fail
    /// first.
    pub async fn del_plan(&self, plan_id: u64) -> Result<(), CoordError> {
        let mut plans = self.lock_plans().await;
        let idx = plan_index(&plans, plan_id)?;
        if plans[idx].in_flight() {
            return Err(Conflict::PlanBusy { plan: plan_id }.into());
        }
        plans.remove(idx);
        self.plan_watch_clear(plan_id);
        self.persist_plans(&plans).await?;
        info!(plan = plan_id, "expansion plan deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase 1: data sync
    // -----------------------------------------------------------------------

    /// Chain the destination master to the source master for a full resync.
    ///
    /// Every destination server is detached first so no stale replication
    /// keeps feeding it, then both masters get the plan's speed cap and
    /// binlog retention before the link is established from offset zero.
    pub async fn plan_sync(&self, plan_id: u64) -> Result<(), CoordError> {
        let mut plans = self.lock_plans().await;
        let idx = plan_index(&plans, plan_id)?;
        if plans[idx].step == PlanStep::Running {
            return Err(Conflict::PlanBusy { plan: plan_id }.into());
        }
        if !matches!(plans[idx].action, PlanAction::Nothing | PlanAction::DataSync) {
            return Err(Conflict::PlanStep {
                plan: plan_id,
                expected: "sync as the first step".to_string(),
                state: phase_label(&plans[idx]),
            }
            .into());
        }
        let speed = plans[idx].sync_speed;
        let retention = plans[idx].binlog_retention;
        let snapshot = self.refresh().await?;
        let src_master = master_of(&snapshot.topology, plans[idx].src_group)?;
        let (dst_master, dst_replicas) = roster_of(&snapshot.topology, plans[idx].dst_group)?;

        plans[idx].action = PlanAction::DataSync;
        plans[idx].step = PlanStep::Running;
        plans[idx].error.clear();
        self.persist_plans(&plans).await?;

        let outcome = self
            .establish_sync(&src_master, &dst_master, &dst_replicas, speed, retention)
            .await;
        match &outcome {
            Ok(()) => {
                plans[idx].step = PlanStep::Finished;
                info!(plan = plan_id, src = %src_master, dst = %dst_master, "expansion sync established");
            }
            Err(err) => {
                plans[idx].step = PlanStep::Nothing;
                plans[idx].error = err.to_string();
                warn!(plan = plan_id, %err, "expansion sync failed");
            }
        }
        self.persist_plans(&plans).await?;
        outcome
    }

    async fn establish_sync(
        &self,
        src_master: &str,
        dst_master: &str,
        dst_replicas: &[String],
        speed: u32,
        retention: u32,
    ) -> Result<(), CoordError> {
        let commands = self.server_commands();
        commands
            .replicate_from(dst_master, None, false)
            .await
            .map_err(|err| CoordError::unreachable(dst_master, err))?;
        for replica in dst_replicas {
            commands
                .replicate_from(replica, None, false)
                .await
                .map_err(|err| CoordError::unreachable(replica.as_str(), err))?;
        }
        for addr in [src_master, dst_master] {
            commands
                .set_sync_speed(addr, speed)
                .await
                .map_err(|err| CoordError::unreachable(addr, err))?;
        }
        for addr in [src_master, dst_master] {
            commands
                .set_binlog_retention(addr, retention)
                .await
                .map_err(|err| CoordError::unreachable(addr, err))?;
        }
        commands
            .replicate_from(dst_master, Some(src_master), true)
            .await
            .map_err(|err| CoordError::unreachable(dst_master, err))
    }

    // -----------------------------------------------------------------------
    // Phase 2: replica backup
    // -----------------------------------------------------------------------

    /// Fan the synced data out to the destination replicas.
    ///
    /// With no replicas the phase records itself as skipped. With replicas it
    /// re-points each of them at the destination master for a full resync,
    /// which discards whatever they held before, so `force` is required.
    pub async fn plan_backup(&self, plan_id: u64, force: bool) -> Result<(), CoordError> {
        let mut plans = self.lock_plans().await;
        let idx = plan_index(&plans, plan_id)?;
        if plans[idx].step == PlanStep::Running {
            return Err(Conflict::PlanBusy { plan: plan_id }.into());
        }
        match (plans[idx].action, plans[idx].step) {
            (PlanAction::Backup, PlanStep::Finished) => return Ok(()),
            (PlanAction::DataSync, PlanStep::Finished) | (PlanAction::Backup, _) => {}
            _ => {
                return Err(Conflict::PlanStep {
                    plan: plan_id,
                    expected: "a finished sync step".to_string(),
                    state: phase_label(&plans[idx]),
                }
                .into())
            }
        }
        let snapshot = self.refresh().await?;
        let (dst_master, replicas) = roster_of(&snapshot.topology, plans[idx].dst_group)?;
        if replicas.is_empty() {
            plans[idx].action = PlanAction::Backup;
            plans[idx].step = PlanStep::Finished;
            plans[idx].error.clear();
            self.persist_plans(&plans).await?;
            info!(plan = plan_id, "destination has no replicas, backup step skipped");
            return Ok(());
        }
        if !force {
            return Err(Conflict::BackupRequired { plan: plan_id }.into());
        }

        plans[idx].action = PlanAction::Backup;
        plans[idx].step = PlanStep::Running;
        plans[idx].error.clear();
        self.persist_plans(&plans).await?;

        let mut outcome = Ok(());
        for replica in &replicas {
            if let Err(err) = self
                .server_commands()
                .replicate_from(replica, Some(dst_master.as_str()), true)
                .await
            {
                outcome = Err(CoordError::unreachable(replica.as_str(), err));
                break;
            }
        }
        match &outcome {
            Ok(()) => {
                plans[idx].step = PlanStep::Finished;
                info!(plan = plan_id, replicas = replicas.len(), "expansion backup chained");
            }
            Err(err) => {
                plans[idx].step = PlanStep::Nothing;
                plans[idx].error = err.to_string();
                warn!(plan = plan_id, %err, "expansion backup failed");
            }
        }
        self.persist_plans(&plans).await?;
        outcome
    }

    // -----------------------------------------------------------------------
    // Phase 3: slot-migration cut-over
    // -----------------------------------------------------------------------

    /// Cut the plan's slots over to the destination group.
    ///
    /// On first entry the destination master must be replicating from the
    /// source master within [`MAX_BINLOG_GAP`] bytes of its binlog head; it
    /// is then detached (its replicas keep following it) and the plan's slots
    /// are queued for migration. A re-run after a watch timeout skips the
    /// replication checks, re-queues whatever has not landed yet and resumes
    /// watching.
    pub async fn plan_slots_migrate(&self, plan_id: u64) -> Result<(), CoordError> {
        let mut plans = self.lock_plans().await;
        let idx = plan_index(&plans, plan_id)?;
        let resuming = match (plans[idx].action, plans[idx].step) {
            (PlanAction::SlotsMigrate, PlanStep::Finished) => return Ok(()),
            (PlanAction::SlotsMigrate, PlanStep::Running) => {
                // Re-arm after a restart; settle ticks do the same.
                if self.plan_watch_deadline(plan_id).is_none() {
                    self.plan_watch_arm(plan_id, self.watch_deadline());
                }
                return Err(Conflict::PlanBusy { plan: plan_id }.into());
            }
            (PlanAction::SlotsMigrate, PlanStep::Nothing) => true,
            (PlanAction::Backup, PlanStep::Finished) => false,
            _ => {
                return Err(Conflict::PlanStep {
                    plan: plan_id,
                    expected: "a finished backup step".to_string(),
                    state: phase_label(&plans[idx]),
                }
                .into())
            }
        };
        let slots = plans[idx].slots().map_err(|err| {
            CoordError::fatal(format!("plan {plan_id} slot list corrupted: {err}"))
        })?;
        let (src, dst) = (plans[idx].src_group, plans[idx].dst_group);
        let snapshot = self.refresh().await?;
        let src_master = master_of(&snapshot.topology, src)?;
        let (dst_master, _) = roster_of(&snapshot.topology, dst)?;
        let commands = self.server_commands();

        if !resuming {
            let src_repl = commands
                .replication_status(&src_master)
                .await
                .map_err(|err| CoordError::unreachable(src_master.as_str(), err))?;
            let dst_repl = commands
                .replication_status(&dst_master)
                .await
                .map_err(|err| CoordError::unreachable(dst_master.as_str(), err))?;
            let gap = src_repl.binlog_offset.saturating_sub(dst_repl.binlog_offset);
            let adjacent = dst_repl.link_up
                && dst_repl.master_addr.as_deref() == Some(src_master.as_str())
                && dst_repl.binlog_file == src_repl.binlog_file
                && gap <= MAX_BINLOG_GAP;
            if !adjacent {
                return Err(Conflict::PlanStep {
                    plan: plan_id,
                    expected: "destination in sync with the source binlog".to_string(),
                    state: format!(
                        "destination follows {} link_up={} at binlog {}:{}, source at {}:{}",
                        dst_repl.master_addr.as_deref().unwrap_or("nobody"),
                        dst_repl.link_up,
                        dst_repl.binlog_file,
                        dst_repl.binlog_offset,
                        src_repl.binlog_file,
                        src_repl.binlog_offset,
                    ),
                }
                .into());
            }
            commands
                .replicate_from(&dst_master, None, false)
                .await
                .map_err(|err| CoordError::unreachable(dst_master.as_str(), err))?;
        }
        commands
            .set_migrate_enabled(&src_master, true)
            .await
            .map_err(|err| CoordError::unreachable(src_master.as_str(), err))?;

        let queued = self.enqueue_plan_migrations(src, dst, &slots).await?;
        plans[idx].action = PlanAction::SlotsMigrate;
        plans[idx].step = PlanStep::Running;
        plans[idx].error.clear();
        self.persist_plans(&plans).await?;
        self.plan_watch_arm(plan_id, self.watch_deadline());
        info!(
            plan = plan_id,
            queued,
            total = slots.len(),
            resuming,
            "expansion slot migrations queued"
        );
        Ok(())
    }

    /// Settle running slot-migration phases against the current topology.
    ///
    /// Runs on every engine tick. A plan whose slots all landed on the
    /// destination is marked finished; one that outlives its watch deadline
    /// drops back to a re-runnable step with the timeout recorded.
    pub(crate) async fn settle_plan_watches(&self) {
        let snapshot = match self.refresh().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "plan watch skipped, topology read failed");
                return;
            }
        };
        let now = Instant::now();
        let mut plans = self.lock_plans().await;
        let mut dirty = false;
        for plan in plans.iter_mut() {
            if plan.action != PlanAction::SlotsMigrate || plan.step != PlanStep::Running {
                continue;
            }
            let slots = match plan.slots() {
                Ok(slots) => slots,
                Err(err) => {
                    warn!(plan = plan.id, %err, "plan slot list corrupted, not watching");
                    continue;
                }
            };
            let landed = slots.iter().all(|&sid| {
                snapshot
                    .topology
                    .slot(sid)
                    .is_some_and(|slot| slot.group_id == plan.dst_group && !slot.has_action())
            });
            if landed {
                plan.step = PlanStep::Finished;
                plan.error.clear();
                self.plan_watch_clear(plan.id);
                info!(plan = plan.id, "expansion slot migrations finished");
                dirty = true;
                continue;
            }
            let deadline = match self.plan_watch_deadline(plan.id) {
                Some(deadline) => deadline,
                None => {
                    // Loaded from the store after a restart; watch anew.
                    let deadline = self.watch_deadline();
                    self.plan_watch_arm(plan.id, deadline);
                    deadline
                }
            };
            if now >= deadline {
                plan.step = PlanStep::Nothing;
                plan.error = "slot migrations did not finish in time; re-run slots-migrate to resume"
                    .to_string();
                self.plan_watch_clear(plan.id);
                warn!(plan = plan.id, "expansion slot migrations timed out");
                dirty = true;
            }
        }
        if dirty {
            if let Err(err) = self.persist_plans(&plans).await {
                warn!(%err, "expansion plan save failed");
            }
        }
    }

    fn watch_deadline(&self) -> Instant {
        Instant::now() + self.config().migrate_watch_timeout
    }

    // -----------------------------------------------------------------------
    // Phase 4: source cleanup
    // -----------------------------------------------------------------------

    /// Advance the source-side cleanup by one sub-step.
    ///
    /// The pipeline is reload the slot indexes, purge data of slots the
    /// source no longer owns, purge the migrated slots' key indexes, then
    /// compact. Each call issues one of those and returns; the next call
    /// refuses to proceed while the poller still sees the previous reload or
    /// purge running.
    pub async fn plan_clean(&self, plan_id: u64) -> Result<(), CoordError> {
        let mut plans = self.lock_plans().await;
        let idx = plan_index(&plans, plan_id)?;
        match (plans[idx].action, plans[idx].step) {
            (PlanAction::SlotsMigrate, PlanStep::Finished) => {
                plans[idx].action = PlanAction::DataClean;
                plans[idx].step = PlanStep::Running;
                plans[idx].status = CleanStep::Nothing;
                plans[idx].error.clear();
            }
            (PlanAction::DataClean, _) if plans[idx].status == CleanStep::Done => return Ok(()),
            (PlanAction::DataClean, _) => {}
            _ => {
                return Err(Conflict::PlanStep {
                    plan: plan_id,
                    expected: "finished slot migrations".to_string(),
                    state: phase_label(&plans[idx]),
                }
                .into())
            }
        }
        let slots = plans[idx].slots().map_err(|err| {
            CoordError::fatal(format!("plan {plan_id} slot list corrupted: {err}"))
        })?;
        let src = plans[idx].src_group;
        match self.advance_clean(plan_id, plans[idx].status, src, &slots).await {
            Ok(next) => {
                plans[idx].status = next;
                plans[idx].error.clear();
                if next == CleanStep::Done {
                    plans[idx].step = PlanStep::Finished;
                    info!(plan = plan_id, "expansion clean finished");
                } else {
                    info!(plan = plan_id, status = ?next, "expansion clean advanced");
                }
                self.persist_plans(&plans).await?;
                Ok(())
            }
            Err(err) => {
                // Wait-for-server conflicts clear themselves; only real
                // failures are worth recording on the plan.
                if err.conflict().is_none() {
                    plans[idx].error = err.to_string();
                    if let Err(save) = self.persist_plans(&plans).await {
                        warn!(plan = plan_id, %save, "expansion plan save failed");
                    }
                    warn!(plan = plan_id, %err, "expansion clean step failed");
                }
                Err(err)
            }
        }
    }

    async fn advance_clean(
        &self,
        plan_id: u64,
        status: CleanStep,
        src: u32,
        slots: &[usize],
    ) -> Result<CleanStep, CoordError> {
        let snapshot = self.refresh().await?;
        let master = master_of(&snapshot.topology, src)?;
        let state = self.polled_status(&master)?;
        let commands = self.server_commands();
        let next = match status {
            CleanStep::Nothing => {
                commands
                    .reload_slots(&master)
                    .await
                    .map_err(|err| CoordError::unreachable(master.as_str(), err))?;
                CleanStep::SlotsReload
            }
            CleanStep::SlotsReload => {
                if state.reload_in_progress {
                    return Err(Conflict::PlanBusy { plan: plan_id }.into());
                }
                let owned = snapshot.topology.slots_of_group(src);
                commands
                    .purge_slots(&master, &owned)
                    .await
                    .map_err(|err| CoordError::unreachable(master.as_str(), err))?;
                CleanStep::SlotsPurge
            }
            CleanStep::SlotsPurge => {
                if state.purge_in_progress {
                    return Err(Conflict::PlanBusy { plan: plan_id }.into());
                }
                for &sid in slots {
                    commands
                        .purge_slot_index(&master, sid)
                        .await
                        .map_err(|err| CoordError::unreachable(master.as_str(), err))?;
                }
                CleanStep::SlotIndexPurge
            }
            CleanStep::SlotIndexPurge => {
                commands
                    .compact(&master)
                    .await
                    .map_err(|err| CoordError::unreachable(master.as_str(), err))?;
                CleanStep::Compact
            }
            CleanStep::Compact | CleanStep::Done => CleanStep::Done,
        };
        Ok(next)
    }

    /// Purge data of slots a group no longer owns, outside any plan.
    ///
    /// Refused while a plan covers the group or while the poller still sees
    /// a reload or purge running there.
    pub async fn plan_group_clean(&self, gid: u32) -> Result<(), CoordError> {
        let snapshot = self.refresh().await?;
        let master = master_of(&snapshot.topology, gid)?;
        let plans = self.lock_plans().await;
        if let Some(plan) = plans
            .iter()
            .find(|plan| plan.src_group == gid || plan.dst_group == gid)
        {
            return Err(Conflict::PlanBusy { plan: plan.id }.into());
        }
        let state = self.polled_status(&master)?;
        if state.reload_in_progress || state.purge_in_progress {
            return Err(Conflict::GroupNotReady { group: gid }.into());
        }
        let owned = snapshot.topology.slots_of_group(gid);
        self.server_commands()
            .purge_slots(&master, &owned)
            .await
            .map_err(|err| CoordError::unreachable(master.as_str(), err))?;
        info!(group = gid, owned = owned.len(), "stray-slot purge started");
        Ok(())
    }

    /// The poller's last healthy view of a server, required before cleanup
    /// touches it.
    fn polled_status(&self, addr: &str) -> Result<ServerStatus, CoordError> {
        let Some(probe) = self.registry().server(addr) else {
            return Err(CoordError::unreachable(
                addr,
                "no stats probe for this server yet",
            ));
        };
        if !probe.is_healthy() {
            let detail = probe
                .error
                .unwrap_or_else(|| "stats probe unhealthy".to_string());
            return Err(CoordError::unreachable(addr, detail));
        }
        probe
            .data
            .ok_or_else(|| CoordError::unreachable(addr, "stats probe carries no data"))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn plan_index(plans: &[ExpansionPlan], id: u64) -> Result<usize, CoordError> {
    plans
        .iter()
        .position(|plan| plan.id == id)
        .ok_or_else(|| CoordError::validation(format!("plan {id} does not exist")))
}

fn phase_label(plan: &ExpansionPlan) -> String {
    format!("{:?}/{:?}", plan.action, plan.step)
}

fn master_of(topology: &Topology, gid: u32) -> Result<String, CoordError> {
    let group = topology
        .group(gid)
        .ok_or_else(|| CoordError::validation(format!("group {gid} does not exist")))?;
    group
        .master_addr()
        .map(str::to_string)
        .ok_or_else(|| CoordError::validation(format!("group {gid} has no servers")))
}

/// Master plus replicas of a group, by address.
fn roster_of(topology: &Topology, gid: u32) -> Result<(String, Vec<String>), CoordError> {
    let group = topology
        .group(gid)
        .ok_or_else(|| CoordError::validation(format!("group {gid} does not exist")))?;
    let Some(master) = group.master_addr() else {
        return Err(CoordError::validation(format!("group {gid} has no servers")));
    };
    let replicas = group
        .servers
        .iter()
        .skip(1)
        .map(|server| server.addr.clone())
        .collect();
    Ok((master.to_string(), replicas))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::coordinator::poller::{Probe, ProbeState};
    use crate::coordinator::testkit::{self, MockBackend};
    use shardhelm_core::ServerRole;

    fn expansion_cluster() -> Topology {
        testkit::topology_with_slots(
            &[(1, &["m:1", "r:1"]), (2, &["d:1", "d:2"])],
            &[(0, 1023, 1)],
        )
    }

    async fn plan_phase(coordinator: &Coordinator) -> (PlanAction, PlanStep) {
        let plans = coordinator.lock_plans().await;
        (plans[0].action, plans[0].step)
    }

    async fn plan_error(coordinator: &Coordinator) -> String {
        let plans = coordinator.lock_plans().await;
        plans[0].error.clone()
    }

    fn seed_probe(coordinator: &Coordinator, addr: &str, reload: bool, purge: bool) {
        let status = ServerStatus {
            role: ServerRole::Master,
            master_addr: None,
            master_link_up: false,
            keys: 0,
            mem_used_bytes: 0,
            ops_per_sec: 0,
            mean_latency_us: 0,
            reload_in_progress: reload,
            purge_in_progress: purge,
        };
        coordinator.registry().servers.insert(
            addr.to_string(),
            Probe {
                state: ProbeState::Healthy,
                data: Some(status),
                error: None,
                checked_at_ms: 1,
                elapsed_ms: 1,
            },
        );
    }

    /// Drive a plan through sync, backup and the migration cut-over until
    /// its slots have landed.
    async fn migrate_to_finished(coordinator: &Coordinator, backend: &MockBackend) {
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();
        coordinator.plan_backup(1, true).await.unwrap();
        backend.set_replication("m:1", None, 7, 5000, true);
        backend.set_replication("d:1", Some("m:1"), 7, 4900, true);
        coordinator.plan_slots_migrate(1).await.unwrap();
        coordinator.tick_slot_actions().await;
        coordinator.settle_plan_watches().await;
    }

    #[tokio::test]
    async fn add_plan_assigns_ids_and_pull_plan_lists_records() {
        let (coordinator, _backend) = testkit::coordinator_with(expansion_cluster()).await;
        let id = coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(coordinator.pull_plan().await, "1$1$2$0-9$30$48$0$0$0$");
    }

    #[tokio::test]
    async fn add_plan_validates_groups_slots_and_overlap() {
        let (coordinator, _backend) = testkit::coordinator_with(expansion_cluster()).await;

        let err = coordinator.add_plan("not-a-plan").await.unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));

        let err = coordinator.add_plan("7$2$0-9$0$0").await.unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));

        // The target of "2$1$..." already owns slots.
        let err = coordinator.add_plan("2$1$0-9$0$0").await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::GroupNotEmpty { group: 1 }));

        coordinator.create_slot_action(3, 2).await.unwrap();
        let err = coordinator.add_plan("1$2$0-9$0$0").await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::SlotBusy { slot: 3 }));
        coordinator.remove_slot_action(3).await.unwrap();

        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        let err = coordinator.add_plan("1$2$100-199$0$0").await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::PlanBusy { plan: 1 }));
    }

    #[tokio::test]
    async fn plan_steps_refuse_to_run_out_of_order() {
        let (coordinator, _backend) = testkit::coordinator_with(expansion_cluster()).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();

        let err = coordinator.plan_slots_migrate(1).await.unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::PlanStep {
                plan: 1,
                expected: "a finished backup step".to_string(),
                state: "Nothing/Nothing".to_string(),
            })
        );

        let err = coordinator.plan_backup(1, true).await.unwrap_err();
        assert!(matches!(err.conflict(), Some(Conflict::PlanStep { .. })));

        let err = coordinator.plan_clean(1).await.unwrap_err();
        assert!(matches!(err.conflict(), Some(Conflict::PlanStep { .. })));
    }

    #[tokio::test]
    async fn sync_detaches_then_chains_the_destination_master() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();

        assert_eq!(
            backend.calls(),
            vec![
                "replicate d:1 master=none from_start=false",
                "replicate d:2 master=none from_start=false",
                "sync-speed m:1 30",
                "sync-speed d:1 30",
                "binlog-retention m:1 48",
                "binlog-retention d:1 48",
                "replicate d:1 master=m:1 from_start=true",
            ]
        );
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::DataSync, PlanStep::Finished)
        );
    }

    #[tokio::test]
    async fn sync_failure_is_recorded_and_rerunnable() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();

        backend.fail("d:2", "connection refused");
        let err = coordinator.plan_sync(1).await.unwrap_err();
        assert!(matches!(err, CoordError::Unreachable { .. }));
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::DataSync, PlanStep::Nothing)
        );
        assert!(plan_error(&coordinator).await.contains("connection refused"));

        backend.clear_fail("d:2");
        coordinator.plan_sync(1).await.unwrap();
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::DataSync, PlanStep::Finished)
        );
        assert!(plan_error(&coordinator).await.is_empty());
    }

    #[tokio::test]
    async fn backup_requires_force_when_replicas_exist() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();

        let err = coordinator.plan_backup(1, false).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::BackupRequired { plan: 1 }));
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::DataSync, PlanStep::Finished)
        );

        coordinator.plan_backup(1, true).await.unwrap();
        let chained = backend.calls_matching("replicate d:2 master=d:1");
        assert_eq!(chained, vec!["replicate d:2 master=d:1 from_start=true"]);
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::Backup, PlanStep::Finished)
        );

        // Re-running a finished backup is a no-op.
        let before = backend.calls().len();
        coordinator.plan_backup(1, true).await.unwrap();
        assert_eq!(backend.calls().len(), before);
    }

    #[tokio::test]
    async fn backup_skips_when_destination_has_one_server() {
        let topology = testkit::topology_with_slots(
            &[(1, &["m:1"]), (2, &["d:1"])],
            &[(0, 1023, 1)],
        );
        let (coordinator, backend) = testkit::coordinator_with(topology).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();

        coordinator.plan_backup(1, false).await.unwrap();
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::Backup, PlanStep::Finished)
        );
        // Only the sync phase touched replication.
        assert_eq!(backend.calls_matching("replicate").len(), 2);
    }

    #[tokio::test]
    async fn slots_migrate_checks_replication_adjacency() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();
        coordinator.plan_backup(1, true).await.unwrap();

        // Different binlog file means the resync has not caught up.
        backend.set_replication("m:1", None, 4, 100, true);
        backend.set_replication("d:1", Some("m:1"), 3, 900, true);
        let err = coordinator.plan_slots_migrate(1).await.unwrap_err();
        assert!(matches!(err.conflict(), Some(Conflict::PlanStep { .. })));
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::Backup, PlanStep::Finished)
        );
        let snapshot = coordinator.cached();
        assert!(snapshot.topology.slots.iter().all(|slot| slot.action.is_none()));
    }

    #[tokio::test]
    async fn slots_migrate_queues_and_settles_when_slots_land() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();
        coordinator.plan_backup(1, true).await.unwrap();
        backend.set_replication("m:1", None, 7, 5000, true);
        backend.set_replication("d:1", Some("m:1"), 7, 4900, true);

        coordinator.plan_slots_migrate(1).await.unwrap();
        assert_eq!(
            backend.calls_matching("migrate-enabled"),
            vec!["migrate-enabled m:1 true"]
        );
        let snapshot = coordinator.cached();
        let queued: Vec<usize> = snapshot
            .topology
            .slots
            .iter()
            .filter(|slot| slot.action.is_some())
            .map(|slot| slot.id)
            .collect();
        assert_eq!(queued, (0..10).collect::<Vec<_>>());
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::SlotsMigrate, PlanStep::Running)
        );

        // While running, another cut-over call reports the plan busy.
        let err = coordinator.plan_slots_migrate(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::PlanBusy { plan: 1 }));

        coordinator.tick_slot_actions().await;
        coordinator.settle_plan_watches().await;
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::SlotsMigrate, PlanStep::Finished)
        );
        assert!(coordinator.plan_watch_deadline(1).is_none());
        let snapshot = coordinator.cached();
        for sid in 0..10 {
            assert_eq!(snapshot.topology.slots[sid].group_id, 2);
        }

        // Finished cut-over is idempotent.
        coordinator.plan_slots_migrate(1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slots_migrate_watch_times_out_and_rerun_resumes() {
        let (coordinator, backend) =
            testkit::coordinator_tuned(expansion_cluster(), |config| {
                config.migrate_watch_timeout = Duration::from_secs(5);
            })
            .await;
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        coordinator.plan_sync(1).await.unwrap();
        coordinator.plan_backup(1, true).await.unwrap();
        backend.set_replication("m:1", None, 7, 5000, true);
        backend.set_replication("d:1", Some("m:1"), 7, 4900, true);
        coordinator.plan_slots_migrate(1).await.unwrap();

        // Nothing moves; the watch deadline passes.
        tokio::time::sleep(Duration::from_secs(6)).await;
        coordinator.settle_plan_watches().await;
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::SlotsMigrate, PlanStep::Nothing)
        );
        assert!(plan_error(&coordinator).await.contains("did not finish"));

        // The re-run skips the replication checks, keeps the queued actions
        // and re-enables migration on the source.
        coordinator.plan_slots_migrate(1).await.unwrap();
        assert_eq!(backend.calls_matching("migrate-enabled m:1 true").len(), 2);
        let snapshot = coordinator.cached();
        let queued = snapshot
            .topology
            .slots
            .iter()
            .filter(|slot| slot.action.is_some())
            .count();
        assert_eq!(queued, 10);
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::SlotsMigrate, PlanStep::Running)
        );
        assert!(plan_error(&coordinator).await.is_empty());
    }

    #[tokio::test]
    async fn clean_advances_one_sub_step_per_call() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        migrate_to_finished(&coordinator, &backend).await;
        seed_probe(&coordinator, "m:1", false, false);

        coordinator.plan_clean(1).await.unwrap();
        assert_eq!(backend.calls_matching("reload-slots"), vec!["reload-slots m:1"]);

        // Poller still sees the reload running.
        seed_probe(&coordinator, "m:1", true, false);
        let err = coordinator.plan_clean(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::PlanBusy { plan: 1 }));
        assert!(plan_error(&coordinator).await.is_empty());

        seed_probe(&coordinator, "m:1", false, false);
        coordinator.plan_clean(1).await.unwrap();
        assert_eq!(
            backend.calls_matching("purge-slots"),
            vec!["purge-slots m:1 owned=1014"]
        );

        coordinator.plan_clean(1).await.unwrap();
        assert_eq!(backend.calls_matching("purge-slot-index").len(), 10);

        coordinator.plan_clean(1).await.unwrap();
        assert_eq!(backend.calls_matching("compact"), vec!["compact m:1"]);

        coordinator.plan_clean(1).await.unwrap();
        assert_eq!(
            plan_phase(&coordinator).await,
            (PlanAction::DataClean, PlanStep::Finished)
        );

        // Done plans absorb further clean calls without new work.
        let before = backend.calls().len();
        coordinator.plan_clean(1).await.unwrap();
        assert_eq!(backend.calls().len(), before);
    }

    #[tokio::test]
    async fn clean_outage_is_recorded_and_busy_plans_refuse_delete() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        migrate_to_finished(&coordinator, &backend).await;

        // No poller probe for the source master yet.
        let err = coordinator.plan_clean(1).await.unwrap_err();
        assert!(matches!(err, CoordError::Unreachable { .. }));
        assert!(plan_error(&coordinator).await.contains("probe"));

        let err = coordinator.del_plan(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::PlanBusy { plan: 1 }));

        seed_probe(&coordinator, "m:1", false, false);
        for _ in 0..5 {
            coordinator.plan_clean(1).await.unwrap();
        }
        coordinator.del_plan(1).await.unwrap();
        assert_eq!(coordinator.pull_plan().await, "");
    }

    #[tokio::test]
    async fn group_clean_purges_only_spare_groups() {
        let (coordinator, backend) = testkit::coordinator_with(expansion_cluster()).await;
        seed_probe(&coordinator, "m:1", false, false);

        coordinator.plan_group_clean(1).await.unwrap();
        assert_eq!(
            backend.calls_matching("purge-slots"),
            vec!["purge-slots m:1 owned=1024"]
        );

        seed_probe(&coordinator, "m:1", true, false);
        let err = coordinator.plan_group_clean(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::GroupNotReady { group: 1 }));

        seed_probe(&coordinator, "m:1", false, false);
        coordinator.add_plan("1$2$0-9$30$48").await.unwrap();
        let err = coordinator.plan_group_clean(1).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::PlanBusy { plan: 1 }));
    }

    #[tokio::test]
    async fn del_plan_rejects_unknown_ids() {
        let (coordinator, _backend) = testkit::coordinator_with(expansion_cluster()).await;
        let err = coordinator.del_plan(9).await.unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));
    }
}
