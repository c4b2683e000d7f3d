//! Slot migration engine.
//!
//! Migrations are queued as per-slot actions inside the topology document
//! and drained by a background tick. One tick selects up to
//! `migration_parallel` runnable actions in ascending queue order, never two
//! sharing a source or target group, and runs them concurrently. Each
//! running action moves key batches until the source reports zero keys left,
//! then flips ownership and clears the action in a single topology write.

use std::collections::BTreeSet;

use futures_util::future;
use shardhelm_core::{valid_group_id, ActionState, SlotAction, Topology, SLOT_COUNT};
use tracing::{info, warn};

use super::core::Coordinator;
use crate::error::{Conflict, CoordError};

/// Sentinel for the benign race where an operator cancels a pending action
/// between the engine selecting it and marking it migrating.
const ACTION_VANISHED: &str = "slot action vanished";

fn vanished(err: &CoordError) -> bool {
    matches!(err, CoordError::Validation(msg) if msg == ACTION_VANISHED)
}

/// Everything a batch loop needs, captured in the same write that marks the
/// action migrating.
struct MigrationContext {
    src_master: String,
    dst_master: String,
    target: u32,
}

/// One action chosen for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SelectedAction {
    pub sid: usize,
    pub src: u32,
    pub dst: u32,
}

// ---------------------------------------------------------------------------
// Queueing
// ---------------------------------------------------------------------------

/// Shared per-slot checks for enqueueing a migration, applied against the
/// freshly read topology inside the mutation closure.
pub(crate) fn enqueue_action(
    topology: &mut Topology,
    sid: usize,
    target: u32,
    index: u64,
) -> Result<(), CoordError> {
    let Some(slot) = topology.slot(sid) else {
        return Err(CoordError::validation(format!(
            "slot {sid} out of range (0..{SLOT_COUNT})"
        )));
    };
    if slot.has_action() {
        return Err(Conflict::SlotBusy { slot: sid }.into());
    }
    if slot.group_id == target {
        return Err(CoordError::validation(format!(
            "slot {sid} already belongs to group {target}"
        )));
    }
    if !slot.is_assigned() {
        return Err(CoordError::validation(format!(
            "slot {sid} has no owner; assign it instead of migrating"
        )));
    }
    let src = slot.group_id;
    let Some(src_group) = topology.group(src) else {
        return Err(CoordError::fatal(format!(
            "slot {sid} owned by unknown group {src}"
        )));
    };
    if src_group.is_promoting() {
        return Err(Conflict::GroupNotReady { group: src }.into());
    }
    match topology.group(target) {
        None => {
            return Err(CoordError::validation(format!(
                "target group {target} does not exist"
            )))
        }
        Some(group) if group.servers.is_empty() => {
            return Err(CoordError::validation(format!(
                "target group {target} has no servers"
            )))
        }
        Some(group) if group.is_promoting() => {
            return Err(Conflict::GroupNotReady { group: target }.into());
        }
        Some(_) => {}
    }
    if let Some(slot) = topology.slot_mut(sid) {
        slot.action = Some(SlotAction::pending(index, target));
    }
    Ok(())
}

impl Coordinator {
    /// Queue a migration of one slot to `target`.
    pub async fn create_slot_action(&self, sid: usize, target: u32) -> Result<(), CoordError> {
        if !valid_group_id(target) {
            return Err(CoordError::validation(format!(
                "invalid target group {target}"
            )));
        }
        self.mutate(move |topology| {
            let index = topology.max_action_index() + 1;
            enqueue_action(topology, sid, target, index)
        })
        .await?;
        info!(slot = sid, target, "slot migration queued");
        Ok(())
    }

    /// Queue migrations for `count` slots currently owned by `src`, lowest
    /// slot ids first.
    pub async fn create_slot_actions_some(
        &self,
        src: u32,
        target: u32,
        count: usize,
    ) -> Result<Vec<usize>, CoordError> {
        if !valid_group_id(src) || !valid_group_id(target) {
            return Err(CoordError::validation("invalid group id"));
        }
        if src == target {
            return Err(CoordError::validation(
                "source and target group are the same",
            ));
        }
        if count == 0 {
            return Err(CoordError::validation("slot count must be >= 1"));
        }
        let picked = self
            .mutate(move |topology| {
                let available: Vec<usize> = topology
                    .slots
                    .iter()
                    .filter(|slot| slot.group_id == src && !slot.has_action())
                    .map(|slot| slot.id)
                    .collect();
                if available.len() < count {
                    return Err(CoordError::validation(format!(
                        "group {src} owns only {} migratable slots, {count} requested",
                        available.len()
                    )));
                }
                let mut index = topology.max_action_index();
                let picked: Vec<usize> = available.into_iter().take(count).collect();
                for &sid in &picked {
                    index += 1;
                    enqueue_action(topology, sid, target, index)?;
                }
                Ok(picked)
            })
            .await?;
        info!(src, target, count = picked.len(), "slot migrations queued");
        Ok(picked)
    }

    /// Queue migrations for every slot in `beg..=end`. All-or-nothing: one
    /// ineligible slot rejects the whole range.
    pub async fn create_slot_actions_range(
        &self,
        beg: usize,
        end: usize,
        target: u32,
    ) -> Result<(), CoordError> {
        if beg > end || end >= SLOT_COUNT {
            return Err(CoordError::validation(format!(
                "invalid slot range [{beg}, {end}]"
            )));
        }
        if !valid_group_id(target) {
            return Err(CoordError::validation(format!(
                "invalid target group {target}"
            )));
        }
        self.mutate(move |topology| {
            let mut index = topology.max_action_index();
            for sid in beg..=end {
                index += 1;
                enqueue_action(topology, sid, target, index)?;
            }
            Ok(())
        })
        .await?;
        info!(beg, end, target, "slot range migration queued");
        Ok(())
    }

    /// Queue migrations for an expansion plan. Slots already owned by the
    /// target, or already queued toward it, are skipped so a retried plan
    /// resumes where it left off. Returns how many actions were enqueued.
    pub(crate) async fn enqueue_plan_migrations(
        &self,
        src: u32,
        target: u32,
        sids: &[usize],
    ) -> Result<usize, CoordError> {
        let sids = sids.to_vec();
        self.mutate(move |topology| {
            let mut index = topology.max_action_index();
            let mut queued = 0;
            for &sid in &sids {
                let Some(slot) = topology.slot(sid) else {
                    return Err(CoordError::validation(format!("slot {sid} out of range")));
                };
                if slot.group_id == target {
                    continue;
                }
                if let Some(action) = &slot.action {
                    if action.target_id == target {
                        continue;
                    }
                    return Err(Conflict::SlotBusy { slot: sid }.into());
                }
                if slot.group_id != src {
                    return Err(CoordError::validation(format!(
                        "slot {sid} is owned by group {}, expected {src}",
                        slot.group_id
                    )));
                }
                index += 1;
                enqueue_action(topology, sid, target, index)?;
                queued += 1;
            }
            Ok(queued)
        })
        .await
    }

    /// Cancel one queued migration. Only pending actions can be cancelled.
    pub async fn remove_slot_action(&self, sid: usize) -> Result<(), CoordError> {
        self.mutate(move |topology| {
            let Some(slot) = topology.slot(sid) else {
                return Err(CoordError::validation(format!("slot {sid} out of range")));
            };
            match &slot.action {
                None => Err(CoordError::validation(format!(
                    "slot {sid} has no migration queued"
                ))),
                Some(action) if action.state == ActionState::Pending => {
                    if let Some(slot) = topology.slot_mut(sid) {
                        slot.action = None;
                    }
                    Ok(())
                }
                Some(_) => Err(Conflict::MigrationInProgress { slot: sid }.into()),
            }
        })
        .await?;
        info!(slot = sid, "slot migration cancelled");
        Ok(())
    }

    /// Cancel every pending migration. Running ones are left to finish.
    pub async fn remove_all_slot_actions(&self) -> Result<usize, CoordError> {
        let removed = self
            .mutate(|topology| {
                let mut removed = 0;
                for slot in &mut topology.slots {
                    if matches!(&slot.action, Some(action) if action.state == ActionState::Pending)
                    {
                        slot.action = None;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await?;
        info!(removed, "pending slot migrations cancelled");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Direct assignment
    // -----------------------------------------------------------------------

    /// Rewrite slot ownership directly, without moving data. Every slot must
    /// be free of actions and every target group must have servers.
    pub async fn assign_slots(&self, assignments: &[(usize, u32)]) -> Result<(), CoordError> {
        if assignments.is_empty() {
            return Err(CoordError::validation("no slot assignments given"));
        }
        let assignments = assignments.to_vec();
        let sids: Vec<usize> = assignments.iter().map(|(sid, _)| *sid).collect();
        self.mutate(move |topology| {
            for &(sid, gid) in &assignments {
                if !valid_group_id(gid) {
                    return Err(CoordError::validation(format!("invalid group id {gid}")));
                }
                match topology.group(gid) {
                    None => {
                        return Err(CoordError::validation(format!(
                            "group {gid} does not exist"
                        )))
                    }
                    Some(group) if group.servers.is_empty() => {
                        return Err(CoordError::validation(format!(
                            "group {gid} has no servers"
                        )))
                    }
                    Some(_) => {}
                }
                let Some(slot) = topology.slot_mut(sid) else {
                    return Err(CoordError::validation(format!("slot {sid} out of range")));
                };
                if slot.has_action() {
                    return Err(Conflict::SlotBusy { slot: sid }.into());
                }
                slot.group_id = gid;
            }
            Ok(())
        })
        .await?;
        self.push_slot_views(Some(&sids)).await?;
        info!(slots = sids.len(), "slots assigned");
        Ok(())
    }

    /// Mark slots unassigned. Refused while any of them has an action.
    pub async fn assign_slots_offline(&self, sids: &[usize]) -> Result<(), CoordError> {
        if sids.is_empty() {
            return Err(CoordError::validation("no slots given"));
        }
        let owned = sids.to_vec();
        self.mutate(move |topology| {
            for &sid in &owned {
                let Some(slot) = topology.slot_mut(sid) else {
                    return Err(CoordError::validation(format!("slot {sid} out of range")));
                };
                if slot.has_action() {
                    return Err(Conflict::SlotBusy { slot: sid }.into());
                }
                slot.group_id = 0;
            }
            Ok(())
        })
        .await?;
        self.push_slot_views(Some(sids)).await?;
        info!(slots = sids.len(), "slots taken offline");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Engine
    // -----------------------------------------------------------------------

    /// One engine pass. Returns how many slots finished cutover.
    pub async fn tick_slot_actions(&self) -> usize {
        if self.action_disabled() {
            return 0;
        }
        let snapshot = match self.refresh().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "migration tick skipped, store unreadable");
                return 0;
            }
        };
        let selected = select_actions(&snapshot.topology, self.config().migration_parallel);
        if selected.is_empty() {
            return 0;
        }

        let runs = selected
            .iter()
            .map(|action| self.run_slot_action(action.sid));
        let mut finished = 0;
        for (action, outcome) in selected.iter().zip(future::join_all(runs).await) {
            match outcome {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(err) => {
                    metrics::counter!("coordinator_migration_failures_total").increment(1);
                    self.set_progress(format!("slot {:04}: {err}", action.sid));
                    warn!(slot = action.sid, %err, "slot migration attempt failed");
                }
            }
        }
        finished
    }

    /// Drive one slot's migration as far as it will go this tick. Returns
    /// `Ok(true)` once the slot has cut over.
    async fn run_slot_action(&self, sid: usize) -> Result<bool, CoordError> {
        let _guard = self.executor_guard();

        // Mark migrating and capture both ends in the same write, so the
        // batch loop works against the exact state everyone else sees.
        let context = match self.mark_migrating(sid).await {
            Ok(context) => context,
            Err(err) if vanished(&err) => return Ok(false),
            Err(err) => return Err(err),
        };

        // Routing must be paused on every proxy before any key moves.
        self.push_slot_views(Some(&[sid])).await?;
        metrics::counter!("coordinator_migrations_started_total").increment(1);

        loop {
            if self.action_disabled() {
                self.set_progress(format!("slot {sid:04}: paused, engine disabled"));
                return Ok(false);
            }
            let remaining = self
                .server_commands()
                .migrate_slot_batch(&context.src_master, sid, &context.dst_master)
                .await
                .map_err(|err| CoordError::unreachable(&context.src_master, err))?;
            metrics::counter!("coordinator_migration_batches_total").increment(1);
            self.set_progress(format!(
                "slot {sid:04}: {remaining} keys left -> group {}",
                context.target
            ));
            if remaining == 0 {
                break;
            }
            let pause = self.action_interval_secs();
            if pause > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(pause)).await;
            }
        }

        // Ownership flip and action clear happen in one write; there is no
        // state in which the slot is owned by the target but still locked.
        let target = context.target;
        match self
            .mutate(move |topology| {
                let Some(slot) = topology.slot_mut(sid) else {
                    return Err(CoordError::validation(ACTION_VANISHED));
                };
                if slot.action.is_none() {
                    return Err(CoordError::validation(ACTION_VANISHED));
                }
                slot.group_id = target;
                slot.action = None;
                Ok(())
            })
            .await
        {
            Ok(()) => {}
            Err(err) if vanished(&err) => return Ok(false),
            Err(err) => return Err(err),
        }
        metrics::counter!("coordinator_migrations_completed_total").increment(1);
        self.set_progress(format!("slot {sid:04}: done, now group {target}"));

        // Unlock routing. Failures here do not undo the cutover; the proxy
        // catches up on the next resync.
        if let Err(err) = self.push_slot_views(Some(&[sid])).await {
            warn!(slot = sid, %err, "routing unlock push failed after cutover");
        }
        info!(slot = sid, target, "slot migration finished");
        Ok(true)
    }

    async fn mark_migrating(&self, sid: usize) -> Result<MigrationContext, CoordError> {
        self.mutate(move |topology| {
            let Some(slot) = topology.slot(sid) else {
                return Err(CoordError::validation(ACTION_VANISHED));
            };
            let Some(action) = slot.action else {
                return Err(CoordError::validation(ACTION_VANISHED));
            };
            let src = slot.group_id;
            let src_master = topology
                .group(src)
                .and_then(|group| group.master_addr())
                .ok_or_else(|| {
                    CoordError::fatal(format!("slot {sid}: source group {src} has no master"))
                })?
                .to_string();
            let dst_master = topology
                .group(action.target_id)
                .and_then(|group| group.master_addr())
                .ok_or_else(|| {
                    CoordError::fatal(format!(
                        "slot {sid}: target group {} has no master",
                        action.target_id
                    ))
                })?
                .to_string();
            let target = action.target_id;
            if let Some(slot) = topology.slot_mut(sid) {
                if let Some(action) = &mut slot.action {
                    action.state = ActionState::Migrating;
                }
            }
            Ok(MigrationContext {
                src_master,
                dst_master,
                target,
            })
        })
        .await
    }
}

/// Pick up to `parallel` runnable actions in ascending queue order, skipping
/// any whose source or target group is already claimed this tick. Running
/// (crash-recovered) actions sort ahead of pending ones at equal index.
pub(crate) fn select_actions(topology: &Topology, parallel: usize) -> Vec<SelectedAction> {
    let mut candidates: Vec<(u64, usize, u32, u32)> = topology
        .slots
        .iter()
        .filter_map(|slot| {
            slot.action
                .map(|action| (action.index, slot.id, slot.group_id, action.target_id))
        })
        .collect();
    candidates.sort_unstable();

    let mut claimed: BTreeSet<u32> = BTreeSet::new();
    let mut selected = Vec::new();
    for (_, sid, src, dst) in candidates {
        if selected.len() >= parallel {
            break;
        }
        if claimed.contains(&src) || claimed.contains(&dst) {
            continue;
        }
        claimed.insert(src);
        claimed.insert(dst);
        selected.push(SelectedAction { sid, src, dst });
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testkit;
    use shardhelm_core::Proxy;

    fn spec_cluster() -> shardhelm_core::Topology {
        // Two groups, one replicated: group 1 owns slots 512-600.
        testkit::topology_with_slots(&[(1, &["a:1", "a:2"]), (2, &["c:1"])], &[(512, 600, 1)])
    }

    async fn drain_engine(coordinator: &Coordinator) -> usize {
        let mut finished = 0;
        for _ in 0..200 {
            let n = coordinator.tick_slot_actions().await;
            finished += n;
            let snap = coordinator.cached();
            if !snap.topology.slots.iter().any(|slot| slot.has_action()) {
                break;
            }
        }
        finished
    }

    #[tokio::test]
    async fn range_migration_moves_ownership_and_clears_actions() {
        let (coordinator, backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator
            .create_slot_actions_range(512, 600, 2)
            .await
            .unwrap();

        let finished = drain_engine(&coordinator).await;
        assert_eq!(finished, 89);

        let snap = coordinator.cached();
        for sid in 512..=600 {
            let slot = snap.topology.slot(sid).unwrap();
            assert_eq!(slot.group_id, 2, "slot {sid} should now belong to group 2");
            assert!(!slot.has_action());
        }
        assert!(snap.topology.slots_of_group(1).is_empty());
        assert!(!snap.topology.group_in_use(1));

        // Batches always ran source master -> target master.
        let batches = backend.calls_matching("migrate a:1");
        assert_eq!(batches.len(), 89);
        assert!(batches[0].contains("target=c:1"));
    }

    #[tokio::test]
    async fn one_tick_runs_at_most_one_action_per_group_pair() {
        let (coordinator, backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator
            .create_slot_actions_range(512, 540, 2)
            .await
            .unwrap();

        let finished = coordinator.tick_slot_actions().await;
        assert_eq!(finished, 1);
        assert_eq!(backend.calls_matching("migrate ").len(), 1);

        let snap = coordinator.cached();
        assert_eq!(snap.topology.slot(512).unwrap().group_id, 2);
        assert!(snap.topology.slot(513).unwrap().has_action());
    }

    #[test]
    fn selection_skips_claimed_groups_but_keeps_scanning() {
        let mut topology = testkit::topology_with_slots(
            &[(1, &["a:1"]), (2, &["b:1"]), (3, &["c:1"]), (4, &["d:1"])],
            &[(0, 9, 1), (10, 19, 3)],
        );
        for (sid, index, target) in [(0, 1, 2), (1, 2, 2), (10, 3, 4), (11, 4, 4)] {
            topology.slot_mut(sid).unwrap().action = Some(SlotAction::pending(index, target));
        }

        let selected = select_actions(&topology, 10);
        assert_eq!(
            selected,
            vec![
                SelectedAction {
                    sid: 0,
                    src: 1,
                    dst: 2
                },
                SelectedAction {
                    sid: 10,
                    src: 3,
                    dst: 4
                },
            ]
        );
    }

    #[test]
    fn selection_respects_parallel_cap() {
        let mut topology = testkit::topology_with_slots(
            &[(1, &["a:1"]), (2, &["b:1"]), (3, &["c:1"]), (4, &["d:1"])],
            &[(0, 9, 1), (10, 19, 3)],
        );
        topology.slot_mut(0).unwrap().action = Some(SlotAction::pending(1, 2));
        topology.slot_mut(10).unwrap().action = Some(SlotAction::pending(2, 4));

        assert_eq!(select_actions(&topology, 1).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_for_same_slot_yield_exactly_one_conflict() {
        let (coordinator, _backend) = testkit::coordinator_with(spec_cluster()).await;
        let (a, b) = tokio::join!(
            coordinator.create_slot_action(512, 2),
            coordinator.create_slot_action(512, 2),
        );

        let failures: Vec<CoordError> = [a, b].into_iter().filter_map(Result::err).collect();
        assert_eq!(failures.len(), 1, "exactly one create must lose");
        assert_eq!(
            failures[0].conflict(),
            Some(&Conflict::SlotBusy { slot: 512 })
        );

        let snap = coordinator.cached();
        let action = snap.topology.slot(512).unwrap().action.unwrap();
        assert_eq!(action.target_id, 2);
    }

    #[tokio::test]
    async fn cancel_is_pending_only() {
        let (coordinator, _backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator.create_slot_action(512, 2).await.unwrap();
        coordinator.remove_slot_action(512).await.unwrap();
        assert!(!coordinator.cached().topology.slot(512).unwrap().has_action());

        coordinator.create_slot_action(512, 2).await.unwrap();
        coordinator
            .mutate(|topology| {
                if let Some(action) = &mut topology.slot_mut(512).unwrap().action {
                    action.state = ActionState::Migrating;
                }
                Ok(())
            })
            .await
            .unwrap();

        let err = coordinator.remove_slot_action(512).await.unwrap_err();
        assert_eq!(
            err.conflict(),
            Some(&Conflict::MigrationInProgress { slot: 512 })
        );
    }

    #[tokio::test]
    async fn remove_all_cancels_pending_and_spares_running() {
        let (coordinator, _backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator
            .create_slot_actions_range(512, 514, 2)
            .await
            .unwrap();
        coordinator
            .mutate(|topology| {
                if let Some(action) = &mut topology.slot_mut(512).unwrap().action {
                    action.state = ActionState::Migrating;
                }
                Ok(())
            })
            .await
            .unwrap();

        let removed = coordinator.remove_all_slot_actions().await.unwrap();
        assert_eq!(removed, 2);
        let snap = coordinator.cached();
        assert!(snap.topology.slot(512).unwrap().has_action());
        assert!(!snap.topology.slot(513).unwrap().has_action());
    }

    #[tokio::test]
    async fn disabled_engine_never_issues_batches() {
        let (coordinator, backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator.create_slot_action(512, 2).await.unwrap();
        coordinator.set_action_disabled(true);

        assert_eq!(coordinator.tick_slot_actions().await, 0);
        assert!(backend.calls_matching("migrate ").is_empty());
        assert!(coordinator
            .cached()
            .topology
            .slot(512)
            .unwrap()
            .has_action());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_paces_batches_of_one_slot() {
        let (coordinator, backend) = testkit::coordinator_with(spec_cluster()).await;
        backend.set_remaining(512, 250); // three batches at 100 keys each
        coordinator.create_slot_action(512, 2).await.unwrap();
        coordinator.set_action_interval_secs(30);

        let started = tokio::time::Instant::now();
        assert_eq!(coordinator.tick_slot_actions().await, 1);

        assert_eq!(backend.calls_matching("migrate ").len(), 3);
        assert!(started.elapsed() >= std::time::Duration::from_secs(60));
        assert_eq!(coordinator.cached().topology.slot(512).unwrap().group_id, 2);
    }

    #[tokio::test]
    async fn unreachable_proxy_blocks_batches_but_keeps_action() {
        let (coordinator, backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator
            .mutate(|topology| {
                topology.proxy_seq += 1;
                topology.proxies.insert(
                    "t1".to_string(),
                    Proxy {
                        id: 1,
                        token: "t1".to_string(),
                        admin_addr: "p:1".to_string(),
                        proxy_addr: "p:2".to_string(),
                        datacenter: None,
                        start_time: String::new(),
                    },
                );
                Ok(())
            })
            .await
            .unwrap();
        backend.fail("p:1", "connection refused");
        coordinator.create_slot_action(512, 2).await.unwrap();

        assert_eq!(coordinator.tick_slot_actions().await, 0);
        assert!(backend.calls_matching("migrate ").is_empty());

        let snap = coordinator.cached();
        let action = snap.topology.slot(512).unwrap().action.unwrap();
        assert_eq!(action.state, ActionState::Migrating);

        // Proxy comes back: the next tick resumes and finishes the slot.
        backend.clear_fail("p:1");
        assert_eq!(coordinator.tick_slot_actions().await, 1);
        assert_eq!(coordinator.cached().topology.slot(512).unwrap().group_id, 2);
    }

    #[tokio::test]
    async fn direct_assignment_requires_free_slot_and_live_group() {
        let (coordinator, _backend) = testkit::coordinator_with(spec_cluster()).await;

        coordinator.assign_slots(&[(0, 2), (1, 2)]).await.unwrap();
        let snap = coordinator.cached();
        assert_eq!(snap.topology.slot(0).unwrap().group_id, 2);

        coordinator.create_slot_action(512, 2).await.unwrap();
        let err = coordinator.assign_slots(&[(512, 2)]).await.unwrap_err();
        assert_eq!(err.conflict(), Some(&Conflict::SlotBusy { slot: 512 }));

        let err = coordinator.assign_slots(&[(3, 99)]).await.unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));
    }

    #[tokio::test]
    async fn offline_assignment_clears_ownership() {
        let (coordinator, _backend) = testkit::coordinator_with(spec_cluster()).await;
        coordinator.assign_slots_offline(&[512, 513]).await.unwrap();
        let snap = coordinator.cached();
        assert!(!snap.topology.slot(512).unwrap().is_assigned());
        assert!(!snap.topology.slot(513).unwrap().is_assigned());
    }
}
