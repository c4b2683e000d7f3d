//! Two-phase cluster rebalancing.
//!
//! Planning is pure: it reads a topology and produces a move list without
//! touching any state, so a preview is always side-effect free. Confirming
//! applies the same list in one topology write: unassigned slots become
//! direct assignments (there is no data to move), owned slots become queued
//! migrations for the engine to drain.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use shardhelm_core::Topology;
use tracing::info;

use super::core::Coordinator;
use crate::error::CoordError;

/// One planned ownership change. `from == 0` means the slot is currently
/// unassigned and will be assigned directly instead of migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotMove {
    pub slot: usize,
    pub from: u32,
    pub to: u32,
}

/// Compute a deterministic plan that spreads slots across usable groups to
/// within one slot of each other.
///
/// Usable groups have at least one server and no promotion in flight. Slots
/// owned by unusable groups are left alone. Ties always resolve toward the
/// lowest group id and lowest slot id, so identical topologies produce
/// identical plans.
pub(crate) fn plan_rebalance(topology: &Topology) -> Result<Vec<SlotMove>, CoordError> {
    if topology.slots.iter().any(|slot| slot.has_action()) {
        return Err(CoordError::validation(
            "slots have queued migrations; drain or cancel them before rebalancing",
        ));
    }
    let usable: Vec<u32> = topology
        .groups
        .values()
        .filter(|group| !group.servers.is_empty() && !group.is_promoting())
        .map(|group| group.id)
        .collect();
    if usable.is_empty() {
        return Err(CoordError::validation("no group can accept slots"));
    }

    let mut counts: BTreeMap<u32, usize> = usable.iter().map(|gid| (*gid, 0)).collect();
    let mut movable: BTreeMap<u32, VecDeque<usize>> =
        usable.iter().map(|gid| (*gid, VecDeque::new())).collect();
    let mut unassigned = Vec::new();
    for slot in &topology.slots {
        if !slot.is_assigned() {
            unassigned.push(slot.id);
        } else if let Some(count) = counts.get_mut(&slot.group_id) {
            *count += 1;
            if let Some(queue) = movable.get_mut(&slot.group_id) {
                queue.push_back(slot.id);
            }
        }
        // Slots of unusable groups stay where they are.
    }

    let mut moves = Vec::new();

    // Phase 1: place unassigned slots on the least-loaded group.
    for sid in unassigned {
        let (gid, _) = counts
            .iter()
            .min_by_key(|(gid, count)| (**count, **gid))
            .map(|(gid, count)| (*gid, *count))
            .unwrap_or((usable[0], 0));
        moves.push(SlotMove {
            slot: sid,
            from: 0,
            to: gid,
        });
        if let Some(count) = counts.get_mut(&gid) {
            *count += 1;
        }
    }

    // Phase 2: move owned slots from the fullest to the emptiest group until
    // the spread is at most one.
    loop {
        let (max_gid, max_n) = counts
            .iter()
            .max_by_key(|(gid, count)| (**count, std::cmp::Reverse(**gid)))
            .map(|(gid, count)| (*gid, *count))
            .unwrap_or((usable[0], 0));
        let (min_gid, min_n) = counts
            .iter()
            .min_by_key(|(gid, count)| (**count, **gid))
            .map(|(gid, count)| (*gid, *count))
            .unwrap_or((usable[0], 0));
        if max_n - min_n <= 1 {
            break;
        }
        let Some(sid) = movable.get_mut(&max_gid).and_then(VecDeque::pop_front) else {
            break;
        };
        moves.push(SlotMove {
            slot: sid,
            from: max_gid,
            to: min_gid,
        });
        if let Some(count) = counts.get_mut(&max_gid) {
            *count -= 1;
        }
        if let Some(count) = counts.get_mut(&min_gid) {
            *count += 1;
        }
    }

    moves.sort_unstable_by_key(|planned| planned.slot);
    Ok(moves)
}

impl Coordinator {
    /// Plan a rebalance; apply it when `confirm` is set.
    ///
    /// Without `confirm` this never writes: the returned moves are a
    /// preview. With `confirm` the whole plan lands in one topology write,
    /// so a racing topology change rejects the entire plan rather than half
    /// of it.
    pub async fn rebalance(&self, confirm: bool) -> Result<Vec<SlotMove>, CoordError> {
        let snapshot = self.refresh().await?;
        let moves = plan_rebalance(&snapshot.topology)?;
        if !confirm || moves.is_empty() {
            return Ok(moves);
        }

        let planned = moves.clone();
        self.mutate(move |topology| {
            let mut index = topology.max_action_index();
            for change in &planned {
                if change.from == 0 {
                    let Some(slot) = topology.slot_mut(change.slot) else {
                        return Err(CoordError::validation(format!(
                            "slot {} out of range",
                            change.slot
                        )));
                    };
                    if slot.has_action() || slot.is_assigned() {
                        return Err(CoordError::validation(
                            "topology changed while rebalancing; plan again",
                        ));
                    }
                    slot.group_id = change.to;
                } else {
                    index += 1;
                    super::slots::enqueue_action(topology, change.slot, change.to, index)?;
                }
            }
            Ok(())
        })
        .await?;

        let assigned: Vec<usize> = moves
            .iter()
            .filter(|change| change.from == 0)
            .map(|change| change.slot)
            .collect();
        if !assigned.is_empty() {
            self.push_slot_views(Some(&assigned)).await?;
        }
        info!(moves = moves.len(), "rebalance confirmed");
        Ok(moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testkit;
    use proptest::prelude::*;
    use shardhelm_core::{Promoting, SlotAction, SLOT_COUNT};

    fn counts_of(topology: &Topology) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for slot in &topology.slots {
            if slot.is_assigned() {
                *counts.entry(slot.group_id).or_insert(0) += 1;
            }
        }
        counts
    }

    fn apply(topology: &mut Topology, moves: &[SlotMove]) {
        for change in moves {
            topology.slot_mut(change.slot).unwrap().group_id = change.to;
        }
    }

    #[test]
    fn fresh_cluster_splits_evenly() {
        let topology = testkit::topology(&[(1, &["a:1"]), (2, &["b:1"])]);
        let moves = plan_rebalance(&topology).unwrap();
        assert_eq!(moves.len(), SLOT_COUNT);
        assert!(moves.iter().all(|change| change.from == 0));

        let mut next = topology.clone();
        apply(&mut next, &moves);
        let counts = counts_of(&next);
        assert_eq!(counts[&1], 512);
        assert_eq!(counts[&2], 512);
    }

    #[test]
    fn loaded_cluster_rebalances_within_one() {
        let topology = testkit::topology_with_slots(
            &[(1, &["a:1"]), (2, &["b:1"]), (3, &["c:1"])],
            &[(0, 1023, 1)],
        );
        let moves = plan_rebalance(&topology).unwrap();
        let mut next = topology.clone();
        apply(&mut next, &moves);
        let counts = counts_of(&next);
        assert_eq!(counts[&1], 342);
        assert_eq!(counts[&2], 341);
        assert_eq!(counts[&3], 341);
    }

    #[test]
    fn plans_are_deterministic() {
        let topology = testkit::topology_with_slots(
            &[(1, &["a:1"]), (2, &["b:1"]), (3, &["c:1"])],
            &[(0, 700, 1), (701, 900, 2)],
        );
        assert_eq!(
            plan_rebalance(&topology).unwrap(),
            plan_rebalance(&topology).unwrap()
        );
    }

    #[test]
    fn promoting_groups_are_left_out() {
        let mut topology =
            testkit::topology(&[(1, &["a:1", "a:2"]), (2, &["b:1"])]);
        topology.group_mut(1).unwrap().promoting = Some(Promoting {
            index: 1,
            phase: shardhelm_core::PromotePhase::Preparing,
        });
        let moves = plan_rebalance(&topology).unwrap();
        assert!(moves.iter().all(|change| change.to == 2));
    }

    #[test]
    fn queued_migrations_block_planning() {
        let mut topology =
            testkit::topology_with_slots(&[(1, &["a:1"]), (2, &["b:1"])], &[(0, 100, 1)]);
        topology.slot_mut(5).unwrap().action = Some(SlotAction::pending(1, 2));
        assert!(matches!(
            plan_rebalance(&topology),
            Err(CoordError::Validation(_))
        ));
    }

    #[test]
    fn empty_groups_cannot_take_slots() {
        let mut topology = testkit::topology(&[(1, &["a:1"])]);
        topology
            .groups
            .insert(2, shardhelm_core::Group::new(2));
        let moves = plan_rebalance(&topology).unwrap();
        assert!(moves.iter().all(|change| change.to == 1));
    }

    #[tokio::test]
    async fn preview_never_writes() {
        let topology = testkit::topology_with_slots(
            &[(1, &["a:1"]), (2, &["b:1"])],
            &[(0, 1023, 1)],
        );
        let (coordinator, _backend) = testkit::coordinator_with(topology).await;
        let before = coordinator.cached().version;

        let first = coordinator.rebalance(false).await.unwrap();
        let second = coordinator.rebalance(false).await.unwrap();

        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert_eq!(coordinator.cached().version, before);
        assert!(!coordinator
            .cached()
            .topology
            .slots
            .iter()
            .any(|slot| slot.has_action()));
    }

    #[tokio::test]
    async fn confirm_assigns_and_queues_in_one_version() {
        let topology = testkit::topology_with_slots(
            &[(1, &["a:1"]), (2, &["b:1"])],
            &[(0, 99, 1)],
        );
        let (coordinator, _backend) = testkit::coordinator_with(topology).await;
        let before = coordinator.cached().version;

        let moves = coordinator.rebalance(true).await.unwrap();
        assert!(!moves.is_empty());
        assert_eq!(coordinator.cached().version, before + 1);

        let snap = coordinator.cached();
        // Unassigned slots were assigned directly, never queued.
        assert!(snap
            .topology
            .slots
            .iter()
            .filter(|slot| slot.has_action())
            .all(|slot| slot.id <= 99));
    }

    proptest! {
        #[test]
        fn rebalance_spread_is_at_most_one(owners in proptest::collection::vec(0u32..=4, SLOT_COUNT)) {
            let mut topology = testkit::topology(&[
                (1, &["a:1"]),
                (2, &["b:1"]),
                (3, &["c:1"]),
                (4, &["d:1"]),
            ]);
            for (sid, owner) in owners.iter().enumerate() {
                topology.slot_mut(sid).unwrap().group_id = *owner;
            }

            let moves = plan_rebalance(&topology).unwrap();
            let mut next = topology.clone();
            apply(&mut next, &moves);

            prop_assert!(next.slots.iter().all(|slot| slot.is_assigned()));
            let counts = counts_of(&next);
            let max = counts.values().copied().max().unwrap_or(0);
            let min = counts.values().copied().min().unwrap_or(0);
            prop_assert!(max - min <= 1, "spread {max}-{min} exceeds 1");
        }
    }
}
