//! Slot table model for the 1024-slot keyspace.
//!
//! Every key in the cluster hashes into one of [`SLOT_COUNT`] slots, and each
//! slot is owned by at most one replica group. Live re-sharding is expressed
//! as a per-slot [`SlotAction`] that walks `Pending -> Migrating`; cutover
//! rewrites the owner and removes the action in a single store write, so a
//! persisted snapshot never shows a half-applied move. This module provides:
//!
//! - [`SlotMapping`] / [`SlotAction`]: the authoritative routing entry
//! - [`SlotView`]: the resolved per-slot state pushed to proxies
//! - [`parse_slot_list`]: parser for `"0-9,20"`-style slot lists

use serde::{Deserialize, Serialize};

use anyhow::{bail, Result};

/// Number of hash slots in the cluster keyspace.
pub const SLOT_COUNT: usize = 1024;

// ---------------------------------------------------------------------------
// SlotAction
// ---------------------------------------------------------------------------

/// Lifecycle of a slot migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    /// Queued; not yet picked up by the migration engine. Cancelable.
    Pending,
    /// Key batches are moving. Not cancelable.
    Migrating,
    /// Terminal in-memory state only; cutover clears the action in the same
    /// write that reassigns the owner, so `Finished` is never persisted.
    Finished,
}

/// A queued or running migration attached to one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotAction {
    pub state: ActionState,
    /// Queue position. The engine drains actions in ascending index order, so
    /// creation order is execution order.
    pub index: u64,
    /// Group that will own the slot after cutover.
    pub target_id: u32,
}

impl SlotAction {
    /// A freshly enqueued action.
    #[must_use]
    pub fn pending(index: u64, target_id: u32) -> Self {
        Self {
            state: ActionState::Pending,
            index,
            target_id,
        }
    }
}

// ---------------------------------------------------------------------------
// SlotMapping
// ---------------------------------------------------------------------------

/// Authoritative routing entry for a single slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotMapping {
    pub id: usize,
    /// Owning group id; `0` means unassigned.
    pub group_id: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<SlotAction>,
}

impl SlotMapping {
    /// An unowned slot with no action.
    #[must_use]
    pub fn unassigned(id: usize) -> Self {
        Self {
            id,
            group_id: 0,
            action: None,
        }
    }

    /// Whether the slot currently has an owning group.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.group_id != 0
    }

    /// Whether a migration is queued or running for this slot.
    #[must_use]
    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }
}

// ---------------------------------------------------------------------------
// SlotView
// ---------------------------------------------------------------------------

/// Resolved per-slot routing state pushed to proxies.
///
/// While a migration runs (or the owning group is mid-promotion) the slot is
/// `locked`: proxies hold requests for it until the next view unlocks it
/// (pause-and-drain). `migrate_from` carries the outgoing master so a proxy
/// restarted mid-migration still knows both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotView {
    pub id: usize,
    pub locked: bool,
    /// Master address of the group requests should land on; empty when the
    /// slot is unassigned.
    pub backend_addr: String,
    /// Master address keys are moving away from, while a migration runs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub migrate_from: Option<String>,
}

// ---------------------------------------------------------------------------
// Slot list parsing
// ---------------------------------------------------------------------------

/// Parse a slot list such as `"0-9,20"` into sorted, deduplicated slot ids.
///
/// Accepted segments are single ids (`"20"`) and inclusive ranges (`"0-9"`).
///
/// # Errors
///
/// Fails on empty input, malformed segments, inverted ranges, and ids outside
/// `0..SLOT_COUNT`.
pub fn parse_slot_list(text: &str) -> Result<Vec<usize>> {
    let mut slots = Vec::new();
    if text.trim().is_empty() {
        bail!("slot list is empty");
    }
    for seg in text.split(',') {
        let seg = seg.trim();
        if let Some((beg, end)) = seg.split_once('-') {
            let beg = parse_slot_id(beg)?;
            let end = parse_slot_id(end)?;
            if beg > end {
                bail!("inverted slot range {beg}-{end}");
            }
            slots.extend(beg..=end);
        } else {
            slots.push(parse_slot_id(seg)?);
        }
    }
    slots.sort_unstable();
    slots.dedup();
    Ok(slots)
}

fn parse_slot_id(text: &str) -> Result<usize> {
    let Ok(sid) = text.trim().parse::<usize>() else {
        bail!("invalid slot id {text:?}");
    };
    if sid >= SLOT_COUNT {
        bail!("slot id {sid} out of range [0, {SLOT_COUNT})");
    }
    Ok(sid)
}

/// Render slot ids back into the compact `"0-9,20"` form.
///
/// Consecutive runs collapse into ranges. Input order does not matter.
#[must_use]
pub fn format_slot_list(slots: &[usize]) -> String {
    let mut sorted: Vec<usize> = slots.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = String::new();
    let mut i = 0;
    while i < sorted.len() {
        let beg = sorted[i];
        let mut end = beg;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if beg == end {
            out.push_str(&beg.to_string());
        } else {
            out.push_str(&format!("{beg}-{end}"));
        }
        i += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn unassigned_slot_has_no_owner_or_action() {
        let slot = SlotMapping::unassigned(7);
        assert_eq!(slot.id, 7);
        assert!(!slot.is_assigned());
        assert!(!slot.has_action());
    }

    #[test]
    fn pending_action_carries_index_and_target() {
        let action = SlotAction::pending(42, 3);
        assert_eq!(action.state, ActionState::Pending);
        assert_eq!(action.index, 42);
        assert_eq!(action.target_id, 3);
    }

    #[test]
    fn parse_single_ids_and_ranges() {
        assert_eq!(parse_slot_list("20").unwrap(), vec![20]);
        assert_eq!(parse_slot_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            parse_slot_list("0-3,20,5").unwrap(),
            vec![0, 1, 2, 3, 5, 20]
        );
    }

    #[test]
    fn parse_dedupes_overlapping_segments() {
        assert_eq!(parse_slot_list("1-4,3-5").unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_slot_list("9,9,9").unwrap(), vec![9]);
    }

    #[test]
    fn parse_tolerates_whitespace() {
        assert_eq!(parse_slot_list(" 1 , 2 - 4 ").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parse_rejects_empty_input() {
        assert!(parse_slot_list("").is_err());
        assert!(parse_slot_list("   ").is_err());
    }

    #[test]
    fn parse_rejects_garbage_segment() {
        assert!(parse_slot_list("1,x").is_err());
        assert!(parse_slot_list("1,,2").is_err());
        assert!(parse_slot_list("1-2-3").is_err());
    }

    #[test]
    fn parse_rejects_inverted_range() {
        assert!(parse_slot_list("9-3").is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_id() {
        assert!(parse_slot_list("1024").is_err());
        assert!(parse_slot_list("0-1024").is_err());
    }

    #[test]
    fn format_collapses_runs() {
        assert_eq!(format_slot_list(&[0, 1, 2, 3, 5, 20]), "0-3,5,20");
        assert_eq!(format_slot_list(&[7]), "7");
        assert_eq!(format_slot_list(&[]), "");
    }

    #[test]
    fn format_sorts_and_dedupes_first() {
        assert_eq!(format_slot_list(&[5, 3, 4, 3]), "3-5");
    }

    #[test]
    fn parse_format_round_trip_is_canonical() {
        let text = "0-9,20,30-31";
        let slots = parse_slot_list(text).unwrap();
        assert_eq!(format_slot_list(&slots), text);
    }

    #[test]
    fn action_survives_serde() {
        let slot = SlotMapping {
            id: 512,
            group_id: 1,
            action: Some(SlotAction::pending(9, 2)),
        };
        let json = serde_json::to_string(&slot).unwrap();
        let back: SlotMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(back, slot);
    }

    #[test]
    fn absent_action_is_omitted_from_json() {
        let slot = SlotMapping::unassigned(0);
        let json = serde_json::to_string(&slot).unwrap();
        assert!(!json.contains("action"), "unexpected field in {json}");
    }

    proptest! {
        #[test]
        fn format_is_order_insensitive_and_parse_restores_the_set(
            ids in proptest::collection::vec(0usize..SLOT_COUNT, 1..64),
        ) {
            let mut canonical = ids.clone();
            canonical.sort_unstable();
            canonical.dedup();

            let text = format_slot_list(&ids);
            prop_assert_eq!(format_slot_list(&canonical), text.clone());
            prop_assert_eq!(parse_slot_list(&text).unwrap(), canonical);
        }
    }
}
