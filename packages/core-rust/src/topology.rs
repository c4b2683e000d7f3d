//! The persisted cluster topology: one value holding the slot table, replica
//! groups, proxy registry and watchdog roster.
//!
//! The coordinator's store keeps exactly one `Topology` under a version
//! counter and mutates it by compare-and-swap, so every helper here is pure:
//! readers work on an immutable snapshot, writers build the next value and
//! race it through the store.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::group::{valid_group_id, Group};
use crate::proxy::Proxy;
use crate::sentinel::Sentinel;
use crate::slots::{ActionState, SlotMapping, SlotView, SLOT_COUNT};

/// Complete cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Always exactly [`SLOT_COUNT`] entries, `slots[i].id == i`.
    pub slots: Vec<SlotMapping>,
    pub groups: BTreeMap<u32, Group>,
    /// Keyed by proxy token.
    pub proxies: BTreeMap<String, Proxy>,
    /// Monotonic source of proxy ids; never decreases, even across removals.
    pub proxy_seq: u64,
    pub sentinel: Sentinel,
}

impl Topology {
    /// An empty cluster: all slots unassigned, no groups, proxies or
    /// watchdogs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT).map(SlotMapping::unassigned).collect(),
            groups: BTreeMap::new(),
            proxies: BTreeMap::new(),
            proxy_seq: 0,
            sentinel: Sentinel::default(),
        }
    }

    // ---- lookups ----

    #[must_use]
    pub fn slot(&self, sid: usize) -> Option<&SlotMapping> {
        self.slots.get(sid)
    }

    pub fn slot_mut(&mut self, sid: usize) -> Option<&mut SlotMapping> {
        self.slots.get_mut(sid)
    }

    #[must_use]
    pub fn group(&self, gid: u32) -> Option<&Group> {
        self.groups.get(&gid)
    }

    pub fn group_mut(&mut self, gid: u32) -> Option<&mut Group> {
        self.groups.get_mut(&gid)
    }

    /// The group containing `addr`, if any.
    #[must_use]
    pub fn group_of_server(&self, addr: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.contains(addr))
    }

    /// Slot ids currently owned by `gid`.
    #[must_use]
    pub fn slots_of_group(&self, gid: u32) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.group_id == gid)
            .map(|s| s.id)
            .collect()
    }

    /// Whether any slot is owned by `gid` or migrating toward it.
    #[must_use]
    pub fn group_in_use(&self, gid: u32) -> bool {
        self.slots.iter().any(|s| {
            s.group_id == gid || s.action.is_some_and(|a| a.target_id == gid)
        })
    }

    /// Logical master address per non-empty group.
    #[must_use]
    pub fn logical_masters(&self) -> BTreeMap<u32, String> {
        self.groups
            .values()
            .filter_map(|g| Some((g.id, g.master_addr()?.to_string())))
            .collect()
    }

    /// Largest slot-action queue index in use.
    #[must_use]
    pub fn max_action_index(&self) -> u64 {
        self.slots
            .iter()
            .filter_map(|s| s.action.map(|a| a.index))
            .max()
            .unwrap_or(0)
    }

    /// Largest sync-action queue index in use across all group servers.
    #[must_use]
    pub fn max_sync_index(&self) -> u64 {
        self.groups
            .values()
            .flat_map(|g| g.servers.iter())
            .map(|s| s.sync.index)
            .max()
            .unwrap_or(0)
    }

    // ---- proxy-facing views ----

    /// Resolved routing state for a single slot.
    ///
    /// A slot is locked (proxies pause-and-drain its requests) while its
    /// migration is in the `Migrating` state or while the owning group is
    /// mid-promotion. During migration the backend flips to the target
    /// group's master with `migrate_from` carrying the outgoing one.
    #[must_use]
    pub fn slot_view(&self, slot: &SlotMapping) -> SlotView {
        let master = |gid: u32| -> String {
            self.groups
                .get(&gid)
                .and_then(Group::master_addr)
                .map(str::to_string)
                .unwrap_or_default()
        };
        if slot.group_id != 0 && !self.groups.contains_key(&slot.group_id) {
            warn!(slot = slot.id, group = slot.group_id, "slot owner missing from topology");
        }
        match slot.action {
            Some(action) if action.state == ActionState::Migrating => SlotView {
                id: slot.id,
                locked: true,
                backend_addr: master(action.target_id),
                migrate_from: Some(master(slot.group_id)).filter(|a| !a.is_empty()),
            },
            _ => SlotView {
                id: slot.id,
                locked: self
                    .groups
                    .get(&slot.group_id)
                    .is_some_and(Group::is_promoting),
                backend_addr: master(slot.group_id),
                migrate_from: None,
            },
        }
    }

    /// Resolved routing state for every slot, in slot order.
    #[must_use]
    pub fn slot_views(&self) -> Vec<SlotView> {
        self.slots.iter().map(|s| self.slot_view(s)).collect()
    }

    // ---- invariants ----

    /// Check the referential invariants that must hold for every persisted
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: slot table shape, slot/action
    /// references to unknown groups, a slot migrating to its current owner,
    /// a server listed twice, a promoting index out of bounds, or a proxy
    /// registered under a foreign token.
    pub fn validate(&self) -> Result<()> {
        if self.slots.len() != SLOT_COUNT {
            bail!("slot table has {} entries, want {SLOT_COUNT}", self.slots.len());
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.id != i {
                bail!("slot at position {i} carries id {}", slot.id);
            }
            if slot.group_id != 0 && !self.groups.contains_key(&slot.group_id) {
                bail!("slot {} owned by unknown group {}", slot.id, slot.group_id);
            }
            if let Some(action) = slot.action {
                if !self.groups.contains_key(&action.target_id) {
                    bail!(
                        "slot {} migrating to unknown group {}",
                        slot.id,
                        action.target_id
                    );
                }
                if action.target_id == slot.group_id {
                    bail!("slot {} migrating to its own group", slot.id);
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for (gid, group) in &self.groups {
            if *gid != group.id {
                bail!("group {} keyed under {gid}", group.id);
            }
            if !valid_group_id(group.id) {
                bail!("group id {} out of range [1, 9999]", group.id);
            }
            for server in &group.servers {
                if !seen.insert(server.addr.as_str()) {
                    bail!("server {} appears in more than one position", server.addr);
                }
            }
            if let Some(promoting) = group.promoting {
                if promoting.index >= group.servers.len() {
                    bail!(
                        "group {} promoting index {} out of bounds",
                        group.id,
                        promoting.index
                    );
                }
            }
        }
        for (token, proxy) in &self.proxies {
            if *token != proxy.token {
                bail!("proxy {} registered under foreign token {token}", proxy.token);
            }
        }
        Ok(())
    }

    // ---- persistence codec ----

    /// Serialize to the MessagePack form the store persists.
    ///
    /// # Errors
    ///
    /// Fails only if serialization itself fails, which a well-formed topology
    /// never does.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).context("encode topology")
    }

    /// Decode a persisted topology and re-check its invariants.
    ///
    /// A lagging `proxy_seq` (behind the highest registered proxy id) is
    /// repaired rather than rejected so id allocation stays collision-free.
    ///
    /// # Errors
    ///
    /// Fails on undecodable bytes or an invariant violation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut topology: Self = rmp_serde::from_slice(bytes).context("decode topology")?;
        let max_proxy_id = topology.proxies.values().map(|p| p.id).max().unwrap_or(0);
        if topology.proxy_seq < max_proxy_id {
            warn!(
                proxy_seq = topology.proxy_seq,
                max_proxy_id, "proxy sequence behind registered ids; bumping"
            );
            topology.proxy_seq = max_proxy_id;
        }
        topology.validate()?;
        Ok(topology)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
