//! Replica groups: ordered server lists, promotion state, sync actions.
//!
//! A group is the unit of slot ownership. Its server list is ordered —
//! `servers[0]` is the logical master, everything after it a replica. Two
//! pieces of transient state ride on the group:
//!
//! - [`Promoting`]: a two-phase master swap in progress (the promote RPC
//!   prepares, the promote-commit RPC reorders the servers).
//! - per-server [`SyncAction`]s: a queue of replication catch-up jobs drained
//!   by the coordinator's background tick, lowest index first.

use serde::{Deserialize, Serialize};

/// Largest addressable group id; ids are `1..=MAX_GROUP_ID` (`0` marks an
/// unassigned slot).
pub const MAX_GROUP_ID: u32 = 9999;

/// Whether `gid` is inside the addressable group id range.
#[must_use]
pub fn valid_group_id(gid: u32) -> bool {
    (1..=MAX_GROUP_ID).contains(&gid)
}

// ---------------------------------------------------------------------------
// Sync actions
// ---------------------------------------------------------------------------

/// State of a per-server replication sync action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncState {
    /// No action queued.
    #[default]
    Nothing,
    /// Queued; `index` orders it against other pending actions.
    Pending,
    /// The background tick is (re)pointing this server at its master.
    Syncing,
    Synced,
    SyncedFailed,
}

/// A replication catch-up job attached to one group server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    pub state: SyncState,
    /// Queue position; meaningful while `state` is `Pending`.
    pub index: u64,
}

// ---------------------------------------------------------------------------
// GroupServer
// ---------------------------------------------------------------------------

/// One storage server inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupServer {
    /// `host:port` of the server's admin endpoint.
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub sync: SyncAction,
}

impl GroupServer {
    #[must_use]
    pub fn new(addr: impl Into<String>, datacenter: Option<String>) -> Self {
        Self {
            addr: addr.into(),
            datacenter,
            sync: SyncAction::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Promotion state
// ---------------------------------------------------------------------------

/// Phase of an in-flight promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotePhase {
    /// Accepted; routing for the group's slots is being paused.
    Preparing,
    /// Paused everywhere; waiting for the promote-commit RPC.
    Prepared,
}

/// A two-phase master swap in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promoting {
    /// Index into `Group::servers` of the server being promoted.
    pub index: usize,
    pub phase: PromotePhase,
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A replica group. `servers[0]` is the logical master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: u32,
    pub servers: Vec<GroupServer>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub promoting: Option<Promoting>,
    /// Set when group membership changed but proxies/watchdogs were not yet
    /// resynced; cleared by a successful resync.
    #[serde(default)]
    pub out_of_sync: bool,
}

impl Group {
    /// A new empty group.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            servers: Vec::new(),
            promoting: None,
            out_of_sync: false,
        }
    }

    /// Logical master address (`servers[0]`), if the group has any server.
    #[must_use]
    pub fn master_addr(&self) -> Option<&str> {
        self.servers.first().map(|s| s.addr.as_str())
    }

    /// Position of `addr` in the server list.
    #[must_use]
    pub fn index_of(&self, addr: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.addr == addr)
    }

    #[must_use]
    pub fn contains(&self, addr: &str) -> bool {
        self.index_of(addr).is_some()
    }

    #[must_use]
    pub fn is_promoting(&self) -> bool {
        self.promoting.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
