//! Shardhelm core — slot table, replica groups, expansion plans, and the
//! persisted topology model shared by the coordinator.

pub mod auth;
pub mod expansion;
pub mod group;
pub mod proxy;
pub mod sentinel;
pub mod slots;
pub mod topology;
pub mod traits;

pub use expansion::{AddPlanRequest, CleanStep, ExpansionPlan, PlanAction, PlanStep};
pub use group::{
    valid_group_id, Group, GroupServer, PromotePhase, Promoting, SyncAction, SyncState,
    MAX_GROUP_ID,
};
pub use proxy::Proxy;
pub use sentinel::Sentinel;
pub use slots::{
    format_slot_list, parse_slot_list, ActionState, SlotAction, SlotMapping, SlotView, SLOT_COUNT,
};
pub use topology::Topology;
pub use traits::{
    ProxyAdmin, ProxyStats, ReplicationStatus, SentinelGate, ServerCommands, ServerRole,
    ServerStatus,
};
