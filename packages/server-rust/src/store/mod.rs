//! Topology persistence.
//!
//! One interface, [`TopologyStore`], with two backends: an in-memory store
//! for tests and throwaway clusters, and a redb-backed store for real
//! deployments. Both enforce compare-and-swap writes keyed on the document
//! version; the coordinator never holds a long-lived lock on the topology.

pub mod engine;
pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

pub use engine::{Snapshot, StoreError, TopologyStore};
pub use memory::MemoryStore;
#[cfg(feature = "redb")]
pub use redb::RedbStore;
