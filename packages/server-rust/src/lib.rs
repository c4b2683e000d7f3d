//! Shardhelm coordinator — topology store, slot migration engine, group and
//! replication management, and the admin API for a sharded key-value
//! cluster.

pub mod clients;
pub mod coordinator;
pub mod error;
pub mod network;
pub mod store;
pub mod telemetry;

pub use coordinator::{CoordConfig, Coordinator};
pub use error::{Conflict, CoordError};
