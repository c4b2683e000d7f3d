//! Topology store contract.
//!
//! The store holds exactly one [`Topology`] document plus the expansion plan
//! list. All topology writes go through optimistic concurrency: callers read
//! a versioned snapshot, derive the next document, and submit it together
//! with the version they read. A write against a version that is no longer
//! current fails with [`StoreError::StaleWrite`] and must be retried from a
//! fresh read. The store never merges.

use std::sync::Arc;

use async_trait::async_trait;
use shardhelm_core::{ExpansionPlan, Topology};
use thiserror::Error;

/// An immutable, versioned view of the cluster topology.
///
/// Snapshots are cheap to clone and safe to hold across awaits; they never
/// change after being returned.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Monotonic document version. Starts at 0 for the empty topology and
    /// increments by exactly 1 per successful swap.
    pub version: u64,
    pub topology: Arc<Topology>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version no longer matches what the caller read.
    #[error("topology version moved from {expected} to {actual}")]
    StaleWrite { expected: u64, actual: u64 },

    /// The stored payload failed checksum or structural validation.
    #[error("stored payload failed verification: {0}")]
    Corrupt(String),

    /// Underlying storage failure.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Durable home for the topology document and the expansion plan list.
#[async_trait]
pub trait TopologyStore: Send + Sync + 'static {
    /// Current snapshot. An empty store reads as version 0 with the
    /// unassigned topology.
    async fn read(&self) -> Result<Snapshot, StoreError>;

    /// Replace the topology if and only if the stored version still equals
    /// `expected_version`. On success returns the new snapshot, whose
    /// version is `expected_version + 1`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: Topology,
    ) -> Result<Snapshot, StoreError>;

    /// Load the persisted expansion plans, ordered by plan id.
    async fn load_plans(&self) -> Result<Vec<ExpansionPlan>, StoreError>;

    /// Replace the persisted expansion plan list.
    async fn save_plans(&self, plans: &[ExpansionPlan]) -> Result<(), StoreError>;
}
