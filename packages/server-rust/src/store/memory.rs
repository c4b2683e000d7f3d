//! In-memory topology store.
//!
//! Backs tests and `--store memory` deployments where durability is not
//! needed. Same compare-and-swap semantics as the durable stores, so code
//! exercised against it behaves identically against redb.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use shardhelm_core::{ExpansionPlan, Topology};

use super::engine::{Snapshot, StoreError, TopologyStore};

struct Inner {
    version: u64,
    topology: Arc<Topology>,
    plans: Vec<ExpansionPlan>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                version: 0,
                topology: Arc::new(Topology::new()),
                plans: Vec::new(),
            }),
        }
    }

    /// Seed the store with a topology at version 1. Test convenience.
    #[must_use]
    pub fn with_topology(topology: Topology) -> Self {
        Self {
            inner: RwLock::new(Inner {
                version: 1,
                topology: Arc::new(topology),
                plans: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopologyStore for MemoryStore {
    async fn read(&self) -> Result<Snapshot, StoreError> {
        let inner = self.inner.read();
        Ok(Snapshot {
            version: inner.version,
            topology: Arc::clone(&inner.topology),
        })
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: Topology,
    ) -> Result<Snapshot, StoreError> {
        let mut inner = self.inner.write();
        if inner.version != expected_version {
            return Err(StoreError::StaleWrite {
                expected: expected_version,
                actual: inner.version,
            });
        }
        inner.version += 1;
        inner.topology = Arc::new(next);
        Ok(Snapshot {
            version: inner.version,
            topology: Arc::clone(&inner.topology),
        })
    }

    async fn load_plans(&self) -> Result<Vec<ExpansionPlan>, StoreError> {
        Ok(self.inner.read().plans.clone())
    }

    async fn save_plans(&self, plans: &[ExpansionPlan]) -> Result<(), StoreError> {
        self.inner.write().plans = plans.to_vec();
        Ok(())
    }
}
