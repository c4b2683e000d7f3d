//! Durable topology store on redb.
//!
//! Layout:
//!
//! - `topology` table, single row under key `"current"`, holding a msgpack
//!   envelope of `{version, checksum, payload}` where `payload` is the
//!   encoded [`Topology`] and `checksum` is its blake3 hash.
//! - `expansion_plans` table, one row per plan keyed by plan id, holding the
//!   `$`-delimited plan record.
//!
//! redb gives us single-writer transactions, so the version check and the
//! insert of a compare-and-swap commit atomically. All calls go through
//! `spawn_blocking`; redb I/O must not run on the async executor.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use shardhelm_core::{ExpansionPlan, Topology};

use super::engine::{Snapshot, StoreError, TopologyStore};

const TOPOLOGY: TableDefinition<&str, &[u8]> = TableDefinition::new("topology");
const PLANS: TableDefinition<u64, &str> = TableDefinition::new("expansion_plans");

const CURRENT_KEY: &str = "current";

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u64,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create the store file. Tables are created eagerly so read
    /// paths never have to special-case a missing table.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created or is not a redb database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(io_err)?;
        let txn = db.begin_write().map_err(io_err)?;
        {
            let _topology = txn.open_table(TOPOLOGY).map_err(io_err)?;
            let _plans = txn.open_table(PLANS).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl TopologyStore for RedbStore {
    async fn read(&self) -> Result<Snapshot, StoreError> {
        let db = Arc::clone(&self.db);
        run_blocking(move || read_sync(&db)).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: Topology,
    ) -> Result<Snapshot, StoreError> {
        let db = Arc::clone(&self.db);
        run_blocking(move || compare_and_swap_sync(&db, expected_version, next)).await
    }

    async fn load_plans(&self) -> Result<Vec<ExpansionPlan>, StoreError> {
        let db = Arc::clone(&self.db);
        run_blocking(move || load_plans_sync(&db)).await
    }

    async fn save_plans(&self, plans: &[ExpansionPlan]) -> Result<(), StoreError> {
        let db = Arc::clone(&self.db);
        let plans = plans.to_vec();
        run_blocking(move || save_plans_sync(&db, &plans)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StoreError::Io(anyhow::anyhow!("store worker aborted: {err}")))?
}

fn io_err<E>(err: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::Io(anyhow::Error::new(err))
}

// ---------------------------------------------------------------------------
// Blocking internals
// ---------------------------------------------------------------------------

fn read_sync(db: &Database) -> Result<Snapshot, StoreError> {
    let txn = db.begin_read().map_err(io_err)?;
    let table = txn.open_table(TOPOLOGY).map_err(io_err)?;
    match table.get(CURRENT_KEY).map_err(io_err)? {
        Some(row) => decode_envelope(row.value()),
        None => Ok(Snapshot {
            version: 0,
            topology: Arc::new(Topology::new()),
        }),
    }
}

fn compare_and_swap_sync(
    db: &Database,
    expected_version: u64,
    next: Topology,
) -> Result<Snapshot, StoreError> {
    let txn = db.begin_write().map_err(io_err)?;
    let snapshot;
    {
        let mut table = txn.open_table(TOPOLOGY).map_err(io_err)?;
        let actual = match table.get(CURRENT_KEY).map_err(io_err)? {
            Some(row) => stored_version(row.value())?,
            None => 0,
        };
        if actual != expected_version {
            // Dropping the open transaction aborts it.
            return Err(StoreError::StaleWrite {
                expected: expected_version,
                actual,
            });
        }
        let bytes = encode_envelope(expected_version + 1, &next)?;
        table
            .insert(CURRENT_KEY, bytes.as_slice())
            .map_err(io_err)?;
        snapshot = Snapshot {
            version: expected_version + 1,
            topology: Arc::new(next),
        };
    }
    txn.commit().map_err(io_err)?;
    Ok(snapshot)
}

fn load_plans_sync(db: &Database) -> Result<Vec<ExpansionPlan>, StoreError> {
    let txn = db.begin_read().map_err(io_err)?;
    let table = txn.open_table(PLANS).map_err(io_err)?;
    let mut plans = Vec::new();
    for row in table.iter().map_err(io_err)? {
        let (_, value) = row.map_err(io_err)?;
        let plan = ExpansionPlan::parse_record(value.value())
            .map_err(|err| StoreError::Corrupt(format!("expansion plan record: {err}")))?;
        plans.push(plan);
    }
    Ok(plans)
}

fn save_plans_sync(db: &Database, plans: &[ExpansionPlan]) -> Result<(), StoreError> {
    let txn = db.begin_write().map_err(io_err)?;
    txn.delete_table(PLANS).map_err(io_err)?;
    {
        let mut table = txn.open_table(PLANS).map_err(io_err)?;
        for plan in plans {
            table
                .insert(plan.id, plan.to_record().as_str())
                .map_err(io_err)?;
        }
    }
    txn.commit().map_err(io_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Envelope codec
// ---------------------------------------------------------------------------

fn encode_envelope(version: u64, topology: &Topology) -> Result<Vec<u8>, StoreError> {
    let payload = topology.encode().map_err(StoreError::Io)?;
    let checksum = *blake3::hash(&payload).as_bytes();
    rmp_serde::to_vec_named(&Envelope {
        version,
        checksum,
        payload,
    })
    .map_err(io_err)
}

fn decode_envelope(bytes: &[u8]) -> Result<Snapshot, StoreError> {
    let envelope: Envelope =
        rmp_serde::from_slice(bytes).map_err(|err| StoreError::Corrupt(err.to_string()))?;
    if *blake3::hash(&envelope.payload).as_bytes() != envelope.checksum {
        return Err(StoreError::Corrupt("checksum mismatch".to_string()));
    }
    let topology = Topology::decode(&envelope.payload)
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;
    Ok(Snapshot {
        version: envelope.version,
        topology: Arc::new(topology),
    })
}

fn stored_version(bytes: &[u8]) -> Result<u64, StoreError> {
    let envelope: Envelope =
        rmp_serde::from_slice(bytes).map_err(|err| StoreError::Corrupt(err.to_string()))?;
    Ok(envelope.version)
}
