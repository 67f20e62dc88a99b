//! Catalog persistence: a narrow load/store interface plus the two backing
//! implementations (fjall on disk, in-memory for tests).
//!
//! Persistence is write-through: the catalog serializes every touched range
//! before a mutation returns success, and rolls the mutation back in memory
//! if the write fails.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use fjall::{PartitionCreateOptions, PersistMode};
use serde::{Deserialize, Serialize};

use crate::placement::PlacementRecord;
use crate::range::{Key, RangeId, RangeState, ReplicationPolicy};

/// Serialized range, the unit of catalog persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRecord {
    pub id: RangeId,
    pub start: Key,
    pub end: Key,
    pub state: RangeState,
    pub parents: Vec<RangeId>,
    pub children: Vec<RangeId>,
    pub policy: ReplicationPolicy,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
    pub placements: Vec<PlacementRecord>,
}

/// Storage backend for the range catalog.
///
/// Calls run under the keyspace lock and must complete before the mutating
/// tick returns, so implementations are synchronous.
pub trait Persister: Send + Sync {
    /// Load the full catalog.
    fn get_ranges(&self) -> anyhow::Result<Vec<RangeRecord>>;

    /// Upsert all touched ranges in a single transaction.
    fn put_ranges(&self, ranges: &[RangeRecord]) -> anyhow::Result<()>;

    fn get_parents(&self, id: RangeId) -> anyhow::Result<Vec<RangeId>>;
    fn get_children(&self, id: RangeId) -> anyhow::Result<Vec<RangeId>>;
    fn get_placements(&self, id: RangeId) -> anyhow::Result<Vec<PlacementRecord>>;
}

/// Fjall-backed persister. One partition; key = big-endian range id,
/// value = JSON-encoded `RangeRecord`.
pub struct FjallPersister {
    keyspace: fjall::Keyspace,
    ranges: fjall::PartitionHandle,
}

impl FjallPersister {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open catalog keyspace")?;
        let ranges = keyspace
            .open_partition("ranges", PartitionCreateOptions::default())
            .context("open ranges partition")?;
        Ok(Self { keyspace, ranges })
    }

    fn get(&self, id: RangeId) -> anyhow::Result<RangeRecord> {
        let raw = self
            .ranges
            .get(id.to_be_bytes())?
            .with_context(|| format!("range {id} not in catalog store"))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl Persister for FjallPersister {
    fn get_ranges(&self) -> anyhow::Result<Vec<RangeRecord>> {
        let mut out = Vec::new();
        for item in self.ranges.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice::<RangeRecord>(&value)?);
        }
        // Big-endian keys iterate in id order already; don't rely on it.
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    fn put_ranges(&self, ranges: &[RangeRecord]) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for rec in ranges {
            let value = serde_json::to_vec(rec).context("serialize range record")?;
            batch.insert(&self.ranges, rec.id.to_be_bytes().to_vec(), value);
        }
        batch.commit().context("commit range batch")?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("sync catalog store")?;
        Ok(())
    }

    fn get_parents(&self, id: RangeId) -> anyhow::Result<Vec<RangeId>> {
        Ok(self.get(id)?.parents)
    }

    fn get_children(&self, id: RangeId) -> anyhow::Result<Vec<RangeId>> {
        Ok(self.get(id)?.children)
    }

    fn get_placements(&self, id: RangeId) -> anyhow::Result<Vec<PlacementRecord>> {
        Ok(self.get(id)?.placements)
    }
}

/// In-memory persister for tests. Can be told to fail the next write, to
/// exercise the catalog's rollback path.
#[derive(Default)]
pub struct MemoryPersister {
    ranges: Mutex<BTreeMap<RangeId, RangeRecord>>,
    fail_next_put: AtomicBool,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store, so `Keyspace::open` restores this catalog.
    pub fn seeded(records: Vec<RangeRecord>) -> Self {
        let p = Self::new();
        {
            let mut ranges = p.ranges.lock().unwrap();
            for rec in records {
                ranges.insert(rec.id, rec);
            }
        }
        p
    }

    pub fn fail_next_put(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }
}

impl Persister for MemoryPersister {
    fn get_ranges(&self) -> anyhow::Result<Vec<RangeRecord>> {
        Ok(self.ranges.lock().unwrap().values().cloned().collect())
    }

    fn put_ranges(&self, ranges: &[RangeRecord]) -> anyhow::Result<()> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected persistence failure");
        }
        let mut stored = self.ranges.lock().unwrap();
        for rec in ranges {
            stored.insert(rec.id, rec.clone());
        }
        Ok(())
    }

    fn get_parents(&self, id: RangeId) -> anyhow::Result<Vec<RangeId>> {
        let ranges = self.ranges.lock().unwrap();
        let rec = ranges
            .get(&id)
            .with_context(|| format!("range {id} not in catalog store"))?;
        Ok(rec.parents.clone())
    }

    fn get_children(&self, id: RangeId) -> anyhow::Result<Vec<RangeId>> {
        let ranges = self.ranges.lock().unwrap();
        let rec = ranges
            .get(&id)
            .with_context(|| format!("range {id} not in catalog store"))?;
        Ok(rec.children.clone())
    }

    fn get_placements(&self, id: RangeId) -> anyhow::Result<Vec<PlacementRecord>> {
        let ranges = self.ranges.lock().unwrap();
        let rec = ranges
            .get(&id)
            .with_context(|| format!("range {id} not in catalog store"))?;
        Ok(rec.placements.clone())
    }
}
