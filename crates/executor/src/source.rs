//! Storage-facing side of the executor.
//!
//! The executor reads column blocks by (object id, LBID) through
//! [`BlockSource`]. A block holds up to [`ROWS_PER_BLOCK`] rows of one column;
//! consecutive blocks of a column sit `kind.width()` LBIDs apart.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::array::{Array, ArrayRef};
use colex_common::{ColexError, Result, ROWS_PER_BLOCK};
use colex_execution::ColumnKind;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// One column block as handed to the executor.
#[derive(Debug, Clone)]
pub struct LoadedBlock {
    pub values: ArrayRef,
    /// Absolute row id of the block's first row.
    pub first_rid: u64,
    /// Served from cache rather than read physically.
    pub was_cached: bool,
}

/// Read access to column blocks.
///
/// `load_block` fails with [`ColexError::RestartRequired`] when the caller's
/// view of the object's metadata is stale; the owner of that metadata calls
/// `invalidate` before resubmitting.
pub trait BlockSource: Send + Sync {
    fn load_block(&self, oid: u32, lbid: u64, kind: ColumnKind) -> Result<LoadedBlock>;
    fn invalidate(&self, oids: &[u32]);
}

#[derive(Debug, Clone)]
struct StoredBlock {
    values: ArrayRef,
    first_rid: u64,
}

/// Block source over in-process arrays, used by the local worker and tests.
#[derive(Debug, Default)]
pub struct MemoryBlockSource {
    blocks: RwLock<HashMap<(u32, u64), StoredBlock>>,
    cached: Mutex<HashSet<(u32, u64)>>,
    stale: Mutex<HashSet<u32>>,
    loads: AtomicU64,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a whole column starting at `start_lbid`, split into blocks.
    /// Returns the LBID of every block written.
    pub fn put_column(
        &self,
        oid: u32,
        kind: ColumnKind,
        start_lbid: u64,
        first_rid: u64,
        values: ArrayRef,
    ) -> Result<Vec<u64>> {
        kind.validate()?;
        if values.data_type() != &kind.data_type() {
            return Err(ColexError::Execution(format!(
                "column {oid} holds {:?}, expected {:?}",
                values.data_type(),
                kind.data_type()
            )));
        }
        let step = u64::from(kind.width());
        let mut lbids = Vec::new();
        let mut blocks = self.blocks.write();
        let mut offset = 0;
        loop {
            let len = (values.len() - offset).min(ROWS_PER_BLOCK);
            let lbid = start_lbid + step * lbids.len() as u64;
            blocks.insert(
                (oid, lbid),
                StoredBlock {
                    values: values.slice(offset, len),
                    first_rid: first_rid + offset as u64,
                },
            );
            lbids.push(lbid);
            offset += len;
            if offset >= values.len() {
                break;
            }
        }
        Ok(lbids)
    }

    /// Make loads of `oid` fail with a restart request until invalidated.
    pub fn mark_stale(&self, oid: u32) {
        self.stale.lock().insert(oid);
    }

    /// Number of successful loads served so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Acquire)
    }
}

impl BlockSource for MemoryBlockSource {
    fn load_block(&self, oid: u32, lbid: u64, kind: ColumnKind) -> Result<LoadedBlock> {
        if self.stale.lock().contains(&oid) {
            return Err(ColexError::RestartRequired(format!(
                "metadata of oid {oid} is stale"
            )));
        }
        let block = self.blocks.read().get(&(oid, lbid)).cloned().ok_or_else(|| {
            ColexError::Execution(format!("no block at lbid {lbid} for oid {oid}"))
        })?;
        if block.values.data_type() != &kind.data_type() {
            return Err(ColexError::Protocol(format!(
                "oid {oid} read as {kind:?} but stores {:?}",
                block.values.data_type()
            )));
        }
        let was_cached = !self.cached.lock().insert((oid, lbid));
        self.loads.fetch_add(1, Ordering::AcqRel);
        Ok(LoadedBlock {
            values: block.values,
            first_rid: block.first_rid,
            was_cached,
        })
    }

    fn invalidate(&self, oids: &[u32]) {
        let mut stale = self.stale.lock();
        let mut cached = self.cached.lock();
        for oid in oids {
            stale.remove(oid);
        }
        cached.retain(|(oid, _)| !oids.contains(oid));
        debug!(?oids, "invalidated cached block metadata");
    }
}
