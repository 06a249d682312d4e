//! Sharded hash multimap built concurrently, then sealed for lock-free probing.
//!
//! Insertion is two-phase: a caller first partitions its entries into
//! per-bucket staging vectors (no locks), then drains them with `try_lock`,
//! skipping buckets another inserter holds. A pass that drains nothing
//! sleeps a bounded backoff before retrying.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use colex_common::{ColexError, Result};
use parking_lot::Mutex;

/// Backoff cap for a pass that made no progress.
const MAX_BACKOFF: Duration = Duration::from_millis(5);

/// Opaque byte encoding of a composite join key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypelessKey(pub Vec<u8>);

pub type ScalarJoinTable = JoinTable<u64>;
pub type TypelessJoinTable = JoinTable<TypelessKey>;

struct Bucket<K> {
    map: HashMap<K, Vec<u32>>,
    entries: usize,
}

impl<K> Default for Bucket<K> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            entries: 0,
        }
    }
}

/// Multimap from key to small-side row positions.
pub struct JoinTable<K> {
    buckets: Vec<Mutex<Bucket<K>>>,
    mask: usize,
    backoff: Duration,
    inserted: AtomicUsize,
    sealed: OnceLock<Vec<HashMap<K, Vec<u32>>>>,
}

impl<K> std::fmt::Debug for JoinTable<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinTable")
            .field("buckets", &self.buckets.len())
            .field("inserted", &self.inserted.load(Ordering::Relaxed))
            .field("sealed", &self.sealed.get().is_some())
            .finish()
    }
}

impl<K: Hash + Eq> JoinTable<K> {
    /// `buckets` is rounded up to a power of two.
    pub fn new(buckets: usize, backoff: Duration) -> Self {
        let n = buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..n).map(|_| Mutex::new(Bucket::default())).collect(),
            mask: n - 1,
            backoff,
            inserted: AtomicUsize::new(0),
            sealed: OnceLock::new(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &K) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() as usize) & self.mask
    }

    /// Insert a batch of (key, row) entries; safe to call from many threads.
    pub fn insert_batch(&self, entries: impl IntoIterator<Item = (K, u32)>) -> Result<()> {
        if self.is_sealed() {
            return Err(ColexError::Execution(
                "insert into a sealed join table".to_string(),
            ));
        }
        let mut staged: Vec<Vec<(K, u32)>> =
            (0..self.buckets.len()).map(|_| Vec::new()).collect();
        let mut pending = 0_usize;
        for (key, row) in entries {
            let b = self.bucket_of(&key);
            staged[b].push((key, row));
            pending += 1;
        }
        let total = pending;

        let mut backoff = self
            .backoff
            .saturating_mul(self.buckets.len() as u32)
            .min(MAX_BACKOFF);
        if backoff.is_zero() {
            backoff = Duration::from_micros(1);
        }
        while pending > 0 {
            let mut progressed = false;
            for (idx, stage) in staged.iter_mut().enumerate() {
                if stage.is_empty() {
                    continue;
                }
                let Some(mut bucket) = self.buckets[idx].try_lock() else {
                    continue;
                };
                let n = stage.len();
                for (key, row) in stage.drain(..) {
                    bucket.map.entry(key).or_default().push(row);
                }
                bucket.entries += n;
                pending -= n;
                progressed = true;
            }
            if !progressed {
                thread::sleep(backoff);
            }
        }
        self.inserted.fetch_add(total, Ordering::AcqRel);
        Ok(())
    }

    /// Entries inserted so far, summed over every bucket.
    pub fn len(&self) -> usize {
        if let Some(maps) = self.sealed.get() {
            return maps.iter().map(|m| m.values().map(Vec::len).sum::<usize>()).sum();
        }
        self.buckets.iter().map(|b| b.lock().entries).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Completeness gate: once every bucket together holds exactly
    /// `expected` entries the table is sealed read-only. Returns whether it
    /// is sealed; more entries than announced is a protocol error.
    pub fn complete(&self, expected: usize) -> Result<bool> {
        if self.is_sealed() {
            return Ok(true);
        }
        let mut guards: Vec<_> = self.buckets.iter().map(|b| b.lock()).collect();
        let live: usize = guards.iter().map(|g| g.entries).sum();
        if live < expected {
            return Ok(false);
        }
        if live > expected {
            return Err(ColexError::Protocol(format!(
                "join table holds {live} entries but the build announced {expected}"
            )));
        }
        let maps: Vec<HashMap<K, Vec<u32>>> = guards
            .iter_mut()
            .map(|g| std::mem::take(&mut g.map))
            .collect();
        // A concurrent caller may have sealed between our check and the locks.
        let _ = self.sealed.set(maps);
        Ok(true)
    }

    /// Small-side rows matching `key`; an empty slice when absent.
    pub fn probe(&self, key: &K) -> Result<&[u32]> {
        let maps = self.sealed.get().ok_or_else(|| {
            ColexError::Execution("probe before the join table was completed".to_string())
        })?;
        Ok(maps[self.bucket_of(key)]
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn probe_requires_completion() {
        let table = ScalarJoinTable::new(4, Duration::from_micros(500));
        table.insert_batch([(1, 0), (1, 1), (2, 2)]).expect("insert");
        assert!(table.probe(&1).is_err());
        assert!(!table.complete(4).expect("gate"));
        assert!(table.complete(3).expect("gate"));
        let mut rows = table.probe(&1).expect("probe").to_vec();
        rows.sort_unstable();
        assert_eq!(rows, vec![0, 1]);
        assert!(table.probe(&3).expect("probe").is_empty());
        assert!(table.insert_batch([(5, 5)]).is_err());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn over_delivery_is_rejected() {
        let table = ScalarJoinTable::new(2, Duration::ZERO);
        table.insert_batch([(1, 0), (2, 1), (3, 2)]).expect("insert");
        assert!(matches!(table.complete(2), Err(ColexError::Protocol(_))));
        assert!(!table.is_sealed());
        assert!(table.complete(3).expect("gate"));
    }

    #[test]
    fn debug_needs_no_key_bounds() {
        struct Opaque;
        let table: JoinTable<Opaque> = JoinTable {
            buckets: Vec::new(),
            mask: 0,
            backoff: Duration::ZERO,
            inserted: AtomicUsize::new(0),
            sealed: OnceLock::new(),
        };
        assert!(format!("{table:?}").contains("sealed: false"));
    }

    #[test]
    fn bucket_count_rounds_to_power_of_two() {
        let table = TypelessJoinTable::new(5, Duration::ZERO);
        assert_eq!(table.bucket_count(), 8);
    }

    #[test]
    fn concurrent_inserters_all_land() {
        let table = Arc::new(ScalarJoinTable::new(4, Duration::from_micros(10)));
        let handles: Vec<_> = (0..8_u32)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let entries: Vec<_> = (0..1000_u32)
                        .map(|i| (u64::from(i % 17), t * 1000 + i))
                        .collect();
                    table.insert_batch(entries).expect("insert");
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert!(table.complete(8000).expect("gate"));
        let total: usize = (0..17).map(|k| table.probe(&k).expect("probe").len()).sum();
        assert_eq!(total, 8000);
    }
}
