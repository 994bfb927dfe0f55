//! Compact-all compaction: merge every live SSTable into a fresh set.
//!
//! Triggered once the catalog holds [`COMPACTION_TRIGGER`] or more
//! tables. A heap-based k-way merge ([`MergeIterator`]) walks every
//! table in `(key ASC, sequence_no DESC)` order, keeps only the newest
//! version of each key, drops tombstones outright (safe because no
//! older table survives outside the merge set), and splits the output
//! into [`crate::sstable::SSTABLE_CAPACITY`]-sized chunks.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::catalog::{Catalog, CatalogEntry, CatalogError};
use crate::memtable::EntryValue;
use crate::sstable::{SSTable, SSTABLE_CAPACITY, SstEntry, SstableError};

/// Number of live SSTables that triggers a compaction round.
pub const COMPACTION_TRIGGER: usize = 5;

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("sstable error: {0}")]
    Sstable(#[from] SstableError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Record type the merge iterator walks: a key's version from exactly
/// one source SSTable, ordered by `(key ASC, sequence_no DESC)`.
#[derive(Debug, Clone)]
struct MergeRecord(SstEntry);

impl PartialEq for MergeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key && self.0.sequence_no == other.0.sequence_no
    }
}
impl Eq for MergeRecord {}

impl PartialOrd for MergeRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.0.key.cmp(&other.0.key) {
            std::cmp::Ordering::Equal => other.0.sequence_no.cmp(&self.0.sequence_no),
            ord => ord,
        }
    }
}

struct HeapEntry {
    record: MergeRecord,
    source_idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap: reverse so the smallest key / highest sequence_no pops first.
        self.record.cmp(&other.record).reverse()
    }
}

/// Heap-based k-way merge over several sorted [`SstEntry`] streams.
pub struct MergeIterator<'a> {
    iters: Vec<Box<dyn Iterator<Item = SstEntry> + 'a>>,
    heap: std::collections::BinaryHeap<HeapEntry>,
}

impl<'a> MergeIterator<'a> {
    pub fn new(mut iters: Vec<Box<dyn Iterator<Item = SstEntry> + 'a>>) -> Self {
        let mut heap = std::collections::BinaryHeap::new();
        for (idx, iter) in iters.iter_mut().enumerate() {
            if let Some(entry) = iter.next() {
                heap.push(HeapEntry {
                    record: MergeRecord(entry),
                    source_idx: idx,
                });
            }
        }
        Self { iters, heap }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = SstEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        let idx = top.source_idx;
        if let Some(next_entry) = self.iters[idx].next() {
            self.heap.push(HeapEntry {
                record: MergeRecord(next_entry),
                source_idx: idx,
            });
        }
        Some(top.record.0)
    }
}

/// Drop everything but the newest version of each key, discarding
/// tombstones entirely (safe only when every table covering that key's
/// history is part of the merge — true for compact-all).
fn dedup_and_drop_tombstones(merged: impl Iterator<Item = SstEntry>) -> Vec<SstEntry> {
    let mut out = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;

    for entry in merged {
        if last_key.as_ref() == Some(&entry.key) {
            continue;
        }
        last_key = Some(entry.key.clone());
        if matches!(entry.value, EntryValue::Tombstone) {
            continue;
        }
        out.push(entry);
    }

    out
}

/// Merge every table, keep only the newest version of each key, drop
/// tombstones, and commit the result to the catalog as one atomic swap.
/// Runs unconditionally — callers decide whether the trigger is met.
pub fn compact_tables(
    catalog: &Catalog,
    data_dir: &std::path::Path,
    tables: &[Arc<SSTable>],
) -> Result<(), CompactionError> {
    let removed_ids: Vec<u64> = tables.iter().map(|t| t.id).collect();
    let iters: Vec<Box<dyn Iterator<Item = SstEntry>>> = tables
        .iter()
        .map(|t| -> Box<dyn Iterator<Item = SstEntry>> { Box::new(t.iter().cloned()) })
        .collect();
    let merged = MergeIterator::new(iters);
    let survivors = dedup_and_drop_tombstones(merged);

    info!(
        input_tables = tables.len(),
        surviving_entries = survivors.len(),
        "running compact-all"
    );

    if survivors.is_empty() {
        catalog.replace(Vec::new(), removed_ids)?;
        return Ok(());
    }

    let mut added = Vec::new();
    for chunk in survivors.chunks(SSTABLE_CAPACITY) {
        let id = catalog.allocate_id()?;
        let path = data_dir.join(format!("{id:06}.sst"));
        SSTable::write(&path, id, chunk.to_vec())?;
        added.push(CatalogEntry { id, path });
    }

    catalog.replace(added, removed_ids)?;
    Ok(())
}

/// Run one round of compact-all over every SSTable the catalog currently
/// lists. No-op (returns `Ok(false)`) below [`COMPACTION_TRIGGER`].
pub fn compact_all(
    catalog: &Catalog,
    data_dir: &std::path::Path,
    tables: &[Arc<SSTable>],
) -> Result<bool, CompactionError> {
    if tables.len() < COMPACTION_TRIGGER {
        return Ok(false);
    }
    compact_tables(catalog, data_dir, tables)?;
    Ok(true)
}
