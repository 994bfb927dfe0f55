//! The LSM storage engine: ties the memtable, SSTable catalog, and
//! compactor together behind a single-writer/multi-reader lock.
//!
//! Writes go through exactly one active [`Memtable`]; once it reaches
//! [`MEMTABLE_CAPACITY`](crate::memtable::MEMTABLE_CAPACITY) distinct
//! keys, `put`/`delete` flush it to a fresh SSTable inline before
//! returning. Reads check the memtable first, then the catalog's
//! SSTables from youngest to oldest. Compaction is triggered
//! automatically once the catalog accumulates
//! [`COMPACTION_TRIGGER`](crate::compaction::COMPACTION_TRIGGER) tables.


use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogError};
use crate::compaction::{self, CompactionError};
use crate::memtable::{EntryValue, Memtable, MemtableError};
use crate::sstable::{SSTable, SstEntry, SstableError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    #[error("sstable error: {0}")]
    Sstable(#[from] SstableError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Knobs that are genuinely configuration (as opposed to the intrinsic,
/// fixed thresholds of the data model).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Subdirectory (under the data directory) that holds SSTable files.
    pub sstable_dir: String,
    /// Largest single WAL record the memtable and catalog logs will
    /// accept, in bytes.
    pub wal_max_record_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sstable_dir: "sstables".to_string(),
            wal_max_record_size: crate::wal::DEFAULT_MAX_RECORD_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Distinct keys visible through `get`/`range` right now: memtable
    /// and every SSTable merged, newest version per key, tombstones
    /// resolved away.
    pub total_keys_visible: usize,
    pub memtable_keys: usize,
    pub sstable_count: usize,
    /// `(table id, entry count)` for every live SSTable, youngest first.
    pub sstable_entry_counts: Vec<(u64, usize)>,
    /// Size in bytes of the active memtable's write-ahead log.
    pub wal_size_bytes: u64,
    /// Wall-clock nanoseconds of the last flush, if one has happened.
    pub last_flush_at: Option<u64>,
    /// Wall-clock nanoseconds of the last compaction, if one has happened.
    pub last_compaction_at: Option<u64>,
}

struct EngineInner {
    data_dir: PathBuf,
    sstable_dir: PathBuf,
    memtable: Memtable,
    catalog: Catalog,
    tables: Vec<Arc<SSTable>>,
    last_flush_at: Option<u64>,
    last_compaction_at: Option<u64>,
}

/// A handle to an open store. Cheaply `Clone`-able; every clone shares
/// the same underlying state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
}

impl Engine {
    /// Open (or create) a store rooted at `data_dir`, replaying the WAL
    /// and catalog to rebuild in-memory state, and sweeping any SSTable
    /// files on disk that the catalog does not list as live.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::open_with_config(data_dir, EngineConfig::default())
    }

    pub fn open_with_config(
        data_dir: impl AsRef<Path>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        let sstable_dir = data_dir.join(&config.sstable_dir);
        std::fs::create_dir_all(&sstable_dir)?;

        let memtable = Memtable::open_with_max_record_size(
            data_dir.join("active.wal"),
            config.wal_max_record_size,
        )?;
        let catalog =
            Catalog::open_with_max_record_size(&data_dir, config.wal_max_record_size)?;

        let mut tables = Vec::new();
        for entry in catalog.list() {
            match SSTable::open(&entry.path) {
                Ok(table) => tables.push(Arc::new(table)),
                Err(e) => {
                    tracing::warn!(
                        id = entry.id,
                        path = %entry.path.display(),
                        %e,
                        "dropping catalog entry for unreadable sstable"
                    );
                    catalog.delete(entry.id)?;
                }
            }
        }

        // On-disk sequence numbers already committed to SSTables must
        // never be outrun by a fresh memtable write after a restart.
        let max_table_seq = tables
            .iter()
            .flat_map(|t| t.iter().map(|e| e.sequence_no))
            .max();
        if let Some(max_seq) = max_table_seq {
            memtable.ensure_next_sequence_at_least(max_seq + 1);
        }

        sweep_orphans(&sstable_dir, &catalog)?;

        info!(
            sstables = tables.len(),
            memtable_keys = memtable.len(),
            "engine opened"
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(EngineInner {
                data_dir,
                sstable_dir,
                memtable,
                catalog,
                tables,
                last_flush_at: None,
                last_compaction_at: None,
            })),
        })
    }

    /// Insert or overwrite `key`. Flushes the active memtable inline if
    /// it was already full and `key` is new, so this call is durable
    /// (WAL-acknowledged) before it returns.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("key must not be empty".into()));
        }
        let inner = self.inner.write().unwrap();
        match inner.memtable.put(key.clone(), value.clone()) {
            Ok(()) => Ok(()),
            Err(MemtableError::Full(_)) => {
                drop(inner);
                self.flush_and_compact()?;
                let inner = self.inner.write().unwrap();
                inner.memtable.put(key, value)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a tombstone for `key`, with the same inline-flush behavior
    /// as [`Engine::put`].
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("key must not be empty".into()));
        }
        let inner = self.inner.write().unwrap();
        match inner.memtable.delete(key.clone()) {
            Ok(()) => Ok(()),
            Err(MemtableError::Full(_)) => {
                drop(inner);
                self.flush_and_compact()?;
                let inner = self.inner.write().unwrap();
                inner.memtable.delete(key)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply every `(key, value)` pair via [`Engine::put`], in order, with
    /// no atomicity guarantee across the batch.
    pub fn batch_put(
        &self,
        entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<(), EngineError> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Look up the current value for `key`: memtable first, then
    /// SSTables from youngest to oldest.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let inner = self.inner.read().unwrap();
        if let Some(value) = inner.memtable.get(key) {
            return Ok(match value {
                EntryValue::Live(v) => Some(v),
                EntryValue::Tombstone => None,
            });
        }
        for table in &inner.tables {
            if table.min_key() > key || table.max_key() < key {
                continue;
            }
            if let Some(entry) = table.get(key) {
                return Ok(match entry.value {
                    EntryValue::Live(v) => Some(v),
                    EntryValue::Tombstone => None,
                });
            }
        }
        Ok(None)
    }

    /// Inclusive `[low, high]` range scan, merging the memtable and every
    /// SSTable, newest version wins, tombstones suppressed.
    pub fn range(&self, low: &[u8], high: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        if low > high {
            return Err(EngineError::InvalidArgument(
                "range low bound must not exceed high bound".into(),
            ));
        }
        let inner = self.inner.read().unwrap();

        let mut candidates: Vec<SstEntry> = inner
            .memtable
            .snapshot()
            .into_iter()
            .filter(|(k, _)| k.as_slice() >= low && k.as_slice() <= high)
            .map(|(key, e)| SstEntry {
                key,
                value: e.value,
                sequence_no: e.sequence_no,
                timestamp: e.timestamp,
            })
            .collect();

        for table in &inner.tables {
            if table.max_key() < low || table.min_key() > high {
                continue;
            }
            candidates.extend(table.range(low, high));
        }

        Ok(sort_dedup_live(candidates)
            .into_iter()
            .map(|e| {
                let value = match e.value {
                    EntryValue::Live(v) => v,
                    EntryValue::Tombstone => unreachable!("sort_dedup_live drops tombstones"),
                };
                (e.key, value)
            })
            .collect())
    }

    /// Force-flush the active memtable to a new SSTable, even if it is
    /// not full. A no-op if the memtable is empty.
    pub fn force_flush(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().unwrap();
        flush_locked(&mut inner)
    }

    /// Force a compact-all round regardless of the table-count trigger.
    pub fn force_compact(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().unwrap();
        if inner.tables.len() < 2 {
            return Ok(());
        }
        let tables = inner.tables.clone();
        compaction::compact_tables(&inner.catalog, &inner.sstable_dir, &tables)?;
        reload_tables(&mut inner)?;
        inner.last_compaction_at = Some(now_nanos());
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.inner.read().unwrap();
        let wal_size_bytes = std::fs::metadata(inner.memtable.wal_path())
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(EngineStats {
            total_keys_visible: visible_key_count(&inner),
            memtable_keys: inner.memtable.len(),
            sstable_count: inner.tables.len(),
            sstable_entry_counts: inner.tables.iter().map(|t| (t.id, t.len())).collect(),
            wal_size_bytes,
            last_flush_at: inner.last_flush_at,
            last_compaction_at: inner.last_compaction_at,
        })
    }

    /// Flush whatever the active memtable holds, then run a compaction
    /// round if the catalog has accumulated enough tables.
    fn flush_and_compact(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().unwrap();
        flush_locked(&mut inner)?;
        let tables = inner.tables.clone();
        let ran = compaction::compact_all(&inner.catalog, &inner.sstable_dir, &tables)?;
        if ran {
            reload_tables(&mut inner)?;
            inner.last_compaction_at = Some(now_nanos());
        }
        Ok(())
    }

    pub fn close(self) -> Result<(), EngineError> {
        self.force_flush()
    }
}

fn flush_locked(inner: &mut EngineInner) -> Result<(), EngineError> {
    if inner.memtable.is_empty() {
        return Ok(());
    }
    let drained = inner.memtable.drain_sorted()?;
    let entries: Vec<SstEntry> = drained
        .into_iter()
        .map(|(key, e)| SstEntry {
            key,
            value: e.value,
            sequence_no: e.sequence_no,
            timestamp: e.timestamp,
        })
        .collect();

    for chunk in entries.chunks(crate::sstable::SSTABLE_CAPACITY) {
        let id = inner.catalog.allocate_id()?;
        let path = inner.sstable_dir.join(format!("{id:06}.sst"));
        SSTable::write(&path, id, chunk.to_vec())?;
        inner.catalog.add(id, path)?;
    }

    debug!(entries = entries.len(), "memtable flushed to sstable");
    reload_tables(inner)?;
    inner.last_flush_at = Some(now_nanos());
    Ok(())
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Sort candidates by `(key ASC, sequence_no DESC)`, keep only the
/// newest version of each key, and drop tombstones — the shared
/// resolution step behind both `range()` and `stats()`'s visible-key
/// count.
fn sort_dedup_live(mut candidates: Vec<SstEntry>) -> Vec<SstEntry> {
    candidates.sort_by(|a, b| match a.key.cmp(&b.key) {
        std::cmp::Ordering::Equal => b.sequence_no.cmp(&a.sequence_no),
        ord => ord,
    });

    let mut results = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;
    for entry in candidates {
        if last_key.as_ref() == Some(&entry.key) {
            continue;
        }
        last_key = Some(entry.key.clone());
        if let EntryValue::Live(_) = entry.value {
            results.push(entry);
        }
    }
    results
}

/// Full-keyspace equivalent of `range()`'s merge, used only for the
/// `total_keys_visible` stat.
fn visible_key_count(inner: &EngineInner) -> usize {
    let mut candidates: Vec<SstEntry> = inner
        .memtable
        .snapshot()
        .into_iter()
        .map(|(key, e)| SstEntry {
            key,
            value: e.value,
            sequence_no: e.sequence_no,
            timestamp: e.timestamp,
        })
        .collect();

    for table in &inner.tables {
        candidates.extend(table.iter().cloned());
    }

    sort_dedup_live(candidates).len()
}

/// Rebuild the in-memory table list from the catalog after a mutation
/// (flush or compaction). Requires the write lock.
fn reload_tables(inner: &mut EngineInner) -> Result<(), EngineError> {
    let mut tables = Vec::new();
    for entry in inner.catalog.list() {
        tables.push(Arc::new(SSTable::open(&entry.path)?));
    }
    inner.tables = tables;
    Ok(())
}

/// Delete any `*.sst` file in `sstable_dir` that the catalog does not
/// list as live — the remnant of a crash between writing a table and
/// committing it to the catalog.
fn sweep_orphans(sstable_dir: &Path, catalog: &Catalog) -> Result<(), EngineError> {
    let live: std::collections::HashSet<PathBuf> =
        catalog.list().into_iter().map(|e| e.path).collect();

    let Ok(read_dir) = std::fs::read_dir(sstable_dir) else {
        return Ok(());
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sst") && !live.contains(&path) {
            tracing::warn!(path = %path.display(), "removing orphaned sstable file");
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}
