//! Catalog of live SSTables.
//!
//! The catalog is the store's source of truth for which SSTable files on
//! disk are actually live. It is durable via the same write-ahead-log +
//! periodic-snapshot pattern used elsewhere in the crate: every mutation
//! (`add`, `remove`, or an atomic `replace` for compaction) is appended
//! to a small manifest WAL before being applied in memory, and a
//! checksummed snapshot lets `open()` skip replaying the WAL from
//! scratch on every restart.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("snapshot checksum mismatch")]
    SnapshotChecksumMismatch,
}

/// One live SSTable as tracked by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: u64,
    pub path: PathBuf,
}

impl Encode for CatalogEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.path.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for CatalogEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (id, mut offset) = u64::decode_from(buf)?;
        let (path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;
        Ok((CatalogEntry { id, path }, offset))
    }
}

/// Events appended to the manifest WAL. Applying the same event twice is
/// a no-op in effect, so replaying the WAL after a crash is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CatalogEvent {
    Add(CatalogEntry),
    Remove(u64),
    /// Atomic compaction swap: add the listed tables, remove the listed ids.
    Replace {
        added: Vec<CatalogEntry>,
        removed: Vec<u64>,
    },
    AllocateId(u64),
}

impl Encode for CatalogEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            CatalogEvent::Add(entry) => {
                0u32.encode_to(buf)?;
                entry.encode_to(buf)?;
            }
            CatalogEvent::Remove(id) => {
                1u32.encode_to(buf)?;
                id.encode_to(buf)?;
            }
            CatalogEvent::Replace { added, removed } => {
                2u32.encode_to(buf)?;
                encode_vec(added, buf)?;
                encode_vec(removed, buf)?;
            }
            CatalogEvent::AllocateId(id) => {
                3u32.encode_to(buf)?;
                id.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for CatalogEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => {
                let (entry, n) = CatalogEntry::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::Add(entry), offset))
            }
            1 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::Remove(id), offset))
            }
            2 => {
                let (added, n) = decode_vec::<CatalogEntry>(&buf[offset..])?;
                offset += n;
                let (removed, n) = decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::Replace { added, removed }, offset))
            }
            3 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((CatalogEvent::AllocateId(id), offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other,
                type_name: "CatalogEvent",
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CatalogData {
    next_id: u64,
    sstables: Vec<CatalogEntry>,
}

impl CatalogData {
    fn apply(&mut self, event: &CatalogEvent) {
        match event {
            CatalogEvent::Add(entry) => {
                if !self.sstables.iter().any(|e| e.id == entry.id) {
                    self.sstables.push(entry.clone());
                }
                self.next_id = self.next_id.max(entry.id + 1);
            }
            CatalogEvent::Remove(id) => {
                self.sstables.retain(|e| e.id != *id);
            }
            CatalogEvent::Replace { added, removed } => {
                self.sstables.retain(|e| !removed.contains(&e.id));
                for entry in added {
                    if !self.sstables.iter().any(|e| e.id == entry.id) {
                        self.sstables.push(entry.clone());
                    }
                    self.next_id = self.next_id.max(entry.id + 1);
                }
            }
            CatalogEvent::AllocateId(id) => {
                self.next_id = self.next_id.max(*id + 1);
            }
        }
    }
}

impl Encode for CatalogData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.next_id.encode_to(buf)?;
        encode_vec(&self.sstables, buf)?;
        Ok(())
    }
}

impl Decode for CatalogData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (next_id, mut offset) = u64::decode_from(buf)?;
        let (sstables, n) = decode_vec::<CatalogEntry>(&buf[offset..])?;
        offset += n;
        Ok((CatalogData { next_id, sstables }, offset))
    }
}

/// Durable catalog of live SSTables: a manifest WAL plus periodic
/// checksummed snapshot.
pub struct Catalog {
    snapshot_path: PathBuf,
    wal: Wal<CatalogEvent>,
    data: Mutex<CatalogData>,
}

impl Catalog {
    /// Load the catalog, preferring the snapshot and replaying whatever
    /// manifest WAL records were appended after it. Falls back to a full
    /// WAL replay if the snapshot is missing or corrupt.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::open_with_max_record_size(dir, crate::wal::DEFAULT_MAX_RECORD_SIZE)
    }

    /// Same as [`Catalog::open`], but caps a freshly created manifest
    /// WAL's record size at `max_record_size`.
    pub fn open_with_max_record_size(
        dir: impl AsRef<Path>,
        max_record_size: u32,
    ) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let snapshot_path = dir.join("MANIFEST.snapshot");
        let wal = Wal::open_with_max_record_size(dir.join("MANIFEST.wal"), max_record_size)?;

        let mut data = match Self::load_snapshot(&snapshot_path) {
            Ok(Some(data)) => data,
            Ok(None) => CatalogData::default(),
            Err(e) => {
                tracing::warn!(%e, "manifest snapshot unreadable, replaying full wal");
                CatalogData::default()
            }
        };

        for event in wal.replay()? {
            data.apply(&event);
        }

        debug!(sstables = data.sstables.len(), next_id = data.next_id, "catalog opened");

        Ok(Self {
            snapshot_path,
            wal,
            data: Mutex::new(data),
        })
    }

    fn load_snapshot(path: &Path) -> Result<Option<CatalogData>, CatalogError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        if bytes.len() < 4 {
            return Ok(None);
        }
        let (crc_bytes, body) = bytes.split_at(4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(CatalogError::SnapshotChecksumMismatch);
        }
        let (data, _) = CatalogData::decode_from(body)?;
        Ok(Some(data))
    }

    /// Allocate the next monotonic SSTable id.
    pub fn allocate_id(&self) -> Result<u64, CatalogError> {
        let mut data = self.data.lock().unwrap();
        let id = data.next_id;
        self.wal.append(&CatalogEvent::AllocateId(id))?;
        data.apply(&CatalogEvent::AllocateId(id));
        Ok(id)
    }

    /// Register a newly-flushed SSTable.
    pub fn add(&self, id: u64, path: PathBuf) -> Result<(), CatalogError> {
        let entry = CatalogEntry { id, path };
        let event = CatalogEvent::Add(entry);
        self.wal.append(&event)?;
        self.data.lock().unwrap().apply(&event);
        Ok(())
    }

    /// Remove a single table, outside the atomic `replace` swap — used
    /// when a catalog-listed table turns out to be unreadable and must
    /// be retired on its own.
    pub fn delete(&self, id: u64) -> Result<(), CatalogError> {
        let event = CatalogEvent::Remove(id);
        self.wal.append(&event)?;
        self.data.lock().unwrap().apply(&event);
        Ok(())
    }

    /// Atomically swap `removed` ids for `added` tables (compaction commit).
    pub fn replace(&self, added: Vec<CatalogEntry>, removed: Vec<u64>) -> Result<(), CatalogError> {
        let event = CatalogEvent::Replace { added, removed };
        self.wal.append(&event)?;
        self.data.lock().unwrap().apply(&event);
        self.checkpoint()?;
        Ok(())
    }

    /// List live SSTables, youngest (highest id) first.
    pub fn list(&self) -> Vec<CatalogEntry> {
        let mut entries = self.data.lock().unwrap().sstables.clone();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries
    }

    /// Write a fresh checksummed snapshot and truncate the manifest WAL,
    /// so the next `open()` need not replay history from the beginning.
    pub fn checkpoint(&self) -> Result<(), CatalogError> {
        let data = self.data.lock().unwrap().clone();
        let mut body = Vec::new();
        data.encode_to(&mut body)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let tmp_path = self.snapshot_path.with_extension("snapshot.tmp");
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);
        std::fs::write(&tmp_path, &out)?;
        {
            let f = std::fs::File::open(&tmp_path)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.snapshot_path)?;
        if let Some(parent) = self.snapshot_path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.wal.truncate()?;
        info!(sstables = data.sstables.len(), "catalog checkpointed");
        Ok(())
    }
}
