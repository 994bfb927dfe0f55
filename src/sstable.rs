//! Immutable, sorted, on-disk tables.
//!
//! An SSTable is a flushed or compacted snapshot of a key range: at most
//! [`SSTABLE_CAPACITY`] entries, written once, never mutated in place.
//! Point lookups binary-search the in-memory entry list; range scans
//! slice it. Atomicity on write comes from the usual temp-file-then-
//! rename dance.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};
use crate::memtable::{Entry, EntryValue};

/// Maximum number of entries a single SSTable may hold.
pub const SSTABLE_CAPACITY: usize = 30;

const SST_MAGIC: [u8; 4] = *b"ASST";
const SST_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum SstableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("bad sstable magic")]
    BadMagic,

    #[error("unsupported sstable version {0}")]
    UnsupportedVersion(u16),

    #[error("sstable checksum mismatch")]
    ChecksumMismatch,

    #[error("cannot build an sstable from zero entries")]
    Empty,

    #[error("sstable would hold {0} entries, exceeding capacity {SSTABLE_CAPACITY}")]
    TooManyEntries(usize),
}

/// A single on-disk entry: key plus the same versioned value/metadata the
/// memtable holds for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstEntry {
    pub key: Vec<u8>,
    pub value: EntryValue,
    pub sequence_no: u64,
    pub timestamp: u64,
}

impl Encode for SstEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        match &self.value {
            EntryValue::Live(v) => {
                true.encode_to(buf)?;
                v.encode_to(buf)?;
            }
            EntryValue::Tombstone => {
                false.encode_to(buf)?;
            }
        }
        self.sequence_no.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SstEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, mut offset) = Vec::<u8>::decode_from(buf)?;
        let (is_live, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let value = if is_live {
            let (v, n) = Vec::<u8>::decode_from(&buf[offset..])?;
            offset += n;
            EntryValue::Live(v)
        } else {
            EntryValue::Tombstone
        };
        let (sequence_no, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            SstEntry {
                key,
                value,
                sequence_no,
                timestamp,
            },
            offset,
        ))
    }
}

/// Metadata describing an SSTable without holding its entries in memory.
#[derive(Debug, Clone)]
pub struct SstProperties {
    pub id: u64,
    pub count: usize,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub created_at: u64,
}

/// A loaded, immutable on-disk table.
pub struct SSTable {
    pub path: PathBuf,
    pub id: u64,
    pub created_at: u64,
    entries: Vec<SstEntry>,
}

impl SSTable {
    /// Write a new SSTable to `path` from an ascending, deduplicated
    /// iterator of entries, atomically (temp file + rename).
    pub fn write(
        path: impl AsRef<Path>,
        id: u64,
        entries: impl IntoIterator<Item = SstEntry>,
    ) -> Result<SstProperties, SstableError> {
        let entries: Vec<SstEntry> = entries.into_iter().collect();
        if entries.is_empty() {
            return Err(SstableError::Empty);
        }
        if entries.len() > SSTABLE_CAPACITY {
            return Err(SstableError::TooManyEntries(entries.len()));
        }

        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let min_key = entries[0].key.clone();
        let max_key = entries[entries.len() - 1].key.clone();

        let mut body = Vec::new();
        id.encode_to(&mut body)?;
        created_at.encode_to(&mut body)?;
        encode_vec(&entries, &mut body)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("sst.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&SST_MAGIC)?;
            writer.write_all(&SST_VERSION.to_le_bytes())?;
            writer.write_all(&(body.len() as u64).to_le_bytes())?;
            writer.write_all(&body)?;
            writer.write_all(&crc.to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        Ok(SstProperties {
            id,
            count: entries.len(),
            min_key,
            max_key,
            created_at,
        })
    }

    /// Load an SSTable's entries fully into memory (at most
    /// [`SSTABLE_CAPACITY`] entries, so this is cheap).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstableError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != SST_MAGIC {
            return Err(SstableError::BadMagic);
        }
        let mut version_bytes = [0u8; 2];
        file.read_exact(&mut version_bytes)?;
        let version = u16::from_le_bytes(version_bytes);
        if version != SST_VERSION {
            return Err(SstableError::UnsupportedVersion(version));
        }
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let body_len = u64::from_le_bytes(len_bytes) as usize;

        let mut body = vec![0u8; body_len];
        file.read_exact(&mut body)?;
        let mut crc_bytes = [0u8; 4];
        file.read_exact(&mut crc_bytes)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return Err(SstableError::ChecksumMismatch);
        }

        let (id, mut offset) = u64::decode_from(&body)?;
        let (created_at, n) = u64::decode_from(&body[offset..])?;
        offset += n;
        let (entries, _) = decode_vec::<SstEntry>(&body[offset..])?;

        Ok(Self {
            path,
            id,
            created_at,
            entries,
        })
    }

    pub fn properties(&self) -> SstProperties {
        SstProperties {
            id: self.id,
            count: self.entries.len(),
            min_key: self.entries.first().map(|e| e.key.clone()).unwrap_or_default(),
            max_key: self.entries.last().map(|e| e.key.clone()).unwrap_or_default(),
            created_at: self.created_at,
        }
    }

    pub fn min_key(&self) -> &[u8] {
        &self.entries[0].key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.entries[self.entries.len() - 1].key
    }

    /// Binary-search point lookup.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
            .map(|idx| {
                let e = &self.entries[idx];
                Entry {
                    value: e.value.clone(),
                    sequence_no: e.sequence_no,
                    timestamp: e.timestamp,
                }
            })
    }

    /// Inclusive-bounds range scan over this table's entries.
    pub fn range(&self, low: &[u8], high: &[u8]) -> Vec<SstEntry> {
        let start = self.entries.partition_point(|e| e.key.as_slice() < low);
        let end = self.entries.partition_point(|e| e.key.as_slice() <= high);
        self.entries[start..end].to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SstEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
