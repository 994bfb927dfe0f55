//! In-memory write buffer with a write-ahead log for crash recovery.
//!
//! Every key holds exactly one live version: the most recent mutation
//! replaces whatever was there before. A fixed number of distinct keys
//! (not bytes) may be buffered before the memtable must be flushed to an
//! SSTable — overwriting an existing key never moves it closer to that
//! limit.


use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

/// Maximum number of distinct keys a memtable may hold before it must be
/// flushed.
pub const MEMTABLE_CAPACITY: usize = 30;

#[derive(Debug, Error)]
pub enum MemtableError {
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    #[error("memtable is full ({0} distinct keys); flush before writing more")]
    Full(usize),

    #[error("key must not be empty")]
    EmptyKey,
}

/// One versioned value held in the memtable: either live data, or a
/// tombstone recording that the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    Live(Vec<u8>),
    Tombstone,
}

/// A single key's current state, with the ordering metadata needed to
/// resolve it against older SSTable versions during reads and compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: EntryValue,
    /// Monotonic write sequence number; the sole ordering source. Used
    /// to pick the winner when the same key appears in several SSTables.
    pub sequence_no: u64,
    /// Wall-clock nanoseconds since the UNIX epoch, carried for
    /// diagnostics only — never used to order writes.
    pub timestamp: u64,
}

/// The record appended to the write-ahead log for each mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableRecord {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        sequence_no: u64,
        timestamp: u64,
    },
    Delete {
        key: Vec<u8>,
        sequence_no: u64,
        timestamp: u64,
    },
}

impl Encode for MemtableRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            MemtableRecord::Put {
                key,
                value,
                sequence_no,
                timestamp,
            } => {
                0u32.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
                sequence_no.encode_to(buf)?;
                timestamp.encode_to(buf)?;
            }
            MemtableRecord::Delete {
                key,
                sequence_no,
                timestamp,
            } => {
                1u32.encode_to(buf)?;
                key.encode_to(buf)?;
                sequence_no.encode_to(buf)?;
                timestamp.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for MemtableRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (sequence_no, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (timestamp, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((
                    MemtableRecord::Put {
                        key,
                        value,
                        sequence_no,
                        timestamp,
                    },
                    offset,
                ))
            }
            1 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (sequence_no, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (timestamp, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((
                    MemtableRecord::Delete {
                        key,
                        sequence_no,
                        timestamp,
                    },
                    offset,
                ))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other,
                type_name: "MemtableRecord",
            }),
        }
    }
}

/// An in-memory sorted buffer of pending mutations, backed by a WAL.
pub struct Memtable {
    tree: RwLock<BTreeMap<Vec<u8>, Entry>>,
    wal: Wal<MemtableRecord>,
    next_sequence_no: AtomicU64,
}

impl Memtable {
    /// Open (or create) the memtable's WAL and replay it to rebuild
    /// state, using the WAL's default record-size cap.
    pub fn open(wal_path: impl AsRef<Path>) -> Result<Self, MemtableError> {
        Self::open_with_max_record_size(wal_path, crate::wal::DEFAULT_MAX_RECORD_SIZE)
    }

    /// Same as [`Memtable::open`], but caps a freshly created WAL's
    /// record size at `max_record_size`.
    pub fn open_with_max_record_size(
        wal_path: impl AsRef<Path>,
        max_record_size: u32,
    ) -> Result<Self, MemtableError> {
        let wal = Wal::open_with_max_record_size(wal_path, max_record_size)?;
        let mut tree = BTreeMap::new();
        let mut max_seq = 0u64;

        for record in wal.replay()? {
            match record {
                MemtableRecord::Put {
                    key,
                    value,
                    sequence_no,
                    timestamp,
                } => {
                    max_seq = max_seq.max(sequence_no);
                    tree.insert(
                        key,
                        Entry {
                            value: EntryValue::Live(value),
                            sequence_no,
                            timestamp,
                        },
                    );
                }
                MemtableRecord::Delete {
                    key,
                    sequence_no,
                    timestamp,
                } => {
                    max_seq = max_seq.max(sequence_no);
                    tree.insert(
                        key,
                        Entry {
                            value: EntryValue::Tombstone,
                            sequence_no,
                            timestamp,
                        },
                    );
                }
            }
        }

        debug!(keys = tree.len(), max_seq, "memtable replayed from wal");

        Ok(Self {
            tree: RwLock::new(tree),
            wal,
            next_sequence_no: AtomicU64::new(max_seq + 1),
        })
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence_no.fetch_add(1, Ordering::SeqCst)
    }

    /// Raise the next assigned sequence number to at least `min`, without
    /// ever lowering it. Called once at startup after loading on-disk
    /// SSTables, so a fresh write can never tie or lose against a
    /// sequence number already committed to disk.
    pub fn ensure_next_sequence_at_least(&self, min: u64) {
        self.next_sequence_no.fetch_max(min, Ordering::SeqCst);
    }

    fn now_nanos() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Insert or overwrite a key. Logged to the WAL before the in-memory
    /// map is touched.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MemtableError> {
        if key.is_empty() {
            return Err(MemtableError::EmptyKey);
        }
        if self.is_full() && !self.tree.read().unwrap().contains_key(&key) {
            return Err(MemtableError::Full(self.len()));
        }

        let sequence_no = self.next_sequence();
        let timestamp = Self::now_nanos();
        self.wal.append(&MemtableRecord::Put {
            key: key.clone(),
            value: value.clone(),
            sequence_no,
            timestamp,
        })?;

        self.tree.write().unwrap().insert(
            key,
            Entry {
                value: EntryValue::Live(value),
                sequence_no,
                timestamp,
            },
        );
        Ok(())
    }

    /// Record a tombstone for `key`. Logged to the WAL before the
    /// in-memory map is touched.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), MemtableError> {
        if key.is_empty() {
            return Err(MemtableError::EmptyKey);
        }
        if self.is_full() && !self.tree.read().unwrap().contains_key(&key) {
            return Err(MemtableError::Full(self.len()));
        }

        let sequence_no = self.next_sequence();
        let timestamp = Self::now_nanos();
        self.wal.append(&MemtableRecord::Delete {
            key: key.clone(),
            sequence_no,
            timestamp,
        })?;

        self.tree.write().unwrap().insert(
            key,
            Entry {
                value: EntryValue::Tombstone,
                sequence_no,
                timestamp,
            },
        );
        Ok(())
    }

    /// Look up the current value for `key`, resolving tombstones to `None`.
    pub fn get(&self, key: &[u8]) -> Option<EntryValue> {
        self.tree.read().unwrap().get(key).map(|e| e.value.clone())
    }

    /// Number of distinct keys currently buffered.
    pub fn len(&self) -> usize {
        self.tree.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`MEMTABLE_CAPACITY`] distinct keys are buffered; the
    /// caller must flush before any further *new* key can be accepted.
    pub fn is_full(&self) -> bool {
        self.len() >= MEMTABLE_CAPACITY
    }

    /// Drain the memtable into an ascending `(key, Entry)` list for
    /// flushing to an SSTable, and truncate the WAL. After this call the
    /// memtable is empty and ready to accept new writes.
    pub fn drain_sorted(&self) -> Result<Vec<(Vec<u8>, Entry)>, MemtableError> {
        let mut tree = self.tree.write().unwrap();
        let drained: Vec<_> = std::mem::take(&mut *tree).into_iter().collect();
        drop(tree);
        self.wal.truncate()?;
        Ok(drained)
    }

    /// Path of the backing write-ahead log, for stats/diagnostics.
    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    /// Non-mutating ascending snapshot of everything currently buffered,
    /// used by range scans.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Entry)> {
        self.tree
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
