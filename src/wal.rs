//! Generic, CRC-protected write-ahead log for crash recovery.
//!
//! Every mutation accepted by the engine is appended here and fsynced
//! before the call returns, so an acknowledged write survives a crash.
//! On restart the engine replays the log to rebuild its in-memory state.
//!
//! # On-disk format
//!
//! ```text
//! [header: magic(4) version(2) max_record_size(4) header_crc(4)]
//! [record]...
//! ```
//!
//! Each record is framed as `[len: u32 LE][payload][crc32: u32 LE]`, with
//! the checksum computed over `len || payload`. A record is never split
//! across a crash boundary: either the whole frame lands on disk before
//! the next `fsync`, or it doesn't exist as far as replay is concerned.

#[cfg(test)]
mod tests;

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{Decode, Encode, EncodingError, decode_from_slice, encode_to_vec};

const WAL_MAGIC: [u8; 4] = *b"AWAL";
const WAL_VERSION: u16 = 1;
const HEADER_LEN: u64 = 4 + 2 + 4 + 4; // magic + version + max_record_size + crc

/// Default cap on a single WAL record, used unless a caller configures
/// a different limit via [`Wal::open_with_max_record_size`].
pub const DEFAULT_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("bad WAL header magic")]
    BadMagic,

    #[error("unsupported WAL version {0}")]
    UnsupportedVersion(u16),

    #[error("WAL header checksum mismatch")]
    HeaderChecksumMismatch,

    #[error("record checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("record of {len} bytes exceeds max_record_size ({max})")]
    RecordTooLarge { len: u32, max: u32 },
}

/// Values that can be appended to a [`Wal`].
pub trait WalData: Encode + Decode + Debug + Send + Sync {}
impl<T: Encode + Decode + Debug + Send + Sync> WalData for T {}

#[derive(Debug, Clone, Copy)]
struct WalHeader {
    version: u16,
    max_record_size: u32,
}

impl WalHeader {
    fn write_to(&self, file: &mut File) -> Result<(), WalError> {
        let mut body = Vec::with_capacity(HEADER_LEN as usize - 4);
        body.extend_from_slice(&WAL_MAGIC);
        body.extend_from_slice(&self.version.to_le_bytes());
        body.extend_from_slice(&self.max_record_size.to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        file.write_all(&body)?;
        file.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    fn read_from(file: &mut File) -> Result<Self, WalError> {
        let mut body = [0u8; (HEADER_LEN - 4) as usize];
        file.read_exact(&mut body)?;
        let mut crc_bytes = [0u8; 4];
        file.read_exact(&mut crc_bytes)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return Err(WalError::HeaderChecksumMismatch);
        }

        if body[0..4] != WAL_MAGIC {
            return Err(WalError::BadMagic);
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version != WAL_VERSION {
            return Err(WalError::UnsupportedVersion(version));
        }
        let max_record_size = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);

        Ok(Self {
            version,
            max_record_size,
        })
    }
}

/// An append-only, checksummed, fsync-on-write log of `T` records.
pub struct Wal<T: WalData> {
    path: PathBuf,
    inner_file: Arc<Mutex<File>>,
    header: WalHeader,
    _marker: std::marker::PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Open an existing WAL or create a new one with a fresh header,
    /// using [`DEFAULT_MAX_RECORD_SIZE`] for a newly created log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        Self::open_with_max_record_size(path, DEFAULT_MAX_RECORD_SIZE)
    }

    /// Open an existing WAL or create a new one, capping a freshly
    /// created log's records at `max_record_size`. An existing log keeps
    /// whatever limit its header already stores.
    pub fn open_with_max_record_size(
        path: impl AsRef<Path>,
        max_record_size: u32,
    ) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let header = if existed && file.metadata()?.len() >= HEADER_LEN {
            file.seek(SeekFrom::Start(0))?;
            let header = WalHeader::read_from(&mut file)?;
            file.seek(SeekFrom::End(0))?;
            header
        } else {
            let header = WalHeader {
                version: WAL_VERSION,
                max_record_size,
            };
            header.write_to(&mut file)?;
            file.sync_all()?;
            header
        };

        Ok(Self {
            path,
            inner_file: Arc::new(Mutex::new(file)),
            header,
            _marker: std::marker::PhantomData,
        })
    }

    /// Append a record and fsync before returning. A crash after this call
    /// returns has the record durably on disk.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let payload = encode_to_vec(record)?;
        let len = payload.len() as u32;
        if len > self.header.max_record_size {
            return Err(WalError::RecordTooLarge {
                len,
                max: self.header.max_record_size,
            });
        }

        let mut hasher = Crc32::new();
        hasher.update(&len.to_le_bytes());
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut file = self
            .inner_file
            .lock()
            .expect("wal file mutex poisoned by a panicking writer");
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;

        debug!(bytes = payload.len(), "wal record appended");
        Ok(())
    }

    /// Replay every well-formed record from the start of the log.
    ///
    /// A trailing record that is physically incomplete (a crash mid-append
    /// left a partial length/payload/checksum on disk) is silently
    /// dropped: everything decoded before it is returned. A checksum
    /// mismatch on a *complete* frame is real corruption and is always a
    /// hard error, tail or not — an incomplete append is not the same
    /// thing as a bit flip.
    pub fn replay(&self) -> Result<Vec<T>, WalError> {
        let mut records = Vec::new();
        let mut iter = self.replay_iter()?;
        loop {
            match iter.next() {
                Some(Ok(record)) => records.push(record),
                Some(Err(WalError::Io(e))) if iter.at_tail() => {
                    debug!(
                        offset = iter.last_offset(),
                        %e,
                        "dropping torn wal tail record"
                    );
                    break;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(records)
    }

    /// Low-level iterator over raw replay results, one per record.
    /// Unlike [`Wal::replay`], corruption is surfaced as `Err` rather than
    /// silently stopping.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        // A cloned fd shares the OS file offset with the writer; open
        // independently instead.
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(WalIter {
            file,
            offset: HEADER_LEN,
            last_offset: HEADER_LEN,
            hit_eof: false,
            _marker: std::marker::PhantomData,
        })
    }

    /// Truncate the log back to an empty (header-only) file, typically
    /// called after the records it holds have been durably flushed
    /// elsewhere.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut file = self
            .inner_file
            .lock()
            .expect("wal file mutex poisoned by a panicking writer");
        file.set_len(HEADER_LEN)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        if let Ok(file) = self.inner_file.lock() {
            let _ = file.sync_all();
        }
    }
}

/// Iterator over raw WAL records, including decode/checksum errors.
pub struct WalIter<T: WalData> {
    file: File,
    offset: u64,
    last_offset: u64,
    hit_eof: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T: WalData> WalIter<T> {
    /// True once the iterator has reached (or attempted to read past) the
    /// physical end of the file — used by [`Wal::replay`] to decide
    /// whether a trailing error is a torn write or real corruption.
    pub fn at_tail(&self) -> bool {
        self.hit_eof
    }

    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    fn read_one(&mut self) -> Result<Option<T>, WalError> {
        self.last_offset = self.offset;

        let mut len_bytes = [0u8; 4];
        match self.file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.hit_eof = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes);

        let mut payload = vec![0u8; len as usize];
        if let Err(e) = self.file.read_exact(&mut payload) {
            self.hit_eof = true;
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(WalError::Io(e));
            }
            return Err(e.into());
        }

        let mut crc_bytes = [0u8; 4];
        if let Err(e) = self.file.read_exact(&mut crc_bytes) {
            self.hit_eof = true;
            return Err(e.into());
        }

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            self.hit_eof = true;
            return Err(WalError::ChecksumMismatch {
                offset: self.offset,
            });
        }

        self.offset += 4 + len as u64 + 4;
        let (record, _) = decode_from_slice::<T>(&payload)?;
        Ok(Some(record))
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_one() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
