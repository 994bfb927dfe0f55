use std::io::{Seek, SeekFrom, Write};

use tempfile::tempdir;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rec(Vec<u8>);

impl Encode for Rec {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)
    }
}

impl Decode for Rec {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, n) = Vec::<u8>::decode_from(buf)?;
        Ok((Rec(bytes), n))
    }
}

#[test]
fn append_and_replay_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let wal = Wal::<Rec>::open(&path).unwrap();
    wal.append(&Rec(b"one".to_vec())).unwrap();
    wal.append(&Rec(b"two".to_vec())).unwrap();
    wal.append(&Rec(b"three".to_vec())).unwrap();

    let records = wal.replay().unwrap();
    assert_eq!(
        records,
        vec![
            Rec(b"one".to_vec()),
            Rec(b"two".to_vec()),
            Rec(b"three".to_vec()),
        ]
    );
}

#[test]
fn reopen_preserves_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");

    {
        let wal = Wal::<Rec>::open(&path).unwrap();
        wal.append(&Rec(b"a".to_vec())).unwrap();
        wal.append(&Rec(b"b".to_vec())).unwrap();
    }

    let wal = Wal::<Rec>::open(&path).unwrap();
    let records = wal.replay().unwrap();
    assert_eq!(records, vec![Rec(b"a".to_vec()), Rec(b"b".to_vec())]);
}

#[test]
fn truncate_empties_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let wal = Wal::<Rec>::open(&path).unwrap();
    wal.append(&Rec(b"a".to_vec())).unwrap();
    wal.truncate().unwrap();
    wal.append(&Rec(b"b".to_vec())).unwrap();

    assert_eq!(wal.replay().unwrap(), vec![Rec(b"b".to_vec())]);
}

#[test]
fn torn_tail_record_is_silently_dropped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let wal = Wal::<Rec>::open(&path).unwrap();
    wal.append(&Rec(b"good".to_vec())).unwrap();
    drop(wal);

    // Simulate a crash mid-append: chop off the last few bytes of the
    // second record after appending it.
    let wal = Wal::<Rec>::open(&path).unwrap();
    wal.append(&Rec(b"partial-record-body".to_vec())).unwrap();
    drop(wal);

    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();

    let wal = Wal::<Rec>::open(&path).unwrap();
    let records = wal.replay().unwrap();
    assert_eq!(records, vec![Rec(b"good".to_vec())]);
}

#[test]
fn checksum_mismatch_on_complete_record_is_a_hard_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let wal = Wal::<Rec>::open(&path).unwrap();
    wal.append(&Rec(b"good".to_vec())).unwrap();
    wal.append(&Rec(b"also-good".to_vec())).unwrap();
    drop(wal);

    // Flip a byte inside the first record's payload without touching
    // its length prefix — this keeps the frame "complete" but wrong.
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    // header (14 bytes) + len prefix (4 bytes) lands us inside the
    // encoded Vec<u8> length+payload of the first record.
    file.seek(SeekFrom::Start(14 + 4 + 4)).unwrap();
    file.write_all(&[0xFF]).unwrap();

    let wal = Wal::<Rec>::open(&path).unwrap();
    let err = wal.replay().unwrap_err();
    assert!(matches!(err, WalError::ChecksumMismatch { .. }));
}
