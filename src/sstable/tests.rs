use tempfile::tempdir;

use crate::memtable::EntryValue;
use crate::sstable::{SSTable, SstEntry, SstableError};

fn entry(key: &str, value: &str, seq: u64) -> SstEntry {
    SstEntry {
        key: key.as_bytes().to_vec(),
        value: EntryValue::Live(value.as_bytes().to_vec()),
        sequence_no: seq,
        timestamp: 0,
    }
}

#[test]
fn write_then_open_round_trips_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.sst");

    SSTable::write(
        &path,
        1,
        vec![entry("a", "1", 1), entry("b", "2", 2), entry("c", "3", 3)],
    )
    .unwrap();

    let sst = SSTable::open(&path).unwrap();
    assert_eq!(sst.len(), 3);
    assert_eq!(sst.min_key(), b"a");
    assert_eq!(sst.max_key(), b"c");
    assert_eq!(
        sst.get(b"b").unwrap().value,
        EntryValue::Live(b"2".to_vec())
    );
    assert!(sst.get(b"z").is_none());
}

#[test]
fn range_scan_is_inclusive_on_both_bounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.sst");
    SSTable::write(
        &path,
        1,
        vec![
            entry("a", "1", 1),
            entry("b", "2", 2),
            entry("c", "3", 3),
            entry("d", "4", 4),
        ],
    )
    .unwrap();

    let sst = SSTable::open(&path).unwrap();
    let results = sst.range(b"b", b"c");
    let keys: Vec<_> = results.iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn empty_entries_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.sst");
    let err = SSTable::write(&path, 1, Vec::<SstEntry>::new()).unwrap_err();
    assert!(matches!(err, SstableError::Empty));
}

#[test]
fn write_is_atomic_no_leftover_tmp_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.sst");
    SSTable::write(&path, 1, vec![entry("a", "1", 1)]).unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("sst.tmp").exists());
}

#[test]
fn corrupted_file_fails_checksum() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.sst");
    SSTable::write(&path, 1, vec![entry("a", "1", 1), entry("b", "2", 2)]).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let err = SSTable::open(&path).unwrap_err();
    assert!(matches!(err, SstableError::ChecksumMismatch));
}
