use std::sync::Arc;

use tempfile::tempdir;

use crate::catalog::Catalog;
use crate::compaction::{compact_all, COMPACTION_TRIGGER};
use crate::memtable::EntryValue;
use crate::sstable::{SSTable, SstEntry};

fn live(key: &str, value: &str, seq: u64) -> SstEntry {
    SstEntry {
        key: key.as_bytes().to_vec(),
        value: EntryValue::Live(value.as_bytes().to_vec()),
        sequence_no: seq,
        timestamp: 0,
    }
}

fn tombstone(key: &str, seq: u64) -> SstEntry {
    SstEntry {
        key: key.as_bytes().to_vec(),
        value: EntryValue::Tombstone,
        sequence_no: seq,
        timestamp: 0,
    }
}

#[test]
fn below_trigger_is_a_no_op() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();
    let path = dir.path().join("000001.sst");
    SSTable::write(&path, 1, vec![live("a", "1", 1)]).unwrap();
    catalog.add(1, path.clone()).unwrap();
    let table = Arc::new(SSTable::open(&path).unwrap());

    let ran = compact_all(&catalog, dir.path(), std::slice::from_ref(&table)).unwrap();
    assert!(!ran);
}

#[test]
fn merges_and_keeps_newest_version_drops_tombstones() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();

    let mut tables = Vec::new();
    for i in 0..COMPACTION_TRIGGER {
        let id = (i + 1) as u64;
        let path = dir.path().join(format!("{id:06}.sst"));
        let entries = if i == 0 {
            vec![live("a", "old", 1)]
        } else if i == 1 {
            vec![live("a", "new", 100), tombstone("b", 50)]
        } else {
            vec![live(&format!("k{i}"), "v", i as u64 + 1)]
        };
        SSTable::write(&path, id, entries).unwrap();
        catalog.add(id, path.clone()).unwrap();
        tables.push(Arc::new(SSTable::open(&path).unwrap()));
    }

    let ran = compact_all(&catalog, dir.path(), &tables).unwrap();
    assert!(ran);

    let live_entries = catalog.list();
    assert!(!live_entries.is_empty());
    // Old ids should be gone.
    for i in 0..COMPACTION_TRIGGER {
        assert!(!live_entries.iter().any(|e| e.id == (i + 1) as u64));
    }

    let mut found_a = false;
    for entry in &live_entries {
        let sst = SSTable::open(&entry.path).unwrap();
        if let Some(e) = sst.get(b"a") {
            found_a = true;
            assert_eq!(e.value, EntryValue::Live(b"new".to_vec()));
        }
        assert!(sst.get(b"b").is_none());
    }
    assert!(found_a);
}
