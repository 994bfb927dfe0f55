use std::path::PathBuf;

use tempfile::tempdir;

use crate::catalog::Catalog;

#[test]
fn add_then_list_shows_youngest_first() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();

    catalog.add(1, PathBuf::from("1.sst")).unwrap();
    catalog.add(2, PathBuf::from("2.sst")).unwrap();
    catalog.add(3, PathBuf::from("3.sst")).unwrap();

    let ids: Vec<_> = catalog.list().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[test]
fn allocate_id_is_monotonic() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();

    let a = catalog.allocate_id().unwrap();
    let b = catalog.allocate_id().unwrap();
    assert!(b > a);
}

#[test]
fn replace_is_atomic_swap() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();

    catalog.add(1, PathBuf::from("1.sst")).unwrap();
    catalog.add(2, PathBuf::from("2.sst")).unwrap();

    let new_id = catalog.allocate_id().unwrap();
    catalog
        .replace(
            vec![crate::catalog::CatalogEntry {
                id: new_id,
                path: PathBuf::from("merged.sst"),
            }],
            vec![1, 2],
        )
        .unwrap();

    let ids: Vec<_> = catalog.list().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![new_id]);
}

#[test]
fn delete_removes_a_single_table_without_touching_others() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path()).unwrap();

    catalog.add(1, PathBuf::from("1.sst")).unwrap();
    catalog.add(2, PathBuf::from("2.sst")).unwrap();

    catalog.delete(1).unwrap();

    let ids: Vec<_> = catalog.list().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![2]);
}

#[test]
fn reopen_after_checkpoint_preserves_state() {
    let dir = tempdir().unwrap();
    {
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.add(1, PathBuf::from("1.sst")).unwrap();
        catalog.checkpoint().unwrap();
    }

    let catalog = Catalog::open(dir.path()).unwrap();
    let ids: Vec<_> = catalog.list().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1]);
}

#[test]
fn reopen_without_checkpoint_replays_wal() {
    let dir = tempdir().unwrap();
    {
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.add(1, PathBuf::from("1.sst")).unwrap();
        catalog.add(2, PathBuf::from("2.sst")).unwrap();
        // No checkpoint: manifest WAL alone must carry this forward.
    }

    let catalog = Catalog::open(dir.path()).unwrap();
    let ids: Vec<_> = catalog.list().iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(sorted, vec![1, 2]);
}
