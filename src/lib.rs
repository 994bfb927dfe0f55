//! # aeternuskv
//!
//! An embeddable, persistent key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed for
//! fast writes and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Engine                           │
//! │  ┌────────────┐        ┌─────────────┐               │
//! │  │  Memtable   │ flush │  SSTables   │               │
//! │  │  + WAL      │──────►│  (on disk)  │               │
//! │  └─────────────┘       └──────┬──────┘               │
//! │                               │                       │
//! │  ┌────────────────────────────┘                       │
//! │  │  Compaction (compact-all, trigger at N tables)     │
//! │  └────────────────────────────────────────────────────│
//! │                                                       │
//! │  ┌───────────────────────────────────────────────────┐│
//! │  │              Catalog (WAL + snapshot)              ││
//! │  └───────────────────────────────────────────────────┘│
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core storage engine — open, read, write, scan, flush, compact |
//! | [`memtable`] | In-memory write buffer, one version per key |
//! | [`wal`] | Generic, CRC-protected write-ahead log for crash recovery |
//! | [`sstable`] | Immutable, sorted, on-disk tables |
//! | [`catalog`] | Durable registry of live SSTables (WAL + snapshot model) |
//! | [`compaction`] | Compact-all merge strategy |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted to a WAL before
//!   being acknowledged, guaranteeing durability and crash recovery.
//! - **Single version per key** — the latest committed mutation always
//!   wins; reads never see stale data once a write returns.
//! - **Block-level CRC32 integrity** — every on-disk record (WAL frames,
//!   SSTable bodies, catalog snapshots) is checksummed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aeternuskv::engine::Engine;
//!
//! let engine = Engine::open("/tmp/my_db").unwrap();
//!
//! engine.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), None);
//!
//! engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
//! engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
//! let results = engine.range(b"a", b"z").unwrap();
//!
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod catalog;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod sstable;
pub mod wal;
