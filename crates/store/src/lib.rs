//! bucketdb-store: an embedded, single-file, bucketed key-value store.
//!
//! The engine underneath the [`Store`] facade is a copy-on-write B+ tree with
//! snapshot isolation:
//!
//! - **Buckets**: named, independent ordered key spaces, each its own tree
//! - **Single writer, many readers**: readers never block and are never blocked
//! - **Checksummed pages**: XXH3-64 on every page and commit slot
//! - **Dual-slot commit**: atomic commits via shadow paging (no WAL)
//! - **Deferred reclamation**: replaced pages are reused only once no open
//!   snapshot can reach them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Store facade                  │
//! │  (save, get, delete, incr, scan, prefix)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer                │
//! │  (ReadTxn: snapshot, WriteTxn: COW+commit)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │       Bucket directory + B+ Tree Layer       │
//! │     (get, insert, delete, cursor, range)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Page Layer                      │
//! │  (allocator, cache, checksum, COW)          │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                   │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use bucketdb_store::Store;
//!
//! let store = Store::open_in_memory()?;
//! store.create_bucket_if_not_exists(b"users")?;
//! store.save(b"users", b"alice", b"admin")?;
//! assert_eq!(store.get(b"users", b"alice")?, b"admin");
//!
//! store.find_prefix(b"users", b"al", |key, value| {
//!     println!("{key:?} -> {value:?}");
//!     true
//! })?;
//! # Ok::<(), bucketdb_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// B+ tree operations use complex return types for split propagation
#![allow(clippy::type_complexity)]

pub mod backend;
pub mod btree;
pub mod bucket;
pub mod db;
pub mod error;
pub mod integrity;
pub mod page;
pub mod store;
pub mod transaction;

// Re-export commonly used types
pub use backend::{
    DEFAULT_PAGE_SIZE, DatabaseHeader, FileBackend, HEADER_SIZE, InMemoryBackend, MAGIC,
    StorageBackend,
};
pub use btree::{
    BTree, PageProvider, PageReader,
    cursor::{Bound, Cursor, Entries, Range},
};
pub use db::{
    Database, DatabaseConfig, DatabaseStats, Entry, ReadTransaction, SnapshotPages, TxnPages,
    WriteTransaction,
};
pub use error::{Error, PageId, PageType, Result};
pub use integrity::{IntegrityScrubber, ScrubError, ScrubResult};
pub use page::{PAGE_HEADER_SIZE, Page, PageAllocator, PageCache};
pub use store::Store;
pub use transaction::SnapshotId;

/// Store format version.
pub const VERSION: u16 = backend::FORMAT_VERSION;
