//! Database and transaction management.
//!
//! Provides snapshot-isolated transactions over named buckets. One write
//! transaction runs at a time; any number of read transactions run beside it,
//! each pinned to the state committed when it began.
//!
//! # Example
//!
//! ```no_run
//! use bucketdb_store::Database;
//!
//! let db = Database::open("data.db")?;
//!
//! // Write transaction
//! {
//!     let mut txn = db.write()?;
//!     txn.create_bucket_if_not_exists(b"users")?;
//!     txn.insert(b"users", b"alice", b"admin")?;
//!     txn.commit()?;
//! }
//!
//! // Read transaction
//! {
//!     let txn = db.read()?;
//!     let role = txn.get(b"users", b"alice")?;
//! }
//! # Ok::<(), bucketdb_store::Error>(())
//! ```

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    backend::{
        CommitSlot, DEFAULT_PAGE_SIZE, DatabaseHeader, FileBackend, InMemoryBackend,
        StorageBackend,
    },
    btree::{
        BTree, PageProvider, PageReader,
        cursor::{Cursor, Entries, Range},
    },
    bucket::{self, validate_bucket_name},
    error::{Error, PageId, PageType, Result},
    page::{FIRST_PAGE_ID, PAGE_HEADER_SIZE, Page, PageAllocator, PageCache, read_u64_le},
    transaction::{CommittedState, PendingFrees, SnapshotId, TransactionTracker},
};

/// A key/value pair as returned by lookups and scans.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Database configuration options.
#[derive(Debug, Clone, bon::Builder)]
pub struct DatabaseConfig {
    /// Page size for new databases (power of 2 in 512..=65536, default 4096).
    /// Existing files keep the page size they were created with.
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
    /// Maximum pages to cache in memory.
    #[builder(default = 1024)]
    pub cache_size: usize,
    /// Whether to sync on every commit (default true for durability).
    #[builder(default = true)]
    pub sync_on_commit: bool,
    /// Deadline applied by [`Database::write`]; `None` waits indefinitely.
    pub write_lock_timeout: Option<Duration>,
    /// Upper bound on the page count; allocation past it fails with [`Error::OutOfSpace`].
    pub max_pages: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 1024, // ~4MB with 4KB pages
            sync_on_commit: true,
            write_lock_timeout: None,
            max_pages: None,
        }
    }
}

/// The main database handle.
///
/// Generic over [`StorageBackend`]: use [`Database<FileBackend>`] for
/// persistent stores and [`Database<InMemoryBackend>`] for tests.
///
/// # Transaction Isolation (Copy-on-Write)
///
/// - Read transactions pin the committed state current when they begin
/// - Write transactions copy every page they modify to a new page id
/// - Commit publishes the new state with a single atomic swap
/// - Replaced pages are reused only once no reader can reach them
///
/// Readers never block writers and writers never block readers.
pub struct Database<B: StorageBackend> {
    backend: B,
    /// Page cache shared across all transactions. Holds committed pages only.
    cache: PageCache,
    allocator: PageAllocator,
    /// Current committed state, swapped on commit.
    committed_state: ArcSwap<CommittedState>,
    tracker: TransactionTracker,
    pending_frees: Mutex<PendingFrees>,
    /// In-memory copy of the on-disk header.
    header: Mutex<DatabaseHeader>,
    config: DatabaseConfig,
    /// Held by the single live write transaction.
    write_lock: Mutex<()>,
    /// Total B+ tree page splits since open.
    page_splits: AtomicU64,
    closed: bool,
}

impl Database<FileBackend> {
    /// Opens the database at `path`, creating it if the file does not exist.
    ///
    /// Recovers committed state from the dual-slot header. If the recovery
    /// flag is set (unclean shutdown), the free list is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or read.
    /// Returns [`Error::InvalidMagic`] if the file is not a bucketdb database.
    /// Returns [`Error::HeaderChecksumMismatch`] if both commit slots are invalid.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    /// Opens or creates the database at `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open); also returns [`Error::InvalidPageSize`] when
    /// creating a file with an invalid `config.page_size`.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        let exists = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let backend = if exists {
            FileBackend::open(path)?
        } else {
            FileBackend::create(path, config.page_size)?
        };
        Self::from_backend(backend, config)
    }

    /// Creates a new database at `path`, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_config(path, DatabaseConfig::default())
    }

    /// Creates a new database with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created.
    /// Returns [`Error::InvalidPageSize`] if the page size is invalid.
    pub fn create_with_config<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        let backend = FileBackend::create(path, config.page_size)?;
        Self::from_backend(backend, config)
    }
}

impl Database<InMemoryBackend> {
    /// Creates a new in-memory database. Data is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if backend initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(DatabaseConfig::default())
    }

    /// Creates a new in-memory database with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPageSize`] if the page size is invalid.
    pub fn open_in_memory_with_config(config: DatabaseConfig) -> Result<Self> {
        let backend = InMemoryBackend::with_page_size(config.page_size)?;
        Self::from_backend(backend, config)
    }
}

impl<B: StorageBackend> Database<B> {
    /// Creates a database over a backend holding a valid header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read or no commit slot verifies.
    pub fn from_backend(backend: B, mut config: DatabaseConfig) -> Result<Self> {
        config.page_size = backend.page_size();

        let mut header = DatabaseHeader::from_bytes(&backend.read_header()?)?;
        let slot_index = header.validate_and_choose_slot()?;
        let slot = header.slot(slot_index).cloned().ok_or(Error::HeaderChecksumMismatch)?;

        // A torn primary slot means the last commit never completed. Treat the
        // surviving slot as primary so the next commit overwrites the torn one.
        let fell_back = slot_index != header.primary_slot_index();
        if fell_back {
            tracing::warn!(slot = slot_index, "Primary commit slot invalid, using secondary");
            header.flip_primary_slot();
        }
        let mut recovery_required = header.recovery_required() || fell_back;

        let state = CommittedState {
            directory_root: slot.directory_root,
            snapshot_id: SnapshotId::new(slot.txn_id),
        };

        let db = Self {
            backend,
            cache: PageCache::new(config.cache_size),
            allocator: PageAllocator::new(slot.total_pages, config.max_pages),
            committed_state: ArcSwap::from_pointee(state),
            tracker: TransactionTracker::new(),
            pending_frees: Mutex::new(PendingFrees::new()),
            header: Mutex::new(header),
            config,
            write_lock: Mutex::new(()),
            page_splits: AtomicU64::new(0),
            closed: false,
        };

        if !recovery_required
            && slot.freelist_page != 0
            && let Err(e) = db.load_free_list(&slot)
        {
            tracing::warn!(error = %e, "Persisted free list unreadable");
            recovery_required = true;
        }

        if recovery_required {
            tracing::warn!(
                snapshot_id = slot.txn_id,
                "Recovery required - rebuilding free list from reachable pages"
            );
            db.rebuild_free_list(slot.total_pages)?;
            // Keep the flag so the next clean close persists a fresh free list.
            db.header.lock().set_recovery_required(true);
        }

        Ok(db)
    }

    /// Begins a read-only transaction pinned to the current committed state.
    pub fn read(&self) -> Result<ReadTransaction<'_, B>> {
        let state = self.tracker.begin_read(|| self.committed_state.load_full());
        Ok(ReadTransaction { pages: SnapshotPages { db: self }, state })
    }

    /// Begins a write transaction, blocking while another one is live.
    ///
    /// Applies [`DatabaseConfig::write_lock_timeout`] when configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TxConflict`] if the configured deadline passes.
    pub fn write(&self) -> Result<WriteTransaction<'_, B>> {
        match self.config.write_lock_timeout {
            Some(timeout) => self.write_with_timeout(timeout),
            None => Ok(self.begin_write(self.write_lock.lock())),
        }
    }

    /// Begins a write transaction, waiting at most `timeout` for the write lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TxConflict`] if the lock is still held after `timeout`.
    pub fn write_with_timeout(&self, timeout: Duration) -> Result<WriteTransaction<'_, B>> {
        let started = Instant::now();
        match self.write_lock.try_lock_for(timeout) {
            Some(guard) => Ok(self.begin_write(guard)),
            None => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(waited_ms, "Timed out waiting for the write lock");
                Err(Error::TxConflict { waited_ms })
            },
        }
    }

    /// Begins a write transaction only if no other one is live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TxConflict`] if another write transaction holds the lock.
    pub fn try_write(&self) -> Result<WriteTransaction<'_, B>> {
        self.write_lock
            .try_lock()
            .map(|guard| self.begin_write(guard))
            .ok_or(Error::TxConflict { waited_ms: 0 })
    }

    fn begin_write<'db>(&'db self, guard: MutexGuard<'db, ()>) -> WriteTransaction<'db, B> {
        let committed = self.committed_state.load_full();
        let snapshot_id = committed.snapshot_id.next();
        self.tracker.start_write_transaction(snapshot_id);

        WriteTransaction {
            pages: TxnPages {
                db: self,
                txn_id: snapshot_id.raw(),
                dirty: HashMap::new(),
                freed: Vec::new(),
            },
            snapshot_id,
            directory_root: committed.directory_root,
            dirty_roots: BTreeMap::new(),
            page_splits: 0,
            finished: false,
            _write_guard: guard,
        }
    }

    /// Persists the free list, clears the recovery flag and closes the database.
    ///
    /// Dropping the database does the same on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the free list or header cannot be written.
    pub fn close(mut self) -> Result<()> {
        let result = self.shutdown();
        self.closed = true;
        result
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut header = self.header.lock().clone();
        if !header.recovery_required() {
            // Nothing committed since the last clean close.
            return Ok(());
        }

        // Readers borrow the database, so none can be live here.
        let pending = self.pending_frees.lock().drain_freeable(None);
        self.release_pages(pending);

        let (freelist_page, freelist_pages) = self.persist_free_list()?;
        let current = header.slot(header.primary_slot_index()).cloned().unwrap_or_default();
        let slot = CommitSlot {
            total_pages: self.allocator.next_page_id(),
            timestamp: unix_timestamp(),
            freelist_page,
            freelist_pages,
            ..current
        };

        header.set_secondary_slot(slot);
        self.write_header(&header, true)?;
        // Slot flip and flag clear land in the same byte.
        header.flip_primary_slot();
        header.set_recovery_required(false);
        self.write_header(&header, true)?;
        *self.header.lock() = header;

        tracing::info!(
            free_pages = self.allocator.free_page_count(),
            total_pages = self.allocator.next_page_id(),
            "Database closed cleanly"
        );
        Ok(())
    }

    /// Returns database statistics.
    pub fn stats(&self) -> DatabaseStats {
        let cache_stats = self.cache.stats();
        DatabaseStats {
            page_size: self.config.page_size,
            total_pages: self.allocator.next_page_id(),
            free_pages: self.allocator.free_page_count(),
            pending_free_pages: self.pending_frees.lock().pending_count(),
            cached_pages: cache_stats.size,
            cache_hits: cache_stats.hits,
            cache_misses: cache_stats.misses,
            page_splits: self.page_splits.load(Ordering::Relaxed),
            active_readers: self.tracker.active_reader_count(),
            snapshot_id: self.snapshot_id(),
        }
    }

    /// Returns the id of the last committed snapshot.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.committed_state.load().snapshot_id
    }

    /// Returns the configured page size in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the configuration in effect.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the total number of pages allocated (including free pages).
    pub fn total_page_count(&self) -> PageId {
        self.allocator.next_page_id()
    }

    /// Returns IDs of pages currently on the free list.
    pub fn free_page_ids(&self) -> Vec<PageId> {
        self.allocator.free_pages()
    }

    /// Returns IDs of replaced pages still held back for older readers.
    pub fn pending_free_page_ids(&self) -> Vec<PageId> {
        self.pending_frees.lock().pending_pages()
    }

    /// Reads a raw page bypassing cache and checksum verification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backend read fails.
    /// Returns [`Error::PageNotFound`] if the page is unwritten (all zeros).
    pub fn read_raw_page(&self, page_id: PageId) -> Result<Page> {
        let page = Page::from_bytes(page_id, self.backend.read_page(page_id)?);
        if page.is_blank() {
            return Err(Error::PageNotFound { page_id });
        }
        Ok(page)
    }

    /// Reads a committed page from cache or backend, verifying its checksum.
    pub(crate) fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }

        let page = self.read_raw_page(page_id)?;
        if !page.verify_checksum() {
            return Err(Error::PageChecksumMismatch { page_id });
        }

        self.cache.insert(page.clone());
        Ok(page)
    }

    fn write_header(&self, header: &DatabaseHeader, sync: bool) -> Result<()> {
        self.backend.write_header(&header.to_bytes())?;
        if sync {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Returns pages to the allocator, dropping any cached copies.
    fn release_pages(&self, pages: Vec<PageId>) {
        for &page_id in &pages {
            self.cache.remove(page_id);
        }
        self.allocator.free_batch(pages);
    }

    /// Frees the pending pages that no live reader can reach anymore.
    fn reclaim_pending_pages(&self) {
        self.retire_pages(None);
    }

    /// Defers the pages replaced by a published commit, then frees whatever
    /// no live reader can reach.
    ///
    /// The oldest reader is read while `pending_frees` is held, so the check
    /// and the drain see the same set of recorded commits. A reader that
    /// registers after the check loaded a state at least as new as every
    /// commit recorded so far. Lock order: `pending_frees`, then the tracker.
    fn retire_pages(&self, replaced: Option<(SnapshotId, Vec<PageId>)>) {
        let pages = {
            let mut pending = self.pending_frees.lock();
            if let Some((snapshot_id, pages)) = replaced {
                pending.record_freed_pages(snapshot_id, pages);
            }
            let oldest_reader = self.tracker.oldest_live_read_transaction();
            pending.drain_freeable(oldest_reader)
        };
        if !pages.is_empty() {
            tracing::trace!(pages = pages.len(), "Reclaimed pages");
            self.release_pages(pages);
        }
    }

    /// Collects every page reachable from the committed directory.
    fn reachable_pages(&self) -> Result<HashSet<PageId>> {
        let reader = SnapshotPages { db: self };
        let directory_root = self.committed_state.load().directory_root;

        let mut reachable: HashSet<PageId> =
            BTree::new(directory_root, &reader).page_ids()?.into_iter().collect();
        for (_, root) in bucket::list_roots(&reader, directory_root)? {
            reachable.extend(BTree::new(root, &reader).page_ids()?);
        }
        Ok(reachable)
    }

    /// Rebuilds the free list as every allocated page not reachable from the
    /// committed state.
    fn rebuild_free_list(&self, total_pages: PageId) -> Result<()> {
        let reachable = self.reachable_pages()?;
        let free: Vec<PageId> =
            (FIRST_PAGE_ID..total_pages).filter(|page_id| !reachable.contains(page_id)).collect();

        tracing::info!(
            free_pages = free.len(),
            reachable_pages = reachable.len(),
            "Rebuilt free list"
        );
        self.allocator.init_free_list(free);
        Ok(())
    }

    /// Writes the free set into a contiguous run of free-list pages.
    ///
    /// Returns the first page of the run and its length (`(0, 0)` when empty).
    /// The run pages themselves are reusable again after the next open.
    fn persist_free_list(&self) -> Result<(PageId, u64)> {
        let per_page = freelist_capacity(self.config.page_size);
        let free_count = self.allocator.free_page_count();
        if free_count == 0 {
            return Ok((0, 0));
        }

        let run_len = free_count.div_ceil(per_page) as u64;
        let start = self.allocator.allocate_contiguous(run_len)?;
        // Taking the run from the free set only shrinks it, so it still fits.
        let free = self.allocator.free_pages();
        let txn_id = self.snapshot_id().raw();

        let mut chunks = free.chunks(per_page);
        for page_id in start..start + run_len {
            let ids = chunks.next().unwrap_or(&[]);
            let mut page = Page::new(page_id, self.config.page_size, PageType::FreeList, txn_id);
            page.set_item_count(ids.len() as u16);
            for (slot, id) in page.content_mut().chunks_exact_mut(8).zip(ids) {
                slot.copy_from_slice(&id.to_le_bytes());
            }
            page.update_checksum();
            self.backend.write_page(page_id, &page.data)?;
            self.cache.remove(page_id);
        }
        self.backend.sync()?;

        Ok((start, run_len))
    }

    /// Loads the free list persisted by the last clean close.
    fn load_free_list(&self, slot: &CommitSlot) -> Result<()> {
        let per_page = freelist_capacity(self.config.page_size);
        let mut free = Vec::new();

        let end = slot.freelist_page.saturating_add(slot.freelist_pages);
        if end > slot.total_pages {
            return Err(Error::Corrupted { reason: "free-list run past end of file".to_string() });
        }

        for page_id in slot.freelist_page..end {
            let page = self.read_page(page_id)?;
            let found = page.page_type()?;
            if found != PageType::FreeList {
                return Err(Error::PageTypeMismatch { expected: PageType::FreeList, found });
            }

            let count = page.item_count() as usize;
            if count > per_page {
                return Err(Error::Corrupted {
                    reason: format!("free-list page {page_id} holds {count} ids"),
                });
            }
            for chunk in page.content()[..count * 8].chunks_exact(8) {
                let id = read_u64_le(chunk);
                if !(FIRST_PAGE_ID..slot.total_pages).contains(&id) {
                    return Err(Error::Corrupted {
                        reason: format!("free-list entry {id} out of range"),
                    });
                }
                free.push(id);
            }

            self.cache.remove(page_id);
            free.push(page_id);
        }

        tracing::info!(free_pages = free.len(), "Loaded persisted free list");
        self.allocator.init_free_list(free);
        Ok(())
    }
}

impl<B: StorageBackend> Drop for Database<B> {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.shutdown()
        {
            tracing::warn!(error = %e, "Failed to close database cleanly");
        }
    }
}

/// Number of page ids one free-list page holds.
fn freelist_capacity(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 8
}

fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Database statistics.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Page size in bytes.
    pub page_size: usize,
    /// Total number of pages allocated.
    pub total_pages: PageId,
    /// Free pages available for reuse.
    pub free_pages: usize,
    /// Replaced pages waiting for older readers to finish.
    pub pending_free_pages: usize,
    /// Pages currently in cache.
    pub cached_pages: usize,
    /// Total page cache hits since open.
    pub cache_hits: u64,
    /// Total page cache misses since open.
    pub cache_misses: u64,
    /// Total B+ tree page splits since open.
    pub page_splits: u64,
    /// Live read transactions.
    pub active_readers: usize,
    /// Last committed snapshot.
    pub snapshot_id: SnapshotId,
}

/// Page access for read transactions: committed pages only.
pub struct SnapshotPages<'db, B: StorageBackend> {
    db: &'db Database<B>,
}

impl<B: StorageBackend> PageReader for SnapshotPages<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.config.page_size
    }
}

/// A read-only transaction.
///
/// Sees the state committed when it began, for its whole lifetime. Holds no
/// locks; dropping it lets pages replaced since its snapshot be reused.
pub struct ReadTransaction<'db, B: StorageBackend> {
    pages: SnapshotPages<'db, B>,
    state: Arc<CommittedState>,
}

impl<'db, B: StorageBackend> ReadTransaction<'db, B> {
    /// Returns the snapshot this transaction reads.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.state.snapshot_id
    }

    pub(crate) fn directory_root(&self) -> PageId {
        self.state.directory_root
    }

    fn bucket_root(&self, bucket: &[u8]) -> Result<PageId> {
        bucket::lookup_root(&self.pages, self.state.directory_root, bucket)?
            .ok_or_else(|| Error::bucket_not_found(bucket))
    }

    fn tree(&self, bucket: &[u8]) -> Result<BTree<&SnapshotPages<'db, B>>> {
        Ok(BTree::new(self.bucket_root(bucket)?, &self.pages))
    }

    /// Checks whether a bucket exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory page cannot be read.
    pub fn bucket_exists(&self, bucket: &[u8]) -> Result<bool> {
        Ok(bucket::lookup_root(&self.pages, self.state.directory_root, bucket)?.is_some())
    }

    /// Lists bucket names in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory page cannot be read.
    pub fn bucket_names(&self) -> Result<Vec<Vec<u8>>> {
        bucket::list_buckets(&self.pages, self.state.directory_root)
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree(bucket)?.get(key)
    }

    /// Returns the smallest entry of a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn first(&self, bucket: &[u8]) -> Result<Option<Entry>> {
        self.tree(bucket)?.first()
    }

    /// Returns the largest entry of a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn last(&self, bucket: &[u8]) -> Result<Option<Entry>> {
        self.tree(bucket)?.last()
    }

    /// Returns the depth of a bucket's tree (0 while it never held a key).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn bucket_depth(&self, bucket: &[u8]) -> Result<u32> {
        self.tree(bucket)?.depth()
    }

    /// Opens a cursor over a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn cursor(&self, bucket: &[u8]) -> Result<Cursor<&SnapshotPages<'db, B>>> {
        Ok(Cursor::new(&self.pages, self.bucket_root(bucket)?))
    }

    /// Iterates over every entry of a bucket in key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn iter(&self, bucket: &[u8]) -> Result<Entries<'static, &SnapshotPages<'db, B>>> {
        Ok(Entries::new(self.cursor(bucket)?, Range::all()))
    }

    /// Iterates over the entries of a bucket within `range`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn range<'a>(
        &self,
        bucket: &[u8],
        range: Range<'a>,
    ) -> Result<Entries<'a, &SnapshotPages<'db, B>>> {
        Ok(Entries::new(self.cursor(bucket)?, range))
    }

    /// Iterates over the entries of a bucket whose keys start with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn prefix<'a>(
        &self,
        bucket: &[u8],
        prefix: &'a [u8],
    ) -> Result<Entries<'a, &SnapshotPages<'db, B>>> {
        Ok(Entries::with_prefix(self.cursor(bucket)?, prefix))
    }
}

impl<B: StorageBackend> Drop for ReadTransaction<'_, B> {
    fn drop(&mut self) {
        let db = self.pages.db;
        db.tracker.end_read(self.state.snapshot_id);
        db.reclaim_pending_pages();
    }
}

/// Page access for a write transaction.
///
/// Pages allocated by the transaction live in `dirty` until commit; reads
/// check there first so the transaction sees its own writes.
pub struct TxnPages<'db, B: StorageBackend> {
    db: &'db Database<B>,
    txn_id: u64,
    dirty: HashMap<PageId, Page>,
    /// Committed pages replaced by this transaction.
    freed: Vec<PageId>,
}

impl<B: StorageBackend> PageReader for TxnPages<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.config.page_size
    }
}

impl<B: StorageBackend> PageProvider for TxnPages<'_, B> {
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        let page_id = self.db.allocator.allocate()?;
        let page = Page::new(page_id, self.db.config.page_size, page_type, self.txn_id);
        self.dirty.insert(page_id, page.clone());
        Ok(page)
    }

    fn write_page(&mut self, page: Page) -> Result<()> {
        match self.dirty.get_mut(&page.id) {
            Some(slot) => {
                *slot = page;
                Ok(())
            },
            None => Err(Error::PageNotWritable { page_id: page.id }),
        }
    }

    fn free_page(&mut self, page_id: PageId) {
        if self.dirty.remove(&page_id).is_some() {
            // Never committed: no snapshot can reach it.
            self.db.allocator.free(page_id);
        } else {
            self.freed.push(page_id);
        }
    }

    fn txn_id(&self) -> u64 {
        self.txn_id
    }
}

/// A write transaction.
///
/// Changes are buffered until [`commit`](Self::commit) and invisible to every
/// other transaction before it. Dropping an uncommitted transaction rolls it
/// back.
///
/// # Commit protocol
///
/// 1. Fold dirty bucket roots into the bucket directory
/// 2. Write every page allocated by the transaction, with checksums
/// 3. Sync (when `sync_on_commit`)
/// 4. Write the new commit slot into the inactive header slot, sync, flip
///    the primary slot, sync
/// 5. Publish the new committed state
/// 6. Defer the replaced pages until no reader can reach them
///
/// A transaction that changed nothing skips the disk entirely.
pub struct WriteTransaction<'db, B: StorageBackend> {
    pages: TxnPages<'db, B>,
    /// Snapshot this transaction commits as.
    snapshot_id: SnapshotId,
    directory_root: PageId,
    /// Bucket roots changed by this transaction, folded into the directory on commit.
    dirty_roots: BTreeMap<Vec<u8>, PageId>,
    page_splits: u64,
    finished: bool,
    _write_guard: MutexGuard<'db, ()>,
}

impl<'db, B: StorageBackend> WriteTransaction<'db, B> {
    /// Returns the snapshot this transaction will commit as.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    fn lookup_root(&self, bucket: &[u8]) -> Result<Option<PageId>> {
        if let Some(&root) = self.dirty_roots.get(bucket) {
            return Ok(Some(root));
        }
        bucket::lookup_root(&self.pages, self.directory_root, bucket)
    }

    fn bucket_root(&self, bucket: &[u8]) -> Result<PageId> {
        self.lookup_root(bucket)?.ok_or_else(|| Error::bucket_not_found(bucket))
    }

    fn tree(&self, bucket: &[u8]) -> Result<BTree<&TxnPages<'db, B>>> {
        Ok(BTree::new(self.bucket_root(bucket)?, &self.pages))
    }

    /// Applies `op` to the bucket directory tree.
    fn update_directory<T>(
        &mut self,
        op: impl FnOnce(&mut BTree<&mut TxnPages<'db, B>>) -> Result<T>,
    ) -> Result<T> {
        let mut directory = BTree::new(self.directory_root, &mut self.pages);
        let out = op(&mut directory)?;
        self.page_splits += directory.split_count();
        self.directory_root = directory.root_page();
        Ok(out)
    }

    /// Applies `op` to a bucket tree and records its new root.
    fn update_bucket<T>(
        &mut self,
        bucket: &[u8],
        op: impl FnOnce(&mut BTree<&mut TxnPages<'db, B>>) -> Result<T>,
    ) -> Result<T> {
        let root = self.bucket_root(bucket)?;
        let mut tree = BTree::new(root, &mut self.pages);
        let out = op(&mut tree)?;
        let (new_root, splits) = (tree.root_page(), tree.split_count());

        self.page_splits += splits;
        if new_root != root {
            self.dirty_roots.insert(bucket.to_vec(), new_root);
        }
        Ok(out)
    }

    /// Checks whether a bucket exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory page cannot be read.
    pub fn bucket_exists(&self, bucket: &[u8]) -> Result<bool> {
        Ok(self.lookup_root(bucket)?.is_some())
    }

    /// Lists bucket names in ascending order, including uncommitted ones.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory page cannot be read.
    pub fn bucket_names(&self) -> Result<Vec<Vec<u8>>> {
        bucket::list_buckets(&self.pages, self.directory_root)
    }

    /// Creates an empty bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketExists`] if the name is taken and
    /// [`Error::InvalidBucketName`] if it is empty or too long.
    pub fn create_bucket(&mut self, bucket: &[u8]) -> Result<()> {
        validate_bucket_name(bucket, self.pages.page_size())?;
        if self.lookup_root(bucket)?.is_some() {
            return Err(Error::BucketExists { name: String::from_utf8_lossy(bucket).into_owned() });
        }
        self.update_directory(|directory| directory.insert(bucket, &bucket::encode_root(0)))?;
        Ok(())
    }

    /// Creates a bucket unless it already exists. Returns true if it was created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBucketName`] if the name is empty or too long.
    pub fn create_bucket_if_not_exists(&mut self, bucket: &[u8]) -> Result<bool> {
        match self.create_bucket(bucket) {
            Ok(()) => Ok(true),
            Err(Error::BucketExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes a bucket and every entry in it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn delete_bucket(&mut self, bucket: &[u8]) -> Result<()> {
        let root = self.bucket_root(bucket)?;
        BTree::new(root, &mut self.pages).clear()?;
        self.dirty_roots.remove(bucket);
        self.update_directory(|directory| directory.delete(bucket))?;
        Ok(())
    }

    /// Inserts or replaces an entry, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist, and
    /// [`Error::EmptyKey`], [`Error::KeyTooLarge`] or [`Error::ValueTooLarge`]
    /// for entries that do not fit a page.
    pub fn insert(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.update_bucket(bucket, |tree| tree.insert(key, value))
    }

    /// Removes an entry, returning its value. Absent keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.update_bucket(bucket, |tree| tree.delete(key))
    }

    /// Returns the value stored under `key`, including uncommitted changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree(bucket)?.get(key)
    }

    /// Returns the smallest entry of a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn first(&self, bucket: &[u8]) -> Result<Option<Entry>> {
        self.tree(bucket)?.first()
    }

    /// Returns the largest entry of a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn last(&self, bucket: &[u8]) -> Result<Option<Entry>> {
        self.tree(bucket)?.last()
    }

    /// Opens a cursor over a bucket's current contents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn cursor(&self, bucket: &[u8]) -> Result<Cursor<&TxnPages<'db, B>>> {
        Ok(Cursor::new(&self.pages, self.bucket_root(bucket)?))
    }

    /// Iterates over every entry of a bucket in key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn iter(&self, bucket: &[u8]) -> Result<Entries<'static, &TxnPages<'db, B>>> {
        Ok(Entries::new(self.cursor(bucket)?, Range::all()))
    }

    /// Iterates over the entries of a bucket within `range`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn range<'a>(
        &self,
        bucket: &[u8],
        range: Range<'a>,
    ) -> Result<Entries<'a, &TxnPages<'db, B>>> {
        Ok(Entries::new(self.cursor(bucket)?, range))
    }

    /// Iterates over the entries of a bucket whose keys start with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn prefix<'a>(
        &self,
        bucket: &[u8],
        prefix: &'a [u8],
    ) -> Result<Entries<'a, &TxnPages<'db, B>>> {
        Ok(Entries::with_prefix(self.cursor(bucket)?, prefix))
    }

    /// Commits the transaction, making its changes durable and visible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing pages or the header fails. The
    /// transaction is then rolled back and the last committed state stays
    /// in effect.
    pub fn commit(mut self) -> Result<()> {
        let result = self.commit_inner();
        if result.is_err() {
            self.discard();
        }
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        for (name, root) in std::mem::take(&mut self.dirty_roots) {
            self.update_directory(|directory| directory.insert(&name, &bucket::encode_root(root)))?;
        }

        let db = self.pages.db;
        if self.pages.dirty.is_empty() && self.pages.freed.is_empty() {
            tracing::debug!(snapshot_id = self.snapshot_id.raw(), "Commit without changes");
            db.tracker.end_write_transaction(self.snapshot_id);
            self.finished = true;
            return Ok(());
        }

        for page in self.pages.dirty.values_mut() {
            page.update_checksum();
            db.backend.write_page(page.id, &page.data)?;
        }
        if db.config.sync_on_commit {
            db.backend.sync()?;
        }

        let mut header = db.header.lock().clone();
        header.set_secondary_slot(CommitSlot {
            directory_root: self.directory_root,
            total_pages: db.allocator.next_page_id(),
            txn_id: self.snapshot_id.raw(),
            timestamp: unix_timestamp(),
            freelist_page: 0,
            freelist_pages: 0,
        });
        header.set_recovery_required(true);
        db.write_header(&header, db.config.sync_on_commit)?;
        header.flip_primary_slot();
        db.write_header(&header, db.config.sync_on_commit)?;
        *db.header.lock() = header;

        let dirty_count = self.pages.dirty.len();
        for (_, page) in self.pages.dirty.drain() {
            db.cache.insert(page);
        }
        db.committed_state.store(Arc::new(CommittedState {
            directory_root: self.directory_root,
            snapshot_id: self.snapshot_id,
        }));

        let freed = std::mem::take(&mut self.pages.freed);
        let freed_count = freed.len();
        // Only after the new state is published.
        db.retire_pages(Some((self.snapshot_id, freed)));
        db.page_splits.fetch_add(self.page_splits, Ordering::Relaxed);
        db.tracker.end_write_transaction(self.snapshot_id);
        self.finished = true;

        tracing::debug!(
            snapshot_id = self.snapshot_id.raw(),
            dirty_pages = dirty_count,
            freed_pages = freed_count,
            "Committed write transaction"
        );
        Ok(())
    }

    /// Discards every change made by the transaction.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        let db = self.pages.db;
        let allocated: Vec<PageId> = self.pages.dirty.drain().map(|(page_id, _)| page_id).collect();
        tracing::debug!(
            snapshot_id = self.snapshot_id.raw(),
            pages = allocated.len(),
            "Rolled back write transaction"
        );
        db.allocator.free_batch(allocated);
        self.pages.freed.clear();
        db.tracker.end_write_transaction(self.snapshot_id);
        self.finished = true;
    }
}

impl<B: StorageBackend> Drop for WriteTransaction<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}
