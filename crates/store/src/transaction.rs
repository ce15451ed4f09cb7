//! Snapshot tracking for copy-on-write isolation.
//!
//! - [`SnapshotId`]: identifier of a committed database state
//! - [`CommittedState`]: what a reader sees (the bucket directory root)
//! - [`TransactionTracker`]: live readers, for safe page reclamation
//! - [`PendingFrees`]: replaced pages waiting for older readers to finish

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::error::PageId;

/// Identifier of a committed database snapshot.
///
/// Each successful commit advances the snapshot ID by one. The ID of the
/// commit is also the transaction ID stamped into every page it writes.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Creates a snapshot ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns the following snapshot ID.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// The committed state that readers pin.
///
/// Swapped atomically on commit; older `Arc`s stay valid for the readers holding them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommittedState {
    /// Root page of the bucket directory (0 = no buckets).
    pub directory_root: PageId,
    /// The snapshot ID of this state.
    pub snapshot_id: SnapshotId,
}

/// Tracks live transactions so freed pages are only reused once unreachable.
///
/// ```text
/// Time    Action                          live_readers
/// ----    ------                          ------------
/// T1      Commit snapshot 1               {}
/// T2      Read starts (snapshot 1)        {1: 1}
/// T3      Commit snapshot 2               {1: 1}     pages replaced by 2 held back
/// T4      Read starts (snapshot 2)        {1: 1, 2: 1}
/// T5      First read ends                 {2: 1}     pages replaced by 2 reusable
/// ```
pub struct TransactionTracker {
    state: Mutex<TrackerState>,
}

struct TrackerState {
    /// Reference count of read transactions per snapshot ID.
    live_read_transactions: BTreeMap<SnapshotId, u64>,
    /// Current write transaction snapshot ID (at most one).
    live_write_transaction: Option<SnapshotId>,
}

impl TransactionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                live_read_transactions: BTreeMap::new(),
                live_write_transaction: None,
            }),
        }
    }

    /// Loads the committed state and registers a reader on it, atomically.
    ///
    /// Loading under the tracker lock means a committer that publishes a new
    /// state and then asks for [`oldest_live_read_transaction`] either sees this
    /// reader or this reader sees the new state.
    ///
    /// [`oldest_live_read_transaction`]: Self::oldest_live_read_transaction
    pub fn begin_read(&self, load: impl FnOnce() -> Arc<CommittedState>) -> Arc<CommittedState> {
        let mut state = self.state.lock();
        let committed = load();
        *state.live_read_transactions.entry(committed.snapshot_id).or_insert(0) += 1;
        committed
    }

    /// Unregisters a read transaction.
    pub fn end_read(&self, snapshot_id: SnapshotId) {
        let mut state = self.state.lock();
        if let Some(count) = state.live_read_transactions.get_mut(&snapshot_id) {
            *count -= 1;
            if *count == 0 {
                state.live_read_transactions.remove(&snapshot_id);
            }
        }
    }

    /// Records the start of the write transaction that will commit as `snapshot_id`.
    ///
    /// The database's write lock guarantees there is at most one.
    pub fn start_write_transaction(&self, snapshot_id: SnapshotId) {
        let mut state = self.state.lock();
        debug_assert!(
            state.live_write_transaction.is_none(),
            "Only one write transaction allowed at a time"
        );
        state.live_write_transaction = Some(snapshot_id);
    }

    /// Ends the current write transaction.
    pub fn end_write_transaction(&self, snapshot_id: SnapshotId) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.live_write_transaction,
            Some(snapshot_id),
            "Ending wrong write transaction"
        );
        state.live_write_transaction = None;
    }

    /// Returns the oldest snapshot with a live reader, or `None` without readers.
    pub fn oldest_live_read_transaction(&self) -> Option<SnapshotId> {
        self.state.lock().live_read_transactions.keys().next().copied()
    }

    /// Returns true while a write transaction is open.
    pub fn has_active_writer(&self) -> bool {
        self.state.lock().live_write_transaction.is_some()
    }

    /// Returns the number of live read transactions.
    pub fn active_reader_count(&self) -> usize {
        self.state.lock().live_read_transactions.values().sum::<u64>() as usize
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pages replaced by commits that some reader may still reach.
///
/// Pages replaced by commit `C` were reachable from snapshots before `C` only.
/// A reader pinned at snapshot `R >= C` can never reach them, so they become
/// reusable once the oldest live reader is at or past `C`.
#[derive(Default)]
pub struct PendingFrees {
    freed_by_snapshot: BTreeMap<SnapshotId, Vec<PageId>>,
}

impl PendingFrees {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pages replaced by the commit `snapshot_id`.
    pub fn record_freed_pages(&mut self, snapshot_id: SnapshotId, pages: Vec<PageId>) {
        if !pages.is_empty() {
            self.freed_by_snapshot.entry(snapshot_id).or_default().extend(pages);
        }
    }

    /// Removes and returns every page no live reader can reach.
    ///
    /// With no readers (`None`) everything pending is returned.
    pub fn drain_freeable(&mut self, oldest_reader: Option<SnapshotId>) -> Vec<PageId> {
        let reclaimable = match oldest_reader {
            Some(oldest) => {
                let still_pinned = self.freed_by_snapshot.split_off(&oldest.next());
                std::mem::replace(&mut self.freed_by_snapshot, still_pinned)
            },
            None => std::mem::take(&mut self.freed_by_snapshot),
        };
        reclaimable.into_values().flatten().collect()
    }

    /// Returns every pending page, leaving them pending.
    pub fn pending_pages(&self) -> Vec<PageId> {
        self.freed_by_snapshot.values().flatten().copied().collect()
    }

    /// Checks if there are any pending frees.
    pub fn is_empty(&self) -> bool {
        self.freed_by_snapshot.is_empty()
    }

    /// Returns the number of pages pending free.
    pub fn pending_count(&self) -> usize {
        self.freed_by_snapshot.values().map(Vec::len).sum()
    }
}
