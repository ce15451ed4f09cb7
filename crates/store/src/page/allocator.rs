//! Free-list page allocator.
//!
//! All pages share one size, so allocation is a matter of picking an id:
//! the lowest free id first, otherwise the next id past the high-water mark.
//! Keeping the free set ordered lets [`PageAllocator::allocate_contiguous`]
//! find runs of adjacent pages and keeps the file compact.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::error::{Error, PageId, Result};

/// First page id handed out; page 0 is reserved as the null page.
pub const FIRST_PAGE_ID: PageId = 1;

/// Free-list based page allocator.
///
/// Only ids the caller has proven unreachable by every live snapshot may be
/// handed to [`free`](Self::free); deferral is the caller's job.
pub struct PageAllocator {
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    /// Reusable page ids, ordered so the lowest is reused first.
    free: BTreeSet<PageId>,
    /// Next page id past the high-water mark.
    next_page: PageId,
    /// Upper bound on `next_page`, if the store is size-limited.
    max_pages: Option<u64>,
}

impl PageAllocator {
    /// Creates an allocator whose high-water mark starts at `next_page`.
    pub fn new(next_page: PageId, max_pages: Option<u64>) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                free: BTreeSet::new(),
                next_page: next_page.max(FIRST_PAGE_ID),
                max_pages,
            }),
        }
    }

    /// Allocates one page, preferring the lowest reusable id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the high-water mark would pass `max_pages`.
    pub fn allocate(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(page_id) = state.free.pop_first() {
            return Ok(page_id);
        }
        state.grow(1)
    }

    /// Allocates `count` adjacent pages and returns the first id of the run.
    ///
    /// Reuses a free run when one exists; otherwise the run is carved from the
    /// end of the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the high-water mark would pass `max_pages`.
    pub fn allocate_contiguous(&self, count: u64) -> Result<PageId> {
        let mut state = self.state.lock();
        if count == 0 {
            return Err(Error::Corrupted { reason: "zero-length page run".to_string() });
        }

        if let Some(start) = state.find_free_run(count) {
            for page_id in start..start + count {
                state.free.remove(&page_id);
            }
            return Ok(start);
        }

        state.grow(count)
    }

    /// Returns a page to the free set.
    pub fn free(&self, page_id: PageId) {
        let inserted = self.state.lock().free.insert(page_id);
        debug_assert!(inserted, "page {page_id} freed twice");
    }

    /// Returns several pages to the free set.
    pub fn free_batch(&self, page_ids: impl IntoIterator<Item = PageId>) {
        let mut state = self.state.lock();
        for page_id in page_ids {
            let inserted = state.free.insert(page_id);
            debug_assert!(inserted, "page {page_id} freed twice");
        }
    }

    /// Replaces the free set (used when loading or rebuilding the free list).
    pub fn init_free_list(&self, page_ids: impl IntoIterator<Item = PageId>) {
        let mut state = self.state.lock();
        state.free = page_ids.into_iter().filter(|&id| id >= FIRST_PAGE_ID).collect();
    }

    /// Returns the next page id past the high-water mark.
    pub fn next_page_id(&self) -> PageId {
        self.state.lock().next_page
    }

    /// Returns the number of reusable pages.
    pub fn free_page_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Returns the reusable page ids in ascending order.
    pub fn free_pages(&self) -> Vec<PageId> {
        self.state.lock().free.iter().copied().collect()
    }

    /// Checks whether `page_id` is currently reusable.
    pub fn is_free(&self, page_id: PageId) -> bool {
        self.state.lock().free.contains(&page_id)
    }
}

impl AllocatorState {
    fn grow(&mut self, count: u64) -> Result<PageId> {
        let start = self.next_page;
        let end = start.checked_add(count).ok_or(Error::OutOfSpace)?;
        if let Some(max) = self.max_pages
            && end > max
        {
            return Err(Error::OutOfSpace);
        }
        self.next_page = end;
        Ok(start)
    }

    /// Finds the lowest run of `count` consecutive free ids.
    fn find_free_run(&self, count: u64) -> Option<PageId> {
        let mut run_start = 0;
        let mut run_len = 0u64;
        let mut prev: Option<PageId> = None;

        for &page_id in &self.free {
            if prev.is_some_and(|p| p + 1 == page_id) {
                run_len += 1;
            } else {
                run_start = page_id;
                run_len = 1;
            }
            if run_len == count {
                return Some(run_start);
            }
            prev = Some(page_id);
        }
        None
    }
}
