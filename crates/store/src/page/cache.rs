//! Shared page cache.
//!
//! Holds committed pages only. A committed page never changes under its id
//! until the id is freed and reused, and both of those events go through
//! [`PageCache::remove`] or [`PageCache::insert`], so cached copies are never stale.
//! Eviction uses the clock (second-chance) algorithm.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::Page;
use crate::error::PageId;

/// Page cache with clock eviction and hit/miss counters.
pub struct PageCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheInner {
    entries: HashMap<PageId, CacheEntry>,
    /// Clock ring of cached ids; `CacheEntry::slot` indexes into it.
    ring: Vec<PageId>,
    hand: usize,
}

struct CacheEntry {
    page: Page,
    /// Second-chance bit, set on every access.
    referenced: bool,
    slot: usize,
}

impl PageCache {
    /// Creates a cache holding at most `capacity` pages (0 disables caching).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                ring: Vec::with_capacity(capacity),
                hand: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the cached page, or `None` if not present.
    pub fn get(&self, page_id: PageId) -> Option<Page> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&page_id) {
            Some(entry) => {
                entry.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.page.clone())
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Inserts or replaces a page, evicting another one if the cache is full.
    pub fn insert(&self, page: Page) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&page.id) {
            entry.page = page;
            entry.referenced = true;
            return;
        }

        let page_id = page.id;
        let slot = if inner.entries.len() >= self.capacity {
            let slot = inner.evict_one();
            inner.ring[slot] = page_id;
            slot
        } else {
            inner.ring.push(page_id);
            inner.ring.len() - 1
        };
        inner.entries.insert(page_id, CacheEntry { page, referenced: false, slot });
    }

    /// Drops a page from the cache.
    pub fn remove(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(&page_id) else {
            return;
        };

        let slot = entry.slot;
        inner.ring.swap_remove(slot);
        if let Some(&moved) = inner.ring.get(slot)
            && let Some(moved_entry) = inner.entries.get_mut(&moved)
        {
            moved_entry.slot = slot;
        }
        if inner.hand >= inner.ring.len() {
            inner.hand = 0;
        }
    }

    /// Clears all cached pages.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.ring.clear();
        inner.hand = 0;
    }

    /// Returns the number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    /// Advances the clock hand to a victim, removes it and returns its ring slot.
    fn evict_one(&mut self) -> usize {
        loop {
            if self.hand >= self.ring.len() {
                self.hand = 0;
            }
            let slot = self.hand;
            self.hand += 1;

            let page_id = self.ring[slot];
            match self.entries.get_mut(&page_id) {
                Some(entry) if entry.referenced => entry.referenced = false,
                _ => {
                    self.entries.remove(&page_id);
                    return slot;
                },
            }
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Current number of cached pages.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}
