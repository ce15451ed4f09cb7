//! Integrity scrubber for detecting silent data corruption.
//!
//! Walks the committed bucket directory and every bucket tree, verifying page
//! checksums and B+ tree structural invariants, then cross-checks the
//! reachable pages against the free list. Pages are read raw, bypassing the
//! cache, to verify what is actually on disk.

use std::collections::HashSet;

use crate::{
    Database,
    backend::StorageBackend,
    btree::node::{BranchNodeRef, LeafNodeRef},
    bucket,
    error::{Error, PageId, PageType},
    page::{FIRST_PAGE_ID, Page},
};

/// Result of an integrity scrub cycle.
#[derive(Debug, Clone, Default)]
pub struct ScrubResult {
    /// Number of pages checked.
    pub pages_checked: u64,
    /// Number of checksum errors detected.
    pub checksum_errors: u64,
    /// Number of structural errors detected (key ordering, invalid page types).
    pub structural_errors: u64,
    /// Pages both reachable and free, reachable twice, or neither reachable nor free.
    pub accounting_errors: u64,
    /// Detailed error descriptions.
    pub errors: Vec<ScrubError>,
}

impl ScrubResult {
    /// Returns true when no error of any kind was found.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: ScrubResult) {
        self.pages_checked += other.pages_checked;
        self.checksum_errors += other.checksum_errors;
        self.structural_errors += other.structural_errors;
        self.accounting_errors += other.accounting_errors;
        self.errors.extend(other.errors);
    }

    fn structural(&mut self, page_id: PageId, bucket: Option<&[u8]>, description: String) {
        self.structural_errors += 1;
        self.errors.push(ScrubError::new(page_id, bucket, description));
    }

    fn accounting(&mut self, page_id: PageId, description: String) {
        self.accounting_errors += 1;
        self.errors.push(ScrubError::new(page_id, None, description));
    }
}

/// A single integrity error detected during scrubbing.
#[derive(Debug, Clone)]
pub struct ScrubError {
    /// The page where the error was detected.
    pub page_id: PageId,
    /// The bucket this page belongs to; `None` for the directory or unowned pages.
    pub bucket: Option<String>,
    /// Human-readable description of the error.
    pub description: String,
}

impl ScrubError {
    fn new(page_id: PageId, bucket: Option<&[u8]>, description: String) -> Self {
        Self {
            page_id,
            bucket: bucket.map(|name| String::from_utf8_lossy(name).into_owned()),
            description,
        }
    }
}

/// Key interval a subtree must stay within: `lower <= key < upper`.
#[derive(Clone, Copy, Default)]
struct KeyBounds<'k> {
    lower: Option<&'k [u8]>,
    upper: Option<&'k [u8]>,
}

impl KeyBounds<'_> {
    fn contains(&self, key: &[u8]) -> bool {
        self.lower.is_none_or(|lower| key >= lower) && self.upper.is_none_or(|upper| key < upper)
    }
}

/// State of one tree walk.
struct TreeWalk<'s> {
    bucket: Option<&'s [u8]>,
    /// Depth of the first leaf reached; every other leaf must match.
    leaf_depth: Option<u32>,
    /// Directory entries collected from leaves (directory walk only).
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Integrity scrubber for a store database.
///
/// Verifies page checksums and B+ tree structural invariants to detect
/// silent data corruption. Structural walks pin a read snapshot so the
/// pages they visit cannot be reused mid-walk.
pub struct IntegrityScrubber<'a, B: StorageBackend> {
    db: &'a Database<B>,
}

impl<'a, B: StorageBackend> IntegrityScrubber<'a, B> {
    /// Creates a scrubber for the given database.
    pub fn new(db: &'a Database<B>) -> Self {
        Self { db }
    }

    /// Runs every check: tree structure with checksums, then page accounting.
    ///
    /// Page accounting expects no write transaction to be open; pages held by
    /// a live writer would be reported as unaccounted.
    pub fn scrub(&self) -> ScrubResult {
        let (mut result, reachable) = self.walk_all();
        if result.structural_errors == 0 {
            result.merge(self.check_accounting(&reachable));
        }

        if result.is_clean() {
            tracing::debug!(pages_checked = result.pages_checked, "Integrity scrub clean");
        } else {
            tracing::warn!(
                pages_checked = result.pages_checked,
                checksum_errors = result.checksum_errors,
                structural_errors = result.structural_errors,
                accounting_errors = result.accounting_errors,
                "Integrity scrub found errors"
            );
        }
        result
    }

    /// Verifies checksums for the specified page IDs.
    ///
    /// Reads each page raw (bypassing cache) and verifies its stored checksum
    /// against a freshly computed one. Pages that are on the free list or
    /// unallocated are skipped.
    pub fn verify_page_checksums(&self, page_ids: &[PageId]) -> ScrubResult {
        let free_pages: HashSet<PageId> = self.db.free_page_ids().into_iter().collect();
        let total_pages = self.db.total_page_count();
        let mut result = ScrubResult::default();

        for &page_id in page_ids {
            if page_id < FIRST_PAGE_ID || page_id >= total_pages || free_pages.contains(&page_id) {
                continue;
            }

            match self.db.read_raw_page(page_id) {
                Ok(page) => {
                    result.pages_checked += 1;
                    self.check_checksum(&page, None, &mut result);
                },
                // Allocated by a live writer but not yet written.
                Err(Error::PageNotFound { .. }) => {},
                Err(e) => {
                    result.pages_checked += 1;
                    result.checksum_errors += 1;
                    result.errors.push(ScrubError::new(
                        page_id,
                        None,
                        format!("Failed to read page {page_id}: {e}"),
                    ));
                },
            }
        }

        result
    }

    /// Verifies B+ tree structural invariants for the directory and every bucket.
    ///
    /// Checks:
    /// - Page checksums and types (branches and leaves only)
    /// - Strictly ascending keys within every node
    /// - Every key within the bounds set by the parent separators
    /// - All leaves of a tree at the same depth
    /// - No page reachable twice
    /// - Directory values are 8-byte root page ids
    pub fn verify_btree_invariants(&self) -> ScrubResult {
        self.walk_all().0
    }

    /// Walks every committed tree, returning the result and the reachable pages.
    fn walk_all(&self) -> (ScrubResult, HashSet<PageId>) {
        let mut result = ScrubResult::default();
        let mut reachable = HashSet::new();

        let snapshot = match self.db.read() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                result.structural(0, None, format!("Cannot pin a read snapshot: {e}"));
                return (result, reachable);
            },
        };

        let mut directory = TreeWalk { bucket: None, leaf_depth: None, entries: Vec::new() };
        self.verify_subtree(
            snapshot.directory_root(),
            KeyBounds::default(),
            0,
            &mut directory,
            &mut reachable,
            &mut result,
        );

        for (name, value) in &directory.entries {
            let root = match bucket::decode_root(name, value) {
                Ok(root) => root,
                Err(e) => {
                    result.structural(0, Some(name), e.to_string());
                    continue;
                },
            };
            let mut walk = TreeWalk { bucket: Some(name), leaf_depth: None, entries: Vec::new() };
            self.verify_subtree(
                root,
                KeyBounds::default(),
                0,
                &mut walk,
                &mut reachable,
                &mut result,
            );
        }

        (result, reachable)
    }

    /// Recursively verifies a subtree rooted at the given page.
    fn verify_subtree(
        &self,
        page_id: PageId,
        bounds: KeyBounds<'_>,
        depth: u32,
        walk: &mut TreeWalk<'_>,
        reachable: &mut HashSet<PageId>,
        result: &mut ScrubResult,
    ) {
        if page_id == 0 {
            // Empty tree.
            return;
        }
        if !reachable.insert(page_id) {
            result.accounting(page_id, format!("Page {page_id} is reachable more than once"));
            return;
        }
        if page_id >= self.db.total_page_count() {
            result.structural(
                page_id,
                walk.bucket,
                format!("Page {page_id} is past the end of the file"),
            );
            return;
        }

        let page = match self.db.read_raw_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                result.structural(page_id, walk.bucket, format!("Cannot read page {page_id}: {e}"));
                return;
            },
        };
        result.pages_checked += 1;
        if !self.check_checksum(&page, walk.bucket, result) {
            return;
        }

        match page.page_type() {
            Ok(PageType::Leaf) => self.verify_leaf(&page, bounds, depth, walk, result),
            Ok(PageType::Branch) => {
                self.verify_branch(&page, bounds, depth, walk, reachable, result);
            },
            Ok(other) => result.structural(
                page_id,
                walk.bucket,
                format!("Unexpected page type {other:?} in B+ tree"),
            ),
            Err(e) => {
                result.structural(page_id, walk.bucket, format!("Invalid page header: {e}"));
            },
        }
    }

    /// Verifies leaf key ordering, bounds and depth.
    fn verify_leaf(
        &self,
        page: &Page,
        bounds: KeyBounds<'_>,
        depth: u32,
        walk: &mut TreeWalk<'_>,
        result: &mut ScrubResult,
    ) {
        let leaf = match LeafNodeRef::from_page(page) {
            Ok(leaf) => leaf,
            Err(e) => {
                result.structural(page.id, walk.bucket, format!("Cannot parse leaf node: {e}"));
                return;
            },
        };

        match walk.leaf_depth {
            None => walk.leaf_depth = Some(depth),
            Some(expected) if expected != depth => {
                result.structural(
                    page.id,
                    walk.bucket,
                    format!("Leaf at depth {depth}, expected {expected}"),
                );
            },
            Some(_) => {},
        }

        for i in 0..leaf.cell_count() {
            let key = leaf.key(i);
            if i > 0 && leaf.key(i - 1) >= key {
                result.structural(
                    page.id,
                    walk.bucket,
                    format!("Key ordering violation in leaf: key[{}] >= key[{i}]", i - 1),
                );
                // One error per node.
                return;
            }
            if !bounds.contains(key) {
                result.structural(
                    page.id,
                    walk.bucket,
                    format!("Key {i} lies outside the parent separator bounds"),
                );
                return;
            }
        }

        if walk.bucket.is_none() {
            walk.entries.extend(
                (0..leaf.cell_count()).map(|i| (leaf.key(i).to_vec(), leaf.value(i).to_vec())),
            );
        }
    }

    /// Verifies separator ordering and bounds, then recurses into children.
    fn verify_branch(
        &self,
        page: &Page,
        bounds: KeyBounds<'_>,
        depth: u32,
        walk: &mut TreeWalk<'_>,
        reachable: &mut HashSet<PageId>,
        result: &mut ScrubResult,
    ) {
        let branch = match BranchNodeRef::from_page(page) {
            Ok(branch) => branch,
            Err(e) => {
                result.structural(page.id, walk.bucket, format!("Cannot parse branch node: {e}"));
                return;
            },
        };

        if branch.key_count() == 0 {
            result.structural(page.id, walk.bucket, "Branch node without separators".to_string());
            return;
        }
        for i in 0..branch.key_count() {
            let key = branch.key(i);
            if i > 0 && branch.key(i - 1) >= key {
                result.structural(
                    page.id,
                    walk.bucket,
                    format!("Separator ordering violation: key[{}] >= key[{i}]", i - 1),
                );
                return;
            }
            if !bounds.contains(key) {
                result.structural(
                    page.id,
                    walk.bucket,
                    format!("Separator {i} lies outside the parent bounds"),
                );
                return;
            }
        }

        // Child i holds keys in [key(i - 1), key(i)).
        for i in 0..branch.child_count() {
            let child_bounds = KeyBounds {
                lower: if i == 0 { bounds.lower } else { Some(branch.key(i - 1)) },
                upper: if i == branch.key_count() { bounds.upper } else { Some(branch.key(i)) },
            };
            self.verify_subtree(branch.child(i), child_bounds, depth + 1, walk, reachable, result);
        }
    }

    /// Cross-checks reachable pages against the free and pending lists.
    fn check_accounting(&self, reachable: &HashSet<PageId>) -> ScrubResult {
        let mut result = ScrubResult::default();
        let free: HashSet<PageId> = self.db.free_page_ids().into_iter().collect();
        let pending: HashSet<PageId> = self.db.pending_free_page_ids().into_iter().collect();

        for page_id in FIRST_PAGE_ID..self.db.total_page_count() {
            let is_reachable = reachable.contains(&page_id);
            let is_free = free.contains(&page_id);
            let is_pending = pending.contains(&page_id);

            if is_reachable && (is_free || is_pending) {
                result.accounting(page_id, format!("Reachable page {page_id} is on the free list"));
            } else if is_free && is_pending {
                result.accounting(page_id, format!("Page {page_id} is both free and pending"));
            } else if !is_reachable && !is_free && !is_pending {
                result.accounting(page_id, format!("Page {page_id} is neither reachable nor free"));
            }
        }
        result
    }

    /// Records a checksum error; returns true if the checksum verified.
    fn check_checksum(&self, page: &Page, bucket: Option<&[u8]>, result: &mut ScrubResult) -> bool {
        if page.verify_checksum() {
            return true;
        }
        result.checksum_errors += 1;
        result.errors.push(ScrubError::new(
            page.id,
            bucket,
            format!("Checksum mismatch on page {}", page.id),
        ));
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{InMemoryBackend, db::DatabaseConfig};

    fn populated(keys: u32) -> Database<InMemoryBackend> {
        let config = DatabaseConfig::builder().page_size(512).build();
        let db = Database::open_in_memory_with_config(config).unwrap();
        {
            let mut txn = db.write().unwrap();
            txn.create_bucket(b"alpha").unwrap();
            txn.create_bucket(b"beta").unwrap();
            for i in 0..keys {
                let key = format!("key_{i:04}").into_bytes();
                let value = format!("value_{i}").into_bytes();
                txn.insert(b"alpha", &key, &value).unwrap();
                txn.insert(b"beta", &value, &key).unwrap();
            }
            txn.commit().unwrap();
        }
        db
    }

    /// Overwrites a page in the backend, bypassing checksums and cache.
    fn corrupt_page(db: &Database<InMemoryBackend>, page_id: PageId, offset: usize) {
        let mut page = db.read_raw_page(page_id).unwrap();
        page.data[offset] ^= 0xFF;
        db.backend().write_page(page_id, &page.data).unwrap();
    }

    #[test]
    fn test_scrub_empty_database() {
        let db = Database::open_in_memory().unwrap();
        let scrubber = IntegrityScrubber::new(&db);

        let result = scrubber.verify_page_checksums(&[]);
        assert_eq!(result.pages_checked, 0);

        let result = scrubber.scrub();
        assert_eq!(result.pages_checked, 0);
        assert!(result.is_clean(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_scrub_valid_database() {
        let db = populated(300);
        let result = IntegrityScrubber::new(&db).scrub();

        assert!(result.pages_checked > 3);
        assert!(result.is_clean(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_scrub_valid_pages() {
        let db = populated(50);
        let page_ids: Vec<PageId> = (0..db.total_page_count()).collect();
        let result = IntegrityScrubber::new(&db).verify_page_checksums(&page_ids);

        assert!(result.pages_checked > 0);
        assert_eq!(result.checksum_errors, 0, "errors: {:?}", result.errors);
    }

    #[test]
    fn test_scrub_detects_corrupted_checksum() {
        let db = populated(1);
        let root = {
            let txn = db.read().unwrap();
            bucket::lookup_root(&SnapshotReader(&db), txn.directory_root(), b"alpha")
                .unwrap()
                .unwrap()
        };
        corrupt_page(&db, root, 40);

        let scrubber = IntegrityScrubber::new(&db);
        let result = scrubber.verify_page_checksums(&[root]);
        assert_eq!(result.pages_checked, 1);
        assert_eq!(result.checksum_errors, 1);
        assert!(result.errors[0].description.contains("Checksum mismatch"));

        let result = scrubber.verify_btree_invariants();
        assert_eq!(result.checksum_errors, 1);
        assert_eq!(result.errors[0].bucket.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_btree_invariants_multi_level() {
        let db = populated(400);
        assert!(db.read().unwrap().bucket_depth(b"alpha").unwrap() >= 2);

        let result = IntegrityScrubber::new(&db).verify_btree_invariants();
        assert!(result.pages_checked > 10);
        assert_eq!(result.structural_errors, 0, "errors: {:?}", result.errors);
    }

    #[test]
    fn test_accounting_after_deletes() {
        let db = populated(200);
        {
            let mut txn = db.write().unwrap();
            for i in 0..150u32 {
                txn.delete(b"alpha", format!("key_{i:04}").as_bytes()).unwrap();
            }
            txn.delete_bucket(b"beta").unwrap();
            txn.commit().unwrap();
        }
        assert!(!db.free_page_ids().is_empty());

        let result = IntegrityScrubber::new(&db).scrub();
        assert!(result.is_clean(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_scrub_skips_free_pages() {
        let db = populated(100);
        {
            let mut txn = db.write().unwrap();
            txn.delete_bucket(b"alpha").unwrap();
            txn.commit().unwrap();
        }

        let free_pages = db.free_page_ids();
        assert!(!free_pages.is_empty());
        let result = IntegrityScrubber::new(&db).verify_page_checksums(&free_pages);
        assert_eq!(result.pages_checked, 0);
    }

    #[test]
    fn test_scrub_skips_out_of_range_pages() {
        let db = Database::open_in_memory().unwrap();
        let result = IntegrityScrubber::new(&db).verify_page_checksums(&[0, 999_999]);
        assert_eq!(result.pages_checked, 0);
    }

    #[test]
    fn test_key_bounds() {
        let bounds = KeyBounds { lower: Some(&b"b"[..]), upper: Some(&b"d"[..]) };
        assert!(!bounds.contains(b"a"));
        assert!(bounds.contains(b"b"));
        assert!(bounds.contains(b"c"));
        assert!(!bounds.contains(b"d"));
        assert!(KeyBounds::default().contains(b""));
    }

    #[test]
    fn test_scrub_result_default() {
        let result = ScrubResult::default();
        assert_eq!(result.pages_checked, 0);
        assert_eq!(result.checksum_errors, 0);
        assert_eq!(result.structural_errors, 0);
        assert_eq!(result.accounting_errors, 0);
        assert!(result.is_clean());
    }

    /// Raw page reader for locating bucket roots in tests.
    struct SnapshotReader<'a>(&'a Database<InMemoryBackend>);

    impl crate::btree::PageReader for SnapshotReader<'_> {
        fn read_page(&self, page_id: PageId) -> crate::Result<Page> {
            self.0.read_raw_page(page_id)
        }

        fn page_size(&self) -> usize {
            self.0.page_size()
        }
    }
}
