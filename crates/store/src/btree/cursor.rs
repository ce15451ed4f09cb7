//! B+ tree cursor for iteration and range scans.
//!
//! The cursor keeps a stack of (page, index) frames from the root down to the
//! current leaf slot. It supports:
//! - Positioning at the first entry
//! - Seeking to the first key at or after a target
//! - Prefix-bounded iteration
//! - Forward iteration (next)
//!
//! Pages are read through the [`PageReader`] of the owning transaction, so a
//! cursor only ever observes that transaction's snapshot.

use super::{
    PageReader,
    node::{BranchNodeRef, LeafNodeRef},
};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
};

/// One level of the cursor's path.
#[derive(Debug, Clone)]
struct Frame {
    page: Page,
    /// Child index in a branch, entry index in a leaf.
    index: usize,
}

/// One end of a key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound<'a> {
    /// No bound (unbounded).
    Unbounded,
    /// Inclusive bound.
    Included(&'a [u8]),
    /// Exclusive bound.
    Excluded(&'a [u8]),
}

/// Key range for bounded iteration.
#[derive(Debug, Clone, Copy)]
pub struct Range<'a> {
    /// Lower bound.
    pub start: Bound<'a>,
    /// Upper bound.
    pub end: Bound<'a>,
}

impl<'a> Range<'a> {
    /// Creates a range covering all keys.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// Creates a range from start (inclusive) to end (exclusive).
    pub fn new(start: &'a [u8], end: &'a [u8]) -> Self {
        Self { start: Bound::Included(start), end: Bound::Excluded(end) }
    }

    /// Creates a range from start to end, both inclusive.
    pub fn inclusive(start: &'a [u8], end: &'a [u8]) -> Self {
        Self { start: Bound::Included(start), end: Bound::Included(end) }
    }

    /// Creates a range starting from a key (inclusive).
    pub fn from(start: &'a [u8]) -> Self {
        Self { start: Bound::Included(start), end: Bound::Unbounded }
    }

    /// Checks if a key is within this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= start,
            Bound::Excluded(start) => key > start,
        };
        after_start && self.should_continue(key)
    }

    /// Checks if iteration should continue based on current key.
    pub fn should_continue(&self, key: &[u8]) -> bool {
        match self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key <= end,
            Bound::Excluded(end) => key < end,
        }
    }
}

/// Ordered traversal over one tree.
///
/// A fresh cursor is unpositioned; [`next`](Self::next) on it behaves like
/// [`first`](Self::first).
pub struct Cursor<R> {
    reader: R,
    root: PageId,
    /// Root first; the last frame is a leaf while positioned.
    stack: Vec<Frame>,
    /// Set by [`seek_prefix`](Self::seek_prefix); `next` stops past it.
    prefix: Option<Vec<u8>>,
    positioned: bool,
}

impl<R: PageReader> Cursor<R> {
    /// Creates a cursor over the tree rooted at `root` (0 = empty tree).
    pub fn new(reader: R, root: PageId) -> Self {
        Self { reader, root, stack: Vec::new(), prefix: None, positioned: false }
    }

    /// Moves to the smallest entry and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.prefix = None;
        self.reset();
        if self.root == 0 {
            return Ok(None);
        }
        self.descend_leftmost(self.root)?;
        self.settle()
    }

    /// Moves to the first entry whose key is `>= key` and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.prefix = None;
        self.seek_inner(key)
    }

    /// Moves to the first entry whose key starts with `prefix`.
    ///
    /// Later [`next`](Self::next) calls stop once keys no longer share the prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn seek_prefix(&mut self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.prefix = Some(prefix.to_vec());
        let entry = self.seek_inner(prefix)?;
        Ok(self.within_prefix(entry))
    }

    /// Advances to the following entry and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.positioned {
            return match self.prefix.take() {
                Some(prefix) => self.seek_prefix(&prefix),
                None => self.first(),
            };
        }
        let Some(leaf) = self.stack.last_mut() else {
            return Ok(None);
        };
        leaf.index += 1;
        let entry = self.settle()?;
        Ok(self.within_prefix(entry))
    }

    /// Returns the entry under the cursor without moving it.
    ///
    /// # Errors
    ///
    /// Returns an error if the current page is not a leaf.
    pub fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(frame) = self.stack.last() else {
            return Ok(None);
        };
        let leaf = LeafNodeRef::from_page(&frame.page)?;
        if frame.index >= leaf.cell_count() {
            return Ok(None);
        }
        let (key, value) = leaf.get(frame.index);
        Ok(self.within_prefix(Some((key.to_vec(), value.to_vec()))))
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.positioned = true;
    }

    fn seek_inner(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.reset();
        if self.root == 0 {
            return Ok(None);
        }

        let mut page_id = self.root;
        loop {
            let page = self.reader.read_page(page_id)?;
            match page.page_type()? {
                PageType::Branch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    let index = branch.child_index_for_key(key);
                    page_id = branch.child(index);
                    self.stack.push(Frame { page, index });
                },
                PageType::Leaf => {
                    let index = LeafNodeRef::from_page(&page)?.search(key).index();
                    self.stack.push(Frame { page, index });
                    return self.settle();
                },
                found => return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
            }
        }
    }

    /// Pushes frames down the leftmost path of the subtree at `page_id`.
    fn descend_leftmost(&mut self, mut page_id: PageId) -> Result<()> {
        loop {
            let page = self.reader.read_page(page_id)?;
            match page.page_type()? {
                PageType::Branch => {
                    page_id = BranchNodeRef::from_page(&page)?.child(0);
                    self.stack.push(Frame { page, index: 0 });
                },
                PageType::Leaf => {
                    self.stack.push(Frame { page, index: 0 });
                    return Ok(());
                },
                found => return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
            }
        }
    }

    /// Moves forward from an exhausted leaf slot to the next existing entry.
    fn settle(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(frame) = self.stack.last() else {
                return Ok(None);
            };
            let leaf = LeafNodeRef::from_page(&frame.page)?;
            if frame.index < leaf.cell_count() {
                let (key, value) = leaf.get(frame.index);
                return Ok(Some((key.to_vec(), value.to_vec())));
            }

            // Climb to the nearest branch with an unvisited child.
            self.stack.pop();
            let next_child = loop {
                let Some(parent) = self.stack.last_mut() else {
                    return Ok(None);
                };
                let branch = BranchNodeRef::from_page(&parent.page)?;
                if parent.index + 1 < branch.child_count() {
                    parent.index += 1;
                    break branch.child(parent.index);
                }
                self.stack.pop();
            };
            self.descend_leftmost(next_child)?;
        }
    }

    fn within_prefix(&self, entry: Option<(Vec<u8>, Vec<u8>)>) -> Option<(Vec<u8>, Vec<u8>)> {
        match &self.prefix {
            Some(prefix) => entry.filter(|(key, _)| key.starts_with(prefix)),
            None => entry,
        }
    }
}

/// Iterator over the entries of a cursor within a range or under a prefix.
pub struct Entries<'a, R> {
    cursor: Cursor<R>,
    range: Range<'a>,
    prefix: Option<&'a [u8]>,
    started: bool,
    done: bool,
}

impl<'a, R: PageReader> Entries<'a, R> {
    /// Iterates the entries of `cursor` that fall within `range`.
    pub fn new(cursor: Cursor<R>, range: Range<'a>) -> Self {
        Self { cursor, range, prefix: None, started: false, done: false }
    }

    /// Iterates the entries of `cursor` whose keys start with `prefix`.
    pub fn with_prefix(cursor: Cursor<R>, prefix: &'a [u8]) -> Self {
        Self {
            cursor,
            range: Range::from(prefix),
            prefix: Some(prefix),
            started: false,
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.started {
            return self.cursor.next();
        }
        self.started = true;

        if let Some(prefix) = self.prefix {
            return self.cursor.seek_prefix(prefix);
        }
        match self.range.start {
            Bound::Unbounded => self.cursor.first(),
            Bound::Included(start) => self.cursor.seek(start),
            Bound::Excluded(start) => match self.cursor.seek(start)? {
                Some((key, _)) if key == start => self.cursor.next(),
                entry => Ok(entry),
            },
        }
    }
}

impl<R: PageReader> Iterator for Entries<'_, R> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some((key, value))) if self.range.should_continue(&key) => Some(Ok((key, value))),
            Ok(_) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTree, test_support::TestPageProvider};

    fn tree_with(keys: &[&str]) -> BTree<TestPageProvider> {
        let mut tree = BTree::new(0, TestPageProvider::new(512));
        for key in keys {
            tree.insert(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        tree
    }

    fn numbered(count: u32) -> BTree<TestPageProvider> {
        let mut tree = BTree::new(0, TestPageProvider::new(512));
        for i in 0..count {
            tree.insert(format!("k{i:05}").as_bytes(), &[0; 24]).unwrap();
        }
        tree
    }

    fn keys<R: PageReader>(entries: Entries<'_, R>) -> Vec<String> {
        entries.map(|entry| String::from_utf8(entry.unwrap().0).unwrap()).collect()
    }

    #[test]
    fn test_range_contains() {
        let range = Range::new(b"apple", b"cherry");

        assert!(!range.contains(b"aardvark"));
        assert!(range.contains(b"apple"));
        assert!(range.contains(b"banana"));
        assert!(!range.contains(b"cherry")); // Exclusive end
        assert!(!range.contains(b"zebra"));

        assert!(Range::inclusive(b"apple", b"cherry").contains(b"cherry"));
        assert!(Range::all().contains(b"\xff\xff\xff"));
    }

    #[test]
    fn test_empty_tree_cursor() {
        let tree = BTree::new(0, TestPageProvider::new(512));
        let mut cursor = tree.cursor();
        assert_eq!(cursor.first().unwrap(), None);
        assert_eq!(cursor.seek(b"a").unwrap(), None);
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn test_first_and_next_visit_in_order() {
        let tree = tree_with(&["c", "a", "b"]);
        let mut cursor = tree.cursor();

        assert_eq!(cursor.first().unwrap(), Some((b"a".to_vec(), b"A".to_vec())));
        assert_eq!(cursor.current().unwrap(), Some((b"a".to_vec(), b"A".to_vec())));
        assert_eq!(cursor.next().unwrap().unwrap().0, b"b");
        assert_eq!(cursor.next().unwrap().unwrap().0, b"c");
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn test_unpositioned_next_starts_at_first() {
        let tree = tree_with(&["b", "a"]);
        let mut cursor = tree.cursor();
        assert_eq!(cursor.next().unwrap().unwrap().0, b"a");
    }

    #[test]
    fn test_seek_positions_at_or_after_key() {
        let tree = numbered(300);
        let mut cursor = tree.cursor();

        assert_eq!(cursor.seek(b"k00150").unwrap().unwrap().0, b"k00150");
        assert_eq!(cursor.next().unwrap().unwrap().0, b"k00151");
        assert_eq!(cursor.seek(b"k00150x").unwrap().unwrap().0, b"k00151");
        assert_eq!(cursor.seek(b"a").unwrap().unwrap().0, b"k00000");
        assert_eq!(cursor.seek(b"k00299").unwrap().unwrap().0, b"k00299");
        assert_eq!(cursor.seek(b"z").unwrap(), None);
    }

    #[test]
    fn test_traversal_crosses_leaves() {
        let tree = numbered(300);
        assert!(tree.depth().unwrap() >= 2);

        let mut cursor = tree.cursor();
        let mut count = 1;
        let mut previous = cursor.first().unwrap().unwrap().0;
        while let Some((key, _)) = cursor.next().unwrap() {
            assert!(key > previous);
            previous = key;
            count += 1;
        }
        assert_eq!(count, 300);
    }

    #[test]
    fn test_seek_prefix_stops_at_prefix_end() {
        let tree = tree_with(&["fa", "foe", "foo", "food", "fp", "g"]);
        let mut cursor = tree.cursor();

        assert_eq!(cursor.seek_prefix(b"fo").unwrap().unwrap().0, b"foe");
        assert_eq!(cursor.next().unwrap().unwrap().0, b"foo");
        assert_eq!(cursor.next().unwrap().unwrap().0, b"food");
        assert_eq!(cursor.next().unwrap(), None);

        assert_eq!(cursor.seek_prefix(b"x").unwrap(), None);
        assert_eq!(cursor.seek_prefix(b"fq").unwrap(), None);
    }

    #[test]
    fn test_entries_ranges() {
        let tree = tree_with(&["a", "b", "c", "d", "e"]);

        assert_eq!(keys(Entries::new(tree.cursor(), Range::all())), ["a", "b", "c", "d", "e"]);
        assert_eq!(keys(Entries::new(tree.cursor(), Range::new(b"b", b"d"))), ["b", "c"]);
        let inclusive = Entries::new(tree.cursor(), Range::inclusive(b"b", b"d"));
        assert_eq!(keys(inclusive), ["b", "c", "d"]);

        let exclusive = Range { start: Bound::Excluded(b"b"), end: Bound::Unbounded };
        assert_eq!(keys(Entries::new(tree.cursor(), exclusive)), ["c", "d", "e"]);

        let between = Range { start: Bound::Excluded(b"bb"), end: Bound::Included(b"cc") };
        assert_eq!(keys(Entries::new(tree.cursor(), between)), ["c"]);

        assert!(keys(Entries::new(tree.cursor(), Range::new(b"x", b"z"))).is_empty());
    }

    #[test]
    fn test_entries_prefix() {
        let tree = tree_with(&["app", "apple", "apply", "b"]);
        assert_eq!(keys(Entries::with_prefix(tree.cursor(), b"appl")), ["apple", "apply"]);
        assert_eq!(keys(Entries::with_prefix(tree.cursor(), b"")), ["app", "apple", "apply", "b"]);
    }

    #[test]
    fn test_cursor_skips_empty_leaves() {
        let mut tree = numbered(300);
        // Deleting a run in the middle may leave sparse leaves; traversal must not stall.
        for i in 100..200u32 {
            tree.delete(format!("k{i:05}").as_bytes()).unwrap();
        }
        let mut cursor = tree.cursor();
        assert_eq!(cursor.seek(b"k00100").unwrap().unwrap().0, b"k00200");
        assert_eq!(keys(Entries::new(tree.cursor(), Range::all())).len(), 200);
    }
}
