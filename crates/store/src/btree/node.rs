//! B+ tree node layout.
//!
//! Nodes are slotted pages: a cell-pointer array grows up from the header
//! while cells are packed down from the end of the page. The page header's
//! item count is the cell count.
//!
//! ## Leaf Node Layout
//! ```text
//! [Page Header: 16 bytes]
//! [Cell Pointers: 2 bytes each, ascending key order]
//! ... free space ...
//! [Cells: (key_len:2, val_len:2, key_bytes, val_bytes)]
//! ```
//!
//! ## Branch Node Layout
//! ```text
//! [Page Header: 16 bytes]
//! [Rightmost Child: 8 bytes]
//! [Cell Pointers: 2 bytes each]
//! ... free space ...
//! [Cells: (key_len:2, child_page:8, key_bytes)]
//! ```
//!
//! A branch with keys `k0..kn` has children `c0..=cn` (`cn` is the rightmost
//! child). Keys below `k0` live under `c0`; keys in `k(i-1)..ki` under `ci`.
//!
//! Readers use the zero-copy [`LeafNodeRef`] / [`BranchNodeRef`] views.
//! Writers decode into owned [`LeafNode`] / [`BranchNode`] values, edit them and
//! encode the result into a freshly allocated page, so pages never fragment.

use std::cmp::Ordering;

use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page, read_u64_le},
};

/// Size of a cell pointer.
const CELL_PTR_SIZE: usize = 2;

/// Leaf cell overhead: pointer + key_len + val_len.
const LEAF_CELL_OVERHEAD: usize = CELL_PTR_SIZE + 2 + 2;

/// Branch cell overhead: pointer + key_len + child.
const BRANCH_CELL_OVERHEAD: usize = CELL_PTR_SIZE + 2 + 8;

/// Offset of the rightmost child in branch pages.
const RIGHTMOST_CHILD_OFFSET: usize = PAGE_HEADER_SIZE;

/// Offset where leaf cell pointers begin.
const LEAF_CELL_PTRS_OFFSET: usize = PAGE_HEADER_SIZE;

/// Offset where branch cell pointers begin (after the rightmost child).
const BRANCH_CELL_PTRS_OFFSET: usize = PAGE_HEADER_SIZE + 8;

/// Returns the largest key accepted for `page_size`.
pub fn max_key_size(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 4
}

/// Returns the largest key plus value accepted for `page_size`.
pub fn max_entry_size(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 2
}

/// Validates a key/value pair against the page size.
///
/// # Errors
///
/// Returns [`Error::EmptyKey`], [`Error::KeyTooLarge`] or [`Error::ValueTooLarge`].
pub fn check_entry(key: &[u8], value: &[u8], page_size: usize) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    let max_key = max_key_size(page_size);
    if key.len() > max_key {
        return Err(Error::KeyTooLarge { size: key.len(), max: max_key });
    }
    let max_entry = max_entry_size(page_size);
    if key.len() + value.len() > max_entry {
        return Err(Error::ValueTooLarge { size: key.len() + value.len(), max: max_entry });
    }
    Ok(())
}

/// A search result for finding a key in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key was found at this index.
    Found(usize),
    /// Key was not found; this is where it would be inserted.
    NotFound(usize),
}

impl SearchResult {
    /// Returns the index, whether found or not.
    pub fn index(&self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => *i,
        }
    }

    /// Returns true if the key was found.
    pub fn is_found(&self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

fn check_page_type(page: &Page, expected: PageType) -> Result<()> {
    let found = page.page_type()?;
    if found != expected {
        return Err(Error::PageTypeMismatch { expected, found });
    }
    Ok(())
}

fn read_u16(data: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([data[offset], data[offset + 1]]) as usize
}

fn corrupted(page: &Page, what: &str) -> Error {
    Error::Corrupted { reason: format!("page {}: {what}", page.id) }
}

// ============================================================================
// Read-only views
// ============================================================================

/// Read-only view of a leaf page.
pub struct LeafNodeRef<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> LeafNodeRef<'a> {
    /// Wraps a page as a leaf node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] for non-leaf pages and
    /// [`Error::Corrupted`] if the cell-pointer array overruns the page.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        check_page_type(page, PageType::Leaf)?;
        let count = page.item_count() as usize;
        if LEAF_CELL_PTRS_OFFSET + count * CELL_PTR_SIZE > page.size() {
            return Err(corrupted(page, "leaf cell count exceeds page"));
        }
        Ok(Self { data: &page.data, count })
    }

    /// Returns the number of entries.
    pub fn cell_count(&self) -> usize {
        self.count
    }

    fn cell_ptr(&self, index: usize) -> usize {
        read_u16(self.data, LEAF_CELL_PTRS_OFFSET + index * CELL_PTR_SIZE)
    }

    /// Returns the key at `index`.
    pub fn key(&self, index: usize) -> &'a [u8] {
        let cell = self.cell_ptr(index);
        let key_len = read_u16(self.data, cell);
        &self.data[cell + 4..cell + 4 + key_len]
    }

    /// Returns the value at `index`.
    pub fn value(&self, index: usize) -> &'a [u8] {
        let cell = self.cell_ptr(index);
        let key_len = read_u16(self.data, cell);
        let val_len = read_u16(self.data, cell + 2);
        let start = cell + 4 + key_len;
        &self.data[start..start + val_len]
    }

    /// Returns the key and value at `index`.
    pub fn get(&self, index: usize) -> (&'a [u8], &'a [u8]) {
        (self.key(index), self.value(index))
    }

    /// Binary search for a key.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        let mut lo = 0;
        let mut hi = self.count;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match key.cmp(self.key(mid)) {
                Ordering::Equal => return SearchResult::Found(mid),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }

        SearchResult::NotFound(lo)
    }
}

/// Read-only view of a branch page.
pub struct BranchNodeRef<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> BranchNodeRef<'a> {
    /// Wraps a page as a branch node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] for non-branch pages and
    /// [`Error::Corrupted`] if the cell-pointer array overruns the page.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        check_page_type(page, PageType::Branch)?;
        let count = page.item_count() as usize;
        if BRANCH_CELL_PTRS_OFFSET + count * CELL_PTR_SIZE > page.size() {
            return Err(corrupted(page, "branch cell count exceeds page"));
        }
        Ok(Self { data: &page.data, count })
    }

    /// Returns the number of separator keys.
    pub fn key_count(&self) -> usize {
        self.count
    }

    /// Returns the number of children (`key_count() + 1`).
    pub fn child_count(&self) -> usize {
        self.count + 1
    }

    fn cell_ptr(&self, index: usize) -> usize {
        read_u16(self.data, BRANCH_CELL_PTRS_OFFSET + index * CELL_PTR_SIZE)
    }

    /// Returns the separator key at `index`.
    pub fn key(&self, index: usize) -> &'a [u8] {
        let cell = self.cell_ptr(index);
        let key_len = read_u16(self.data, cell);
        &self.data[cell + 10..cell + 10 + key_len]
    }

    /// Returns child `index`; `index == key_count()` is the rightmost child.
    pub fn child(&self, index: usize) -> PageId {
        if index >= self.count {
            return read_u64_le(&self.data[RIGHTMOST_CHILD_OFFSET..]);
        }
        let cell = self.cell_ptr(index);
        read_u64_le(&self.data[cell + 2..cell + 10])
    }

    /// Returns the index of the child whose subtree covers `key`.
    pub fn child_index_for_key(&self, key: &[u8]) -> usize {
        // Number of separators <= key.
        let mut lo = 0;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Returns the child page whose subtree covers `key`.
    pub fn child_for_key(&self, key: &[u8]) -> PageId {
        self.child(self.child_index_for_key(key))
    }
}

// ============================================================================
// Owned nodes
// ============================================================================

/// Decoded leaf node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Entries in ascending key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl LeafNode {
    /// Binary search for a key.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        match self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => SearchResult::Found(i),
            Err(i) => SearchResult::NotFound(i),
        }
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        match self.search(key) {
            SearchResult::Found(i) => {
                Some(std::mem::replace(&mut self.entries[i].1, value.to_vec()))
            },
            SearchResult::NotFound(i) => {
                self.entries.insert(i, (key.to_vec(), value.to_vec()));
                None
            },
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        match self.search(key) {
            SearchResult::Found(i) => Some(self.entries.remove(i).1),
            SearchResult::NotFound(_) => None,
        }
    }

    /// Returns the size of one encoded entry, pointer included.
    pub fn cell_size(key: &[u8], value: &[u8]) -> usize {
        LEAF_CELL_OVERHEAD + key.len() + value.len()
    }

    /// Returns the encoded size of the node, page header included.
    pub fn encoded_size(&self) -> usize {
        let cells: usize = self.entries.iter().map(|(k, v)| Self::cell_size(k, v)).sum();
        LEAF_CELL_PTRS_OFFSET + cells
    }
}

/// Decoded branch node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchNode {
    /// Separator keys in ascending order.
    pub keys: Vec<Vec<u8>>,
    /// Child pages; always one more than `keys`.
    pub children: Vec<PageId>,
}

impl BranchNode {
    /// Returns the index of the child whose subtree covers `key`.
    pub fn child_index_for_key(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    /// Returns the size of one encoded separator, pointer included.
    pub fn cell_size(key: &[u8]) -> usize {
        BRANCH_CELL_OVERHEAD + key.len()
    }

    /// Returns the encoded size of the node, page header included.
    pub fn encoded_size(&self) -> usize {
        BRANCH_CELL_PTRS_OFFSET + self.keys.iter().map(|k| Self::cell_size(k)).sum::<usize>()
    }
}

/// A decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Leaf node holding entries.
    Leaf(LeafNode),
    /// Branch node holding separators and children.
    Branch(BranchNode),
}

impl Node {
    /// Decodes a leaf or branch page, validating every cell.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] for other page types and
    /// [`Error::Corrupted`] if a cell lies outside the page.
    pub fn decode(page: &Page) -> Result<Self> {
        match page.page_type()? {
            PageType::Leaf => decode_leaf(page).map(Node::Leaf),
            PageType::Branch => decode_branch(page).map(Node::Branch),
            found => Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
        }
    }

    /// Returns the page type this node encodes to.
    pub fn page_type(&self) -> PageType {
        match self {
            Node::Leaf(_) => PageType::Leaf,
            Node::Branch(_) => PageType::Branch,
        }
    }

    /// Returns the encoded size, page header included.
    pub fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.encoded_size(),
            Node::Branch(branch) => branch.encoded_size(),
        }
    }

    /// Checks whether the node fits in a page of `page_size` bytes.
    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_size() <= page_size
    }

    /// Checks whether the node is too sparse to stand alone after a delete.
    ///
    /// A node underflows when it is empty (a branch without separators counts)
    /// or when it uses less than a quarter of the page body.
    pub fn is_underflow(&self, page_size: usize) -> bool {
        let empty = match self {
            Node::Leaf(leaf) => leaf.entries.is_empty(),
            Node::Branch(branch) => branch.keys.is_empty(),
        };
        let used = self.encoded_size() - PAGE_HEADER_SIZE;
        empty || used < (page_size - PAGE_HEADER_SIZE) / 4
    }

    /// Encodes the node into `page`, replacing its content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the node does not fit.
    pub fn encode_into(&self, page: &mut Page) -> Result<()> {
        if !self.fits(page.size()) {
            return Err(Error::PageFull);
        }

        let page_type = self.page_type() as u8;
        page.data[0] = page_type;
        page.data[PAGE_HEADER_SIZE..].fill(0);

        let mut cell_end = page.size();
        match self {
            Node::Leaf(leaf) => {
                page.set_item_count(leaf.entries.len() as u16);
                for (i, (key, value)) in leaf.entries.iter().enumerate() {
                    let cell_len = 4 + key.len() + value.len();
                    cell_end -= cell_len;
                    let cell = &mut page.data[cell_end..cell_end + cell_len];
                    cell[0..2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                    cell[2..4].copy_from_slice(&(value.len() as u16).to_le_bytes());
                    cell[4..4 + key.len()].copy_from_slice(key);
                    cell[4 + key.len()..].copy_from_slice(value);
                    write_cell_ptr(page, LEAF_CELL_PTRS_OFFSET, i, cell_end);
                }
            },
            Node::Branch(branch) => {
                page.set_item_count(branch.keys.len() as u16);
                let rightmost = branch.children.last().copied().unwrap_or(0);
                page.data[RIGHTMOST_CHILD_OFFSET..RIGHTMOST_CHILD_OFFSET + 8]
                    .copy_from_slice(&rightmost.to_le_bytes());
                for (i, (key, child)) in branch.keys.iter().zip(&branch.children).enumerate() {
                    let cell_len = 10 + key.len();
                    cell_end -= cell_len;
                    let cell = &mut page.data[cell_end..cell_end + cell_len];
                    cell[0..2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                    cell[2..10].copy_from_slice(&child.to_le_bytes());
                    cell[10..].copy_from_slice(key);
                    write_cell_ptr(page, BRANCH_CELL_PTRS_OFFSET, i, cell_end);
                }
            },
        }
        Ok(())
    }
}

fn write_cell_ptr(page: &mut Page, base: usize, index: usize, offset: usize) {
    let at = base + index * CELL_PTR_SIZE;
    page.data[at..at + CELL_PTR_SIZE].copy_from_slice(&(offset as u16).to_le_bytes());
}

/// Returns where a cell's variable part starts, checking it ends inside the page.
fn cell_bounds(page: &Page, cell: usize, fixed: usize, var_len: usize) -> Result<usize> {
    let end = cell + fixed + var_len;
    if end > page.size() {
        return Err(corrupted(page, "cell overruns page"));
    }
    Ok(cell + fixed)
}

fn decode_leaf(page: &Page) -> Result<LeafNode> {
    let view = LeafNodeRef::from_page(page)?;
    let data = &page.data;
    let mut entries = Vec::with_capacity(view.cell_count());

    for i in 0..view.cell_count() {
        let cell = view.cell_ptr(i);
        if cell < LEAF_CELL_PTRS_OFFSET || cell + 4 > page.size() {
            return Err(corrupted(page, "leaf cell pointer out of range"));
        }
        let key_len = read_u16(data, cell);
        let val_len = read_u16(data, cell + 2);
        let start = cell_bounds(page, cell, 4, key_len + val_len)?;
        entries.push((
            data[start..start + key_len].to_vec(),
            data[start + key_len..start + key_len + val_len].to_vec(),
        ));
    }

    Ok(LeafNode { entries })
}

fn decode_branch(page: &Page) -> Result<BranchNode> {
    let view = BranchNodeRef::from_page(page)?;
    let data = &page.data;
    let mut keys = Vec::with_capacity(view.key_count());
    let mut children = Vec::with_capacity(view.child_count());

    for i in 0..view.key_count() {
        let cell = view.cell_ptr(i);
        if cell < BRANCH_CELL_PTRS_OFFSET || cell + 10 > page.size() {
            return Err(corrupted(page, "branch cell pointer out of range"));
        }
        let key_len = read_u16(data, cell);
        let start = cell_bounds(page, cell, 10, key_len)?;
        children.push(read_u64_le(&data[cell + 2..cell + 10]));
        keys.push(data[start..start + key_len].to_vec());
    }
    children.push(view.child(view.key_count()));

    Ok(BranchNode { keys, children })
}
