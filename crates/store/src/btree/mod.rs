//! Copy-on-write B+ tree.
//!
//! One tree per bucket, plus one for the bucket directory. Design points:
//! - Single-writer, multiple-reader access
//! - Every node on the path to a change is rewritten into a new page; the
//!   replaced pages are handed back through [`PageProvider::free_page`], so
//!   snapshots holding the old root keep a complete tree
//! - Splits on overflow, merge or redistribution on underflow
//!
//! ## Structure
//!
//! - `node.rs`: page layout, zero-copy views and owned nodes
//! - `split.rs`: size-based splitting and sibling merging
//! - `cursor.rs`: ordered traversal, seek and range scans

/// Cursor and range query support for B+ tree iteration.
pub mod cursor;
/// Page layout of leaf and branch nodes.
pub mod node;
/// Node splitting and merging.
pub mod split;

use cursor::{Cursor, Range};
use node::{BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, Node, SearchResult, check_entry};
use split::{SplitResult, merge_nodes, split_node};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
};

/// Read access to pages, shared by read and write transactions.
pub trait PageReader {
    /// Reads a page by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be read or fails verification.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Returns the page size.
    fn page_size(&self) -> usize;
}

impl<T: PageReader + ?Sized> PageReader for &T {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        (**self).read_page(page_id)
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

impl<T: PageReader + ?Sized> PageReader for &mut T {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        (**self).read_page(page_id)
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

/// Page operations available to a write transaction.
pub trait PageProvider: PageReader {
    /// Allocates a new zeroed page of the given type, owned by this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the store cannot grow.
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page>;

    /// Buffers a page allocated by this transaction for commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageNotWritable`] for pages the transaction did not allocate.
    fn write_page(&mut self, page: Page) -> Result<()>;

    /// Releases a page the tree no longer references.
    fn free_page(&mut self, page_id: PageId);

    /// Returns the current transaction ID.
    fn txn_id(&self) -> u64;
}

impl<T: PageProvider + ?Sized> PageProvider for &mut T {
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        (**self).allocate_page(page_type)
    }

    fn write_page(&mut self, page: Page) -> Result<()> {
        (**self).write_page(page)
    }

    fn free_page(&mut self, page_id: PageId) {
        (**self).free_page(page_id)
    }

    fn txn_id(&self) -> u64 {
        (**self).txn_id()
    }
}

/// Child pointers that replace one child after it was rewritten.
///
/// `first` takes the old child's slot; every `(separator, page)` in `rest`
/// is inserted right after it.
#[derive(Debug)]
struct Written {
    first: PageId,
    rest: Vec<(Vec<u8>, PageId)>,
}

impl BranchNode {
    /// Replaces child `index` with the pages it was rewritten into.
    fn replace_child(&mut self, index: usize, written: Written) {
        self.children[index] = written.first;
        for (offset, (separator, page_id)) in written.rest.into_iter().enumerate() {
            self.keys.insert(index + offset, separator);
            self.children.insert(index + offset + 1, page_id);
        }
    }
}

/// B+ tree over one root page.
///
/// All page access goes through the provider; the tree itself only tracks
/// the root id (0 = empty tree).
pub struct BTree<P> {
    provider: P,
    root_page: PageId,
    split_count: u64,
}

impl<P: PageReader> BTree<P> {
    /// Creates a tree accessor.
    pub fn new(root_page: PageId, provider: P) -> Self {
        Self { provider, root_page, split_count: 0 }
    }

    /// Returns the root page ID.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Returns the number of page splits performed through this accessor.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Returns the provider, consuming the tree.
    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Computes the depth of the tree (0 = no root, 1 = root is a leaf).
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a non-tree page is encountered.
    pub fn depth(&self) -> Result<u32> {
        if self.root_page == 0 {
            return Ok(0);
        }

        let mut depth = 1u32;
        let mut page_id = self.root_page;
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::Leaf => return Ok(depth),
                PageType::Branch => {
                    page_id = BranchNodeRef::from_page(&page)?.child(0);
                    depth += 1;
                },
                found => return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
            }
        }
    }

    /// Checks whether the tree holds no entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the root page cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        if self.root_page == 0 {
            return Ok(true);
        }
        Ok(self.first()?.is_none())
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page type mismatch is found.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }

        let page = self.find_leaf(key)?;
        let leaf = LeafNodeRef::from_page(&page)?;
        match leaf.search(key) {
            SearchResult::Found(idx) => Ok(Some(leaf.value(idx).to_vec())),
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    /// Returns the leaf page whose key range covers `key`.
    fn find_leaf(&self, key: &[u8]) -> Result<Page> {
        let mut page = self.provider.read_page(self.root_page)?;
        loop {
            match page.page_type()? {
                PageType::Leaf => return Ok(page),
                PageType::Branch => {
                    let child = BranchNodeRef::from_page(&page)?.child_for_key(key);
                    page = self.provider.read_page(child)?;
                },
                found => return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
            }
        }
    }

    /// Returns the smallest entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.cursor().first()
    }

    /// Returns the largest entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn last(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root_page == 0 {
            return Ok(None);
        }
        self.last_in(self.root_page)
    }

    /// Returns the largest entry under `page_id`, falling back left past empty leaves.
    fn last_in(&self, page_id: PageId) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let page = self.provider.read_page(page_id)?;
        match page.page_type()? {
            PageType::Leaf => {
                let leaf = LeafNodeRef::from_page(&page)?;
                Ok(leaf.cell_count().checked_sub(1).map(|i| {
                    let (k, v) = leaf.get(i);
                    (k.to_vec(), v.to_vec())
                }))
            },
            PageType::Branch => {
                let branch = BranchNodeRef::from_page(&page)?;
                for index in (0..branch.child_count()).rev() {
                    if let Some(entry) = self.last_in(branch.child(index))? {
                        return Ok(Some(entry));
                    }
                }
                Ok(None)
            },
            found => Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
        }
    }

    /// Creates a cursor over this tree.
    pub fn cursor(&self) -> Cursor<&P> {
        Cursor::new(&self.provider, self.root_page)
    }

    /// Collects entries within `range` in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn collect_range(&self, range: Range<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        cursor::Entries::new(self.cursor(), range).collect()
    }

    /// Returns every page reachable from the root, in depth-first order.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn page_ids(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        if self.root_page == 0 {
            return Ok(pages);
        }

        let mut stack = vec![self.root_page];
        while let Some(page_id) = stack.pop() {
            pages.push(page_id);
            let page = self.provider.read_page(page_id)?;
            if page.page_type()? == PageType::Branch {
                let branch = BranchNodeRef::from_page(&page)?;
                stack.extend((0..branch.child_count()).rev().map(|i| branch.child(i)));
            }
        }
        Ok(pages)
    }
}

impl<P: PageProvider> BTree<P> {
    /// Inserts or replaces an entry, returning the previous value.
    ///
    /// Rewrites the root-to-leaf path into new pages, splitting any node that
    /// outgrows its page. A root split adds a level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`], [`Error::KeyTooLarge`] or [`Error::ValueTooLarge`]
    /// for entries that cannot be stored, and any provider error.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        check_entry(key, value, self.provider.page_size())?;

        if self.root_page == 0 {
            let leaf = LeafNode { entries: vec![(key.to_vec(), value.to_vec())] };
            let written = self.write_node(Node::Leaf(leaf))?;
            self.root_page = self.grow_root(written)?;
            return Ok(None);
        }

        let (written, old_value) = self.insert_recursive(self.root_page, key, value)?;
        self.root_page = self.grow_root(written)?;
        Ok(old_value)
    }

    fn insert_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Written, Option<Vec<u8>>)> {
        let page = self.provider.read_page(page_id)?;
        let (node, old_value) = match Node::decode(&page)? {
            Node::Leaf(mut leaf) => {
                let old_value = leaf.upsert(key, value);
                (Node::Leaf(leaf), old_value)
            },
            Node::Branch(mut branch) => {
                let index = branch.child_index_for_key(key);
                let (written, old_value) =
                    self.insert_recursive(branch.children[index], key, value)?;
                branch.replace_child(index, written);
                (Node::Branch(branch), old_value)
            },
        };

        self.provider.free_page(page_id);
        Ok((self.write_node(node)?, old_value))
    }

    /// Removes an entry, returning its value.
    ///
    /// Underfull nodes on the path are merged with, or rebalanced against, an
    /// adjacent sibling. A root branch left with a single child is replaced by
    /// that child; an emptied root leaf stays as the (empty) root.
    ///
    /// # Errors
    ///
    /// Returns any provider error.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }

        let Some((root, old_value)) = self.delete_recursive(self.root_page, key)? else {
            return Ok(None);
        };
        self.provider.free_page(self.root_page);

        self.root_page = match root {
            Node::Branch(branch) if branch.keys.is_empty() => branch.children[0],
            node => {
                let written = self.write_node(node)?;
                self.grow_root(written)?
            },
        };
        Ok(Some(old_value))
    }

    /// Deletes `key` below `page_id`, returning the edited node unwritten.
    ///
    /// The caller owns `page_id`: it frees the page and writes the returned node.
    fn delete_recursive(&mut self, page_id: PageId, key: &[u8]) -> Result<Option<(Node, Vec<u8>)>> {
        let page = self.provider.read_page(page_id)?;
        match Node::decode(&page)? {
            Node::Leaf(mut leaf) => {
                Ok(leaf.remove(key).map(|old_value| (Node::Leaf(leaf), old_value)))
            },
            Node::Branch(mut branch) => {
                let index = branch.child_index_for_key(key);
                let child_id = branch.children[index];
                let Some((child, old_value)) = self.delete_recursive(child_id, key)? else {
                    return Ok(None);
                };
                self.provider.free_page(child_id);

                if child.is_underflow(self.provider.page_size()) && branch.children.len() > 1 {
                    self.rebalance(&mut branch, index, child)?;
                } else {
                    let written = self.write_node(child)?;
                    branch.replace_child(index, written);
                }
                Ok(Some((Node::Branch(branch), old_value)))
            },
        }
    }

    /// Joins the underfull child at `index` with its left sibling (or right,
    /// for the first child). The pair is merged if it fits a page, else split
    /// evenly again with a new separator.
    fn rebalance(&mut self, branch: &mut BranchNode, index: usize, child: Node) -> Result<()> {
        let left_index = index.saturating_sub(1);
        let sibling_index = if index > 0 { index - 1 } else { index + 1 };
        let sibling_id = branch.children[sibling_index];
        let sibling = Node::decode(&self.provider.read_page(sibling_id)?)?;
        self.provider.free_page(sibling_id);

        let separator = branch.keys.remove(left_index);
        branch.children.remove(left_index + 1);

        let merged = if index > 0 {
            merge_nodes(sibling, separator, child)?
        } else {
            merge_nodes(child, separator, sibling)?
        };

        let written = self.write_node(merged)?;
        branch.replace_child(left_index, written);
        Ok(())
    }

    /// Writes `node` into new pages, splitting it if it outgrew one page.
    fn write_node(&mut self, node: Node) -> Result<Written> {
        let split: SplitResult = split_node(node, self.provider.page_size());
        self.split_count += split.len() as u64 - 1;

        let first = self.write_page(&split.first)?;
        let mut rest = Vec::with_capacity(split.rest.len());
        for (separator, node) in &split.rest {
            rest.push((separator.clone(), self.write_page(node)?));
        }
        Ok(Written { first, rest })
    }

    fn write_page(&mut self, node: &Node) -> Result<PageId> {
        let mut page = self.provider.allocate_page(node.page_type())?;
        node.encode_into(&mut page)?;
        let page_id = page.id;
        self.provider.write_page(page)?;
        Ok(page_id)
    }

    /// Adds branch levels above a root that was split, returning the new root.
    fn grow_root(&mut self, mut written: Written) -> Result<PageId> {
        while !written.rest.is_empty() {
            let mut root = BranchNode { keys: Vec::new(), children: vec![written.first] };
            root.replace_child(0, written);
            written = self.write_node(Node::Branch(root))?;
        }
        Ok(written.first)
    }

    /// Frees every page of the tree and leaves it empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn clear(&mut self) -> Result<()> {
        for page_id in self.page_ids()? {
            self.provider.free_page(page_id);
        }
        self.root_page = 0;
        Ok(())
    }
}
