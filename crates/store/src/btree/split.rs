//! Node splitting and merging for the B+ tree.
//!
//! # Algorithm Overview
//!
//! ## Splitting (insertion path)
//!
//! Nodes are edited in decoded form, so an edit may leave a node larger
//! than a page. [`split_node`] cuts it by encoded byte size:
//!
//! 1. **Two-way split**: the cut that best balances the two halves' byte sizes
//!    while both fit. This is the common case.
//! 2. **Greedy split**: when no two-way cut fits (a few very large cells), the
//!    cells are packed left to right into as many pages as needed.
//!
//! For leaves, the first key of each right piece is copied up as its
//! separator. For branches, the key at the cut is promoted: it moves to the
//! parent and leaves both halves.
//!
//! ## Merging (deletion path)
//!
//! An underfull node is joined with an adjacent sibling by [`merge_nodes`].
//! Branches pull the parent separator down between the two halves. If the
//! merged node no longer fits a page, splitting it again redistributes the
//! cells evenly between two pages.

use super::node::{BranchNode, LeafNode, Node};
use crate::error::{Error, Result};

/// A node cut into page-sized pieces.
#[derive(Debug)]
pub struct SplitResult {
    /// Leftmost piece; takes the place of the original node.
    pub first: Node,
    /// Following pieces, each with the separator that precedes it in the parent.
    pub rest: Vec<(Vec<u8>, Node)>,
}

impl SplitResult {
    /// Returns the number of pieces.
    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    /// Returns true when the node fit in one page.
    pub fn is_single(&self) -> bool {
        self.rest.is_empty()
    }
}

/// Splits `node` into pieces that each fit in `page_size` bytes.
///
/// A node that already fits comes back as a single piece.
pub fn split_node(node: Node, page_size: usize) -> SplitResult {
    if node.fits(page_size) {
        return SplitResult { first: node, rest: Vec::new() };
    }
    match node {
        Node::Leaf(leaf) => split_leaf(leaf, page_size),
        Node::Branch(branch) => split_branch(branch, page_size),
    }
}

fn split_leaf(mut leaf: LeafNode, page_size: usize) -> SplitResult {
    let capacity = page_size - LeafNode::default().encoded_size();
    let sizes: Vec<usize> = leaf.entries.iter().map(|(k, v)| LeafNode::cell_size(k, v)).collect();
    let starts = leaf_piece_starts(&sizes, capacity);

    let mut rest = Vec::with_capacity(starts.len());
    for &start in starts.iter().rev() {
        let entries = leaf.entries.split_off(start);
        let separator = entries[0].0.clone();
        rest.push((separator, Node::Leaf(LeafNode { entries })));
    }
    rest.reverse();

    SplitResult { first: Node::Leaf(leaf), rest }
}

/// Returns the index of the first entry of every piece after the first.
fn leaf_piece_starts(sizes: &[usize], capacity: usize) -> Vec<usize> {
    let total: usize = sizes.iter().sum();

    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for (cut, size) in sizes.iter().enumerate().take(sizes.len().saturating_sub(1)) {
        left += size;
        let right = total - left;
        if left <= capacity && right <= capacity {
            let worst = left.max(right);
            if best.is_none_or(|(_, w)| worst < w) {
                best = Some((cut + 1, worst));
            }
        }
    }
    if let Some((cut, _)) = best {
        return vec![cut];
    }

    let mut starts = Vec::new();
    let mut used = 0;
    for (i, &size) in sizes.iter().enumerate() {
        if used + size > capacity && used > 0 {
            starts.push(i);
            used = 0;
        }
        used += size;
    }
    starts
}

fn split_branch(branch: BranchNode, page_size: usize) -> SplitResult {
    let capacity = page_size - BranchNode::default().encoded_size();
    let sizes: Vec<usize> = branch.keys.iter().map(|k| BranchNode::cell_size(k)).collect();
    let ranges = branch_piece_ranges(&sizes, capacity);

    let BranchNode { keys, children } = branch;
    let piece = |(start, end): (usize, usize)| {
        Node::Branch(BranchNode {
            keys: keys[start..end].to_vec(),
            children: children[start..=end].to_vec(),
        })
    };

    // Each piece after the first is preceded by the key just before its range.
    let first = piece(ranges[0]);
    let rest = ranges[1..].iter().map(|&range| (keys[range.0 - 1].clone(), piece(range))).collect();

    SplitResult { first, rest }
}

/// Returns half-open key ranges, one per piece; the key between two ranges is promoted.
fn branch_piece_ranges(sizes: &[usize], capacity: usize) -> Vec<(usize, usize)> {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();

    // Promote key `p`: left keeps [0, p), right keeps [p + 1, n).
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for p in 1..n.saturating_sub(1) {
        left += sizes[p - 1];
        let right = total - left - sizes[p];
        if left <= capacity && right <= capacity {
            let worst = left.max(right);
            if best.is_none_or(|(_, w)| worst < w) {
                best = Some((p, worst));
            }
        }
    }
    if let Some((p, _)) = best {
        return vec![(0, p), (p + 1, n)];
    }

    let mut ranges = Vec::new();
    let mut start = 0;
    loop {
        let remaining: usize = sizes[start..].iter().sum();
        if remaining <= capacity {
            ranges.push((start, n));
            return ranges;
        }

        let mut end = start;
        let mut used = 0;
        while end < n && (used + sizes[end] <= capacity || end == start) {
            used += sizes[end];
            end += 1;
        }
        ranges.push((start, end));
        if end >= n {
            // Nothing left to promote: the last key stays in the final piece.
            return ranges;
        }
        start = end + 1;
    }
}

/// Joins two adjacent siblings, pulling `separator` down between branches.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the siblings are not the same node kind.
pub fn merge_nodes(left: Node, separator: Vec<u8>, right: Node) -> Result<Node> {
    match (left, right) {
        (Node::Leaf(mut left), Node::Leaf(right)) => {
            left.entries.extend(right.entries);
            Ok(Node::Leaf(left))
        },
        (Node::Branch(mut left), Node::Branch(right)) => {
            left.keys.push(separator);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
            Ok(Node::Branch(left))
        },
        _ => Err(Error::Corrupted { reason: "sibling nodes differ in kind".to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageId;

    const PAGE: usize = 512;

    fn leaf_with(count: usize, value_len: usize) -> LeafNode {
        LeafNode {
            entries: (0..count)
                .map(|i| (format!("key{i:04}").into_bytes(), vec![i as u8; value_len]))
                .collect(),
        }
    }

    fn all_entries(split: &SplitResult) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        for node in std::iter::once(&split.first).chain(split.rest.iter().map(|(_, n)| n)) {
            match node {
                Node::Leaf(leaf) => keys.extend(leaf.entries.iter().map(|(k, _)| k.clone())),
                Node::Branch(_) => panic!("expected leaf"),
            }
        }
        keys
    }

    #[test]
    fn test_fitting_node_is_not_split() {
        let split = split_node(Node::Leaf(leaf_with(3, 10)), PAGE);
        assert!(split.is_single());
        assert_eq!(split.len(), 1);
    }

    #[test]
    fn test_leaf_split_is_balanced_and_ordered() {
        let original = leaf_with(40, 20);
        let expected: Vec<Vec<u8>> = original.entries.iter().map(|(k, _)| k.clone()).collect();

        let split = split_node(Node::Leaf(original), PAGE * 2);
        assert_eq!(split.len(), 2);

        let (separator, right) = &split.rest[0];
        let Node::Leaf(right) = right else { panic!("expected leaf") };
        assert_eq!(separator, &right.entries[0].0);

        let left_size = split.first.encoded_size();
        let right_size = split.rest[0].1.encoded_size();
        assert!(left_size.abs_diff(right_size) <= LeafNode::cell_size(b"key0000", &[0; 20]));
        assert_eq!(all_entries(&split), expected);
    }

    #[test]
    fn test_large_cells_fall_back_to_greedy() {
        // Five cells of ~250 bytes cannot be split two ways into 496-byte bodies.
        let original = LeafNode {
            entries: (0..5u8).map(|i| (vec![b'a' + i], vec![i; 240])).collect(),
        };
        let split = split_node(Node::Leaf(original), PAGE);
        assert!(split.len() >= 3);
        assert!(split.first.fits(PAGE));
        for (separator, node) in &split.rest {
            assert!(node.fits(PAGE));
            let Node::Leaf(leaf) = node else { panic!("expected leaf") };
            assert_eq!(separator, &leaf.entries[0].0);
        }
    }

    #[test]
    fn test_branch_split_promotes_separator() {
        let keys: Vec<Vec<u8>> = (0..40u32).map(|i| format!("sep{i:05}").into_bytes()).collect();
        let children: Vec<PageId> = (100..141).collect();
        let branch = BranchNode { keys: keys.clone(), children: children.clone() };

        let split = split_node(Node::Branch(branch), PAGE);
        assert_eq!(split.len(), 2);

        let Node::Branch(left) = &split.first else { panic!("expected branch") };
        let (promoted, Node::Branch(right)) = &split.rest[0] else { panic!("expected branch") };

        assert_eq!(left.children.len(), left.keys.len() + 1);
        assert_eq!(right.children.len(), right.keys.len() + 1);
        assert_eq!(left.keys.len() + 1 + right.keys.len(), keys.len());
        assert_eq!(promoted, &keys[left.keys.len()]);
        assert!(left.keys.iter().all(|k| k < promoted));
        assert!(right.keys.iter().all(|k| k > promoted));

        let mut rejoined = left.children.clone();
        rejoined.extend(&right.children);
        assert_eq!(rejoined, children);
    }

    #[test]
    fn test_merge_nodes() {
        let left = Node::Leaf(leaf_with(2, 1));
        let right = Node::Leaf(LeafNode { entries: vec![(b"zz".to_vec(), b"1".to_vec())] });
        let Node::Leaf(merged) = merge_nodes(left, b"zz".to_vec(), right).unwrap() else {
            panic!("expected leaf")
        };
        assert_eq!(merged.entries.len(), 3);

        let left = Node::Branch(BranchNode { keys: vec![b"b".to_vec()], children: vec![1, 2] });
        let right = Node::Branch(BranchNode { keys: vec![b"f".to_vec()], children: vec![3, 4] });
        let merged = merge_nodes(left, b"d".to_vec(), right).unwrap();
        assert_eq!(
            merged,
            Node::Branch(BranchNode {
                keys: vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()],
                children: vec![1, 2, 3, 4],
            })
        );

        let mismatched = merge_nodes(
            Node::Leaf(LeafNode::default()),
            Vec::new(),
            Node::Branch(BranchNode::default()),
        );
        assert!(matches!(mismatched, Err(Error::Corrupted { .. })));
    }
}
