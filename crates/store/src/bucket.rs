//! Bucket directory.
//!
//! Every bucket is its own B+ tree. The directory is one more tree, keyed by
//! bucket name, whose values are the 8-byte little-endian root page ids of the
//! bucket trees. A bucket that never held a key has root 0.

use crate::{
    btree::{BTree, PageReader, cursor::Range, node::max_key_size},
    error::{Error, PageId, Result},
};

/// Longest accepted bucket name, before the page-size limit applies.
pub const MAX_BUCKET_NAME_LEN: usize = 255;

/// Checks that `name` can be stored as a directory key.
///
/// # Errors
///
/// Returns [`Error::InvalidBucketName`] for empty or over-long names.
pub fn validate_bucket_name(name: &[u8], page_size: usize) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidBucketName { reason: "name is empty" });
    }
    if name.len() > MAX_BUCKET_NAME_LEN.min(max_key_size(page_size)) {
        return Err(Error::InvalidBucketName { reason: "name is too long" });
    }
    Ok(())
}

pub(crate) fn encode_root(root: PageId) -> [u8; 8] {
    root.to_le_bytes()
}

pub(crate) fn decode_root(name: &[u8], value: &[u8]) -> Result<PageId> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| Error::Corrupted {
        reason: format!(
            "directory entry for bucket {} has {} bytes",
            String::from_utf8_lossy(name),
            value.len()
        ),
    })?;
    Ok(PageId::from_le_bytes(bytes))
}

/// Looks up the root page of bucket `name` in the directory at `directory_root`.
///
/// Returns `None` if the bucket does not exist.
pub(crate) fn lookup_root<R: PageReader>(
    reader: R,
    directory_root: PageId,
    name: &[u8],
) -> Result<Option<PageId>> {
    BTree::new(directory_root, reader)
        .get(name)?
        .map(|value| decode_root(name, &value))
        .transpose()
}

/// Lists every bucket name in ascending order.
pub(crate) fn list_buckets<R: PageReader>(
    reader: R,
    directory_root: PageId,
) -> Result<Vec<Vec<u8>>> {
    Ok(BTree::new(directory_root, reader)
        .collect_range(Range::all())?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Lists every bucket with its root page.
pub(crate) fn list_roots<R: PageReader>(
    reader: R,
    directory_root: PageId,
) -> Result<Vec<(Vec<u8>, PageId)>> {
    BTree::new(directory_root, reader)
        .collect_range(Range::all())?
        .into_iter()
        .map(|(name, value)| {
            let root = decode_root(&name, &value)?;
            Ok((name, root))
        })
        .collect()
}
