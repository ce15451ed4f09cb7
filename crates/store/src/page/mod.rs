//! Fixed-size pages: layout, checksums, allocation and caching.
//!
//! Every page starts with a 16-byte [`PageHeader`]; the remaining bytes
//! belong to whichever structure owns the page (a B+ tree node or a run of
//! persisted free-list ids). Checksums are recomputed right before a page is
//! written to the backend and verified whenever a page is read back.

mod allocator;
mod cache;

pub use allocator::{FIRST_PAGE_ID, PageAllocator};
use byteorder::{ByteOrder, LittleEndian};
pub use cache::{CacheStats, PageCache};

use crate::error::{Error, PageId, PageType, Result};

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size (cell offsets are stored as `u16`).
pub const MAX_PAGE_SIZE: usize = 65536;

const TYPE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const COUNT_OFFSET: usize = 2;
const CHECKSUM_OFFSET: usize = 4;
const TXN_OFFSET: usize = 8;

/// Checks that `size` is a power of two within the supported range.
///
/// # Errors
///
/// Returns [`Error::InvalidPageSize`] otherwise.
pub fn validate_page_size(size: usize) -> Result<()> {
    if !size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
        return Err(Error::InvalidPageSize { size });
    }
    Ok(())
}

/// Decoded form of the 16 bytes at the start of every page.
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       1      Page kind (PageType)
/// 1       1      Flags, always zero
/// 2       2      Entries, child keys or free ids stored in the body
/// 4       4      Low 32 bits of XXH3-64 over the body
/// 8       8      Commit that produced the page
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page kind.
    pub page_type: PageType,
    /// Unused flag bits.
    pub flags: u8,
    /// Number of items in the body.
    pub item_count: u16,
    /// Body checksum.
    pub checksum: u32,
    /// Transaction that wrote the page.
    pub txn_id: u64,
}

impl PageHeader {
    /// Header for a freshly allocated page with an empty body.
    pub fn new(page_type: PageType, txn_id: u64) -> Self {
        Self { page_type, flags: 0, item_count: 0, checksum: 0, txn_id }
    }

    /// Encodes the header in its on-disk form.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut out = [0u8; PAGE_HEADER_SIZE];
        out[TYPE_OFFSET] = self.page_type as u8;
        out[FLAGS_OFFSET] = self.flags;
        LittleEndian::write_u16(&mut out[COUNT_OFFSET..], self.item_count);
        LittleEndian::write_u32(&mut out[CHECKSUM_OFFSET..], self.checksum);
        LittleEndian::write_u64(&mut out[TXN_OFFSET..], self.txn_id);
        out
    }

    /// Decodes a header from the first [`PAGE_HEADER_SIZE`] bytes of `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `raw` is too short or carries an
    /// unknown page kind.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("page header needs {PAGE_HEADER_SIZE} bytes, got {}", raw.len()),
            });
        }
        Ok(Self {
            page_type: PageType::try_from(raw[TYPE_OFFSET])?,
            flags: raw[FLAGS_OFFSET],
            item_count: LittleEndian::read_u16(&raw[COUNT_OFFSET..]),
            checksum: LittleEndian::read_u32(&raw[CHECKSUM_OFFSET..]),
            txn_id: LittleEndian::read_u64(&raw[TXN_OFFSET..]),
        })
    }
}

/// One page image, addressed by its id.
#[derive(Clone)]
pub struct Page {
    /// Slot index in the data area.
    pub id: PageId,
    /// Full page bytes, header included.
    pub data: Vec<u8>,
}

impl Page {
    /// Zero-filled page of `page_size` bytes with a fresh header.
    pub fn new(id: PageId, page_size: usize, page_type: PageType, txn_id: u64) -> Self {
        let mut data = vec![0u8; page_size];
        data[..PAGE_HEADER_SIZE].copy_from_slice(&PageHeader::new(page_type, txn_id).to_bytes());
        Self { id, data }
    }

    /// Wraps bytes read back from a backend.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Decodes the page header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for an unknown page kind.
    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::from_bytes(&self.data)
    }

    /// Page kind stored in the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for an unknown page kind.
    pub fn page_type(&self) -> Result<PageType> {
        PageType::try_from(self.data[TYPE_OFFSET])
    }

    /// Transaction that wrote this page.
    pub fn txn_id(&self) -> u64 {
        LittleEndian::read_u64(&self.data[TXN_OFFSET..])
    }

    /// Number of items recorded in the header.
    pub fn item_count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[COUNT_OFFSET..])
    }

    /// Records the number of items in the body.
    pub fn set_item_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.data[COUNT_OFFSET..], count);
    }

    /// Body bytes following the header.
    pub fn content(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Mutable body bytes following the header.
    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Stamps the header with the checksum of the current body.
    pub fn update_checksum(&mut self) {
        let sum = body_checksum(&self.data);
        LittleEndian::write_u32(&mut self.data[CHECKSUM_OFFSET..], sum);
    }

    /// Whether the stored checksum matches the body.
    pub fn verify_checksum(&self) -> bool {
        LittleEndian::read_u32(&self.data[CHECKSUM_OFFSET..]) == body_checksum(&self.data)
    }

    /// True for a slot that was never written.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Page size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Body size in bytes.
    pub fn content_size(&self) -> usize {
        self.size() - PAGE_HEADER_SIZE
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type().ok())
            .field("items", &self.item_count())
            .field("txn_id", &self.txn_id())
            .finish_non_exhaustive()
    }
}

fn body_checksum(data: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(&data[PAGE_HEADER_SIZE..]) as u32
}

/// Reads a little-endian `u64` from the start of `buf`.
pub(crate) fn read_u64_le(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(buf)
}
