//! Storage backend abstraction.
//!
//! The backend trait abstracts where header and page bytes live, allowing both
//! file-based (production) and in-memory (testing) implementations.
//!
//! # Crash Safety: Dual-Slot Commit
//!
//! The header holds two commit slots and a selector ("god byte"):
//! - Commits write the INACTIVE slot, sync, then flip the selector and sync again.
//! - On open both slots are read and the selected one is used if its checksum
//!   verifies; otherwise the other slot is the fallback.
//!
//! At every point of a commit at least one slot is valid, so a crash never
//! leaves a torn root behind.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{Error, PageId, Result},
    page::validate_page_size,
};

/// Default page size power: 12 (meaning 2^12 = 4KB).
pub const DEFAULT_PAGE_SIZE_POWER: u8 = 12;
/// Default page size: 4KB (4096 bytes).
pub const DEFAULT_PAGE_SIZE: usize = 1 << DEFAULT_PAGE_SIZE_POWER;

/// Database header size: 16-byte common header, two 64-byte commit slots, reserved tail.
pub const HEADER_SIZE: usize = 768;

/// Magic number for bucketdb files.
pub const MAGIC: &[u8; 8] = b"BUCKETDB";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads the database header ([`HEADER_SIZE`] bytes).
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_header(&self) -> Result<Vec<u8>>;

    /// Writes the database header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the header size is incorrect.
    fn write_header(&self, header: &[u8]) -> Result<()>;

    /// Reads a page by its ID. Pages never written read back as zeros.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>>;

    /// Writes a page at the given ID, growing the storage if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails, `Error::OutOfSpace` if storage
    /// cannot grow, and `Error::Corrupted` if the data size does not match the page size.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current storage size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;

    /// Grows the storage to at least `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfSpace` or `Error::Io` if the storage cannot grow.
    fn extend(&self, new_size: u64) -> Result<()>;

    /// Returns the page size for this backend.
    fn page_size(&self) -> usize;

    /// Calculates the byte offset for a page ID.
    fn page_offset(&self, page_id: PageId) -> u64 {
        HEADER_SIZE as u64 + (page_id * self.page_size() as u64)
    }
}

/// A single commit slot: the database state as of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSlot {
    /// Root page of the bucket directory (0 = no buckets yet).
    pub directory_root: PageId,
    /// High-water page count (next page id to hand out).
    pub total_pages: u64,
    /// Transaction ID of the commit that wrote this slot.
    pub txn_id: u64,
    /// Unix epoch seconds of the commit.
    pub timestamp: u64,
    /// First page of the persisted free-list run (0 = none).
    pub freelist_page: PageId,
    /// Number of pages in the free-list run; each page records its own id count.
    pub freelist_pages: u64,
}

impl CommitSlot {
    /// Size of a commit slot on disk.
    pub const SIZE: usize = 64;

    /// Bytes covered by the checksum (the six fields before it).
    const CHECKSUMMED_SIZE: usize = 48;

    /// Serializes the slot, stamping a fresh XXH3-64 checksum at bytes 48..56.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.directory_root,
            self.total_pages,
            self.txn_id,
            self.timestamp,
            self.freelist_page,
            self.freelist_pages,
        ];
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u64_into(&fields, &mut buf[..Self::CHECKSUMMED_SIZE]);
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..Self::CHECKSUMMED_SIZE]);
        LittleEndian::write_u64(&mut buf[Self::CHECKSUMMED_SIZE..], checksum);
        buf
    }

    /// Parses a slot, returning `None` if the buffer is short or the checksum fails.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let body = &buf[..Self::CHECKSUMMED_SIZE];
        let stored = LittleEndian::read_u64(&buf[Self::CHECKSUMMED_SIZE..]);
        if stored != xxhash_rust::xxh3::xxh3_64(body) {
            return None;
        }

        let mut fields = [0u64; 6];
        LittleEndian::read_u64_into(body, &mut fields);
        let [directory_root, total_pages, txn_id, timestamp, freelist_page, freelist_pages] =
            fields;
        Some(Self { directory_root, total_pages, txn_id, timestamp, freelist_page, freelist_pages })
    }
}

/// Database header with dual-slot commit.
///
/// # Layout (768 bytes total)
///
/// - Bytes 0-7: magic, 8-9: version, 10: page size power, 11-14: reserved
/// - Byte 15: god byte
/// - Bytes 16-79: commit slot 0
/// - Bytes 80-143: commit slot 1
/// - Bytes 144-767: reserved
///
/// God byte bit 0 selects the primary slot. Bit 1 is the recovery flag: set by
/// every commit and cleared by a clean close, after the free list has been
/// persisted. If it is set on open, the persisted free list is stale and is
/// rebuilt from the reachable pages.
#[derive(Debug, Clone)]
pub struct DatabaseHeader {
    /// Format version.
    pub version: u16,
    /// Page size as power of 2 (default: 12 = 4KB).
    pub page_size_power: u8,
    /// God byte: bit 0 = primary slot, bit 1 = recovery required.
    pub god_byte: u8,
    /// Commit slots; `None` when a slot failed checksum verification.
    slots: [Option<CommitSlot>; 2],
}

impl DatabaseHeader {
    /// Total header size on disk.
    pub const SIZE: usize = HEADER_SIZE;

    /// Offset of the god byte in the header.
    pub const GOD_BYTE_OFFSET: usize = 15;

    /// Bit mask for primary slot index in god byte.
    pub const GOD_BYTE_SLOT_MASK: u8 = 0x01;

    /// Bit mask for recovery required flag in god byte.
    pub const GOD_BYTE_RECOVERY_MASK: u8 = 0x02;

    const SLOT_OFFSETS: [usize; 2] = [16, 80];

    /// Creates a header for an empty database. Both slots are valid and empty.
    pub fn new(page_size_power: u8) -> Self {
        let empty = CommitSlot { total_pages: crate::page::FIRST_PAGE_ID, ..CommitSlot::default() };
        Self {
            version: FORMAT_VERSION,
            page_size_power,
            god_byte: 0,
            slots: [Some(empty.clone()), Some(empty)],
        }
    }

    /// Returns the index of the primary (active) slot.
    pub fn primary_slot_index(&self) -> usize {
        (self.god_byte & Self::GOD_BYTE_SLOT_MASK) as usize
    }

    /// Returns the index of the secondary (inactive) slot.
    pub fn secondary_slot_index(&self) -> usize {
        1 - self.primary_slot_index()
    }

    /// Returns the slot at `index` if it passed verification.
    pub fn slot(&self, index: usize) -> Option<&CommitSlot> {
        self.slots[index & 1].as_ref()
    }

    /// Overwrites the secondary slot.
    pub fn set_secondary_slot(&mut self, slot: CommitSlot) {
        let index = self.secondary_slot_index();
        self.slots[index] = Some(slot);
    }

    /// Checks if recovery is required (unclean shutdown detected).
    pub fn recovery_required(&self) -> bool {
        (self.god_byte & Self::GOD_BYTE_RECOVERY_MASK) != 0
    }

    /// Flips the primary slot (toggle bit 0 of god byte).
    pub fn flip_primary_slot(&mut self) {
        self.god_byte ^= Self::GOD_BYTE_SLOT_MASK;
    }

    /// Sets or clears the recovery required flag.
    pub fn set_recovery_required(&mut self, required: bool) {
        if required {
            self.god_byte |= Self::GOD_BYTE_RECOVERY_MASK;
        } else {
            self.god_byte &= !Self::GOD_BYTE_RECOVERY_MASK;
        }
    }

    /// Serializes the header. Missing slots are written as zeros, which fail verification.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut buf[8..10], self.version);
        buf[10] = self.page_size_power;
        buf[Self::GOD_BYTE_OFFSET] = self.god_byte;

        for (slot, offset) in self.slots.iter().zip(Self::SLOT_OFFSETS) {
            if let Some(slot) = slot {
                buf[offset..offset + CommitSlot::SIZE].copy_from_slice(&slot.to_bytes());
            }
        }
        buf
    }

    /// Parses a header, verifying each slot independently.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the buffer is too short,
    /// `Error::InvalidMagic` if the magic number does not match,
    /// `Error::UnsupportedVersion` for versions newer than [`FORMAT_VERSION`],
    /// and `Error::InvalidPageSize` for an out-of-range page size.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Corrupted { reason: "Header too short".to_string() });
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = LittleEndian::read_u16(&buf[8..10]);
        if version == 0 || version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        let page_size_power = buf[10];
        if page_size_power >= usize::BITS as u8 {
            return Err(Error::InvalidPageSize { size: 0 });
        }
        validate_page_size(1usize << page_size_power)?;

        let slots = Self::SLOT_OFFSETS
            .map(|offset| CommitSlot::from_bytes(&buf[offset..offset + CommitSlot::SIZE]));

        Ok(Self { version, page_size_power, god_byte: buf[Self::GOD_BYTE_OFFSET], slots })
    }

    /// Picks the slot to open from: the primary if valid, else the secondary.
    ///
    /// # Errors
    ///
    /// Returns `Error::HeaderChecksumMismatch` if neither slot verifies.
    pub fn validate_and_choose_slot(&self) -> Result<usize> {
        let primary = self.primary_slot_index();
        if self.slots[primary].is_some() {
            return Ok(primary);
        }

        let secondary = self.secondary_slot_index();
        if self.slots[secondary].is_some() {
            return Ok(secondary);
        }

        Err(Error::HeaderChecksumMismatch)
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.page_size_power
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_slot() -> CommitSlot {
        CommitSlot {
            directory_root: 42,
            total_pages: 100,
            txn_id: 12345,
            timestamp: 1_700_000_000,
            freelist_page: 90,
            freelist_pages: 7,
        }
    }

    #[test]
    fn test_fresh_header_is_valid() {
        let header = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER);
        let parsed = DatabaseHeader::from_bytes(&header.to_bytes()).unwrap();

        assert_eq!(parsed.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(parsed.validate_and_choose_slot().unwrap(), 0);
        assert!(!parsed.recovery_required());
        let slot = parsed.slot(0).unwrap();
        assert_eq!(slot.directory_root, 0);
        assert_eq!(slot.total_pages, 1);
    }

    #[test]
    fn test_commit_slot_round_trip() {
        let slot = sample_slot();
        let recovered = CommitSlot::from_bytes(&slot.to_bytes()).unwrap();
        assert_eq!(slot, recovered);
    }

    #[test]
    fn test_commit_slot_rejects_flipped_bit() {
        let mut bytes = sample_slot().to_bytes();
        bytes[3] ^= 0x10;
        assert!(CommitSlot::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_dual_slot_selection() {
        let mut header = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER);
        assert_eq!(header.primary_slot_index(), 0);
        assert_eq!(header.secondary_slot_index(), 1);

        header.set_secondary_slot(sample_slot());
        header.flip_primary_slot();
        assert_eq!(header.primary_slot_index(), 1);

        let parsed = DatabaseHeader::from_bytes(&header.to_bytes()).unwrap();
        let chosen = parsed.validate_and_choose_slot().unwrap();
        assert_eq!(chosen, 1);
        assert_eq!(parsed.slot(chosen), Some(&sample_slot()));
    }

    #[test]
    fn test_recovery_flag() {
        let mut header = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER);
        header.set_recovery_required(true);
        assert!(header.recovery_required());
        assert_eq!(header.primary_slot_index(), 0);

        let parsed = DatabaseHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(parsed.recovery_required());

        header.set_recovery_required(false);
        assert!(!header.recovery_required());
    }

    #[test]
    fn test_slot_validation_fallback_to_secondary() {
        let mut header = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER);
        header.set_secondary_slot(sample_slot());
        let mut bytes = header.to_bytes();

        // Slot 0 checksum lives at 16 + 48.
        bytes[64] ^= 0xFF;

        let parsed = DatabaseHeader::from_bytes(&bytes).unwrap();
        assert!(parsed.slot(0).is_none());
        assert_eq!(parsed.validate_and_choose_slot().unwrap(), 1);
    }

    #[test]
    fn test_both_slots_corrupt() {
        let mut bytes = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER).to_bytes();
        bytes[64] ^= 0xFF;
        bytes[128] ^= 0xFF;

        let parsed = DatabaseHeader::from_bytes(&bytes).unwrap();
        assert!(matches!(parsed.validate_and_choose_slot(), Err(Error::HeaderChecksumMismatch)));
    }

    #[test]
    fn test_rejects_foreign_files() {
        let mut bytes = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(DatabaseHeader::from_bytes(&bytes), Err(Error::InvalidMagic)));

        let mut bytes = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER).to_bytes();
        bytes[8..10].copy_from_slice(&9u16.to_le_bytes());
        assert!(matches!(
            DatabaseHeader::from_bytes(&bytes),
            Err(Error::UnsupportedVersion { version: 9 })
        ));

        let mut bytes = DatabaseHeader::new(DEFAULT_PAGE_SIZE_POWER).to_bytes();
        bytes[10] = 3;
        assert!(matches!(DatabaseHeader::from_bytes(&bytes), Err(Error::InvalidPageSize { .. })));

        assert!(DatabaseHeader::from_bytes(&[0u8; 10]).is_err());
    }
}
