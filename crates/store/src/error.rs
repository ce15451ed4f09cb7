//! Error types for the bucketdb storage engine.

use std::io;

use snafu::Snafu;

/// Page identifier type. Page 0 is never allocated and doubles as "none".
pub type PageId = u64;

/// Result type alias for storage engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage engine operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Key (or the bucket holding it) is absent.
    #[snafu(display("key not found in store"))]
    NotFound,

    /// Named bucket does not exist.
    #[snafu(display("Bucket not found: {name}"))]
    BucketNotFound {
        /// Bucket name (lossy UTF-8).
        name: String,
    },

    /// Named bucket already exists.
    #[snafu(display("Bucket already exists: {name}"))]
    BucketExists {
        /// Bucket name (lossy UTF-8).
        name: String,
    },

    /// Bucket name is empty or too long.
    #[snafu(display("Invalid bucket name: {reason}"))]
    InvalidBucketName {
        /// Why the name was rejected.
        reason: &'static str,
    },

    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The backing file cannot grow any further.
    #[snafu(display("Out of space: cannot allocate more pages"))]
    OutOfSpace,

    /// Another write transaction held the write lock past the deadline.
    #[snafu(display("Write transaction conflict: lock not acquired after {waited_ms} ms"))]
    TxConflict {
        /// How long the caller waited, in milliseconds.
        waited_ms: u64,
    },

    /// Database file is corrupted or has invalid format.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Database header checksum verification failed.
    #[snafu(display("Header checksum mismatch"))]
    HeaderChecksumMismatch,

    /// Page checksum verification failed.
    #[snafu(display("Page {page_id} checksum mismatch"))]
    PageChecksumMismatch {
        /// The page whose checksum failed.
        page_id: PageId,
    },

    /// Invalid magic number in database header.
    #[snafu(display("Invalid database magic number"))]
    InvalidMagic,

    /// Unsupported database format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Page size is not a power of two in 512..=65536.
    #[snafu(display("Invalid page size: {size}"))]
    InvalidPageSize {
        /// The rejected page size.
        size: usize,
    },

    /// Page type mismatch (expected different type).
    #[snafu(display("Page type mismatch: expected {expected:?}, found {found:?}"))]
    PageTypeMismatch {
        /// The expected page type.
        expected: PageType,
        /// The actual page type found.
        found: PageType,
    },

    /// Page was never written.
    #[snafu(display("Page {page_id} not found"))]
    PageNotFound {
        /// The missing page ID.
        page_id: PageId,
    },

    /// A write targeted a page that the current transaction did not allocate.
    #[snafu(display("Page {page_id} is not writable in this transaction"))]
    PageNotWritable {
        /// The committed page that was about to be overwritten.
        page_id: PageId,
    },

    /// Keys must be at least one byte long.
    #[snafu(display("Key must not be empty"))]
    EmptyKey,

    /// Key too large for inline storage.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Key plus value too large for inline storage.
    #[snafu(display("Value too large: {size} bytes (max {max})"))]
    ValueTooLarge {
        /// Actual size of the entry in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// A counter value is not an 8-byte big-endian integer.
    #[snafu(display("Invalid counter: expected 8 bytes, found {len}"))]
    InvalidCounter {
        /// Length of the stored value.
        len: usize,
    },

    /// Encoded node does not fit in a page.
    #[snafu(display("Page is full"))]
    PageFull,
}

impl Error {
    /// Returns true for the "absent" outcomes callers usually treat as normal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound | Error::BucketNotFound { .. })
    }

    pub(crate) fn bucket_not_found(name: &[u8]) -> Self {
        Error::BucketNotFound { name: String::from_utf8_lossy(name).into_owned() }
    }
}

// Storage exhaustion surfaces as OutOfSpace rather than a generic I/O error.
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        const ENOSPC: i32 = 28;
        let enospc = cfg!(unix) && source.raw_os_error() == Some(ENOSPC);
        if enospc || source.kind() == io::ErrorKind::StorageFull {
            return Error::OutOfSpace;
        }
        Error::Io { source }
    }
}

/// Page types in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Free/unused page.
    Free = 0,
    /// B-tree branch (internal) node.
    Branch = 1,
    /// B-tree leaf node.
    Leaf = 2,
    /// Run of pages holding the persisted free list.
    FreeList = 3,
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Branch),
            2 => Ok(Self::Leaf),
            3 => Ok(Self::FreeList),
            _ => Err(Error::Corrupted { reason: format!("Invalid page type: {}", value) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display_matches_store_message() {
        assert_eq!(format!("{}", Error::NotFound), "key not found in store");
    }

    #[test]
    fn test_bucket_not_found_is_not_found() {
        let err = Error::bucket_not_found(b"widgets");
        assert_eq!(format!("{err}"), "Bucket not found: widgets");
        assert!(err.is_not_found());
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::OutOfSpace.is_not_found());
    }

    #[test]
    fn test_error_display_tx_conflict() {
        let err = Error::TxConflict { waited_ms: 250 };
        assert_eq!(format!("{err}"), "Write transaction conflict: lock not acquired after 250 ms");
    }

    #[test]
    fn test_error_display_page_checksum_mismatch() {
        let err = Error::PageChecksumMismatch { page_id: 42 };
        assert_eq!(format!("{err}"), "Page 42 checksum mismatch");
    }

    #[test]
    fn test_error_display_page_type_mismatch() {
        let err = Error::PageTypeMismatch { expected: PageType::Leaf, found: PageType::Branch };
        let display = format!("{err}");
        assert!(display.contains("Leaf"), "got: {display}");
        assert!(display.contains("Branch"), "got: {display}");
    }

    #[test]
    fn test_error_display_key_too_large() {
        let err = Error::KeyTooLarge { size: 1000, max: 500 };
        assert_eq!(format!("{err}"), "Key too large: 1000 bytes (max 500)");
    }

    #[test]
    fn test_error_display_invalid_counter() {
        let err = Error::InvalidCounter { len: 3 };
        assert_eq!(format!("{err}"), "Invalid counter: expected 8 bytes, found 3");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        match err {
            Error::Io { source } => assert_eq!(source.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("Expected Io variant, got {other:?}"),
        }
    }

    #[test]
    fn test_storage_full_maps_to_out_of_space() {
        #[cfg(unix)]
        {
            let err: Error = io::Error::from_raw_os_error(28).into();
            assert!(matches!(err, Error::OutOfSpace), "got {err:?}");
        }

        let err: Error = io::Error::new(io::ErrorKind::StorageFull, "disk full").into();
        assert!(matches!(err, Error::OutOfSpace), "got {err:?}");
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as StdError;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.source().is_some(), "Error::Io should have a source");
    }

    #[test]
    fn test_page_type_round_trip() {
        for page_type in [PageType::Free, PageType::Branch, PageType::Leaf, PageType::FreeList] {
            assert_eq!(PageType::try_from(page_type as u8).unwrap(), page_type);
        }
        assert!(PageType::try_from(9).is_err());
    }
}
