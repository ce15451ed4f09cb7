//! Volatile backend: the header and pages live in a map behind one lock.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{DEFAULT_PAGE_SIZE, DatabaseHeader, HEADER_SIZE, StorageBackend};
use crate::{
    error::{Error, PageId, Result},
    page::validate_page_size,
};

struct Image {
    header: Vec<u8>,
    pages: HashMap<PageId, Vec<u8>>,
    /// Bytes covered so far, header included.
    len: u64,
}

/// Storage backend that keeps the whole store in process memory.
///
/// Nothing survives a drop. Unwritten pages read back as zeros, like the
/// holes of a sparse file.
pub struct InMemoryBackend {
    image: RwLock<Image>,
    page_size: usize,
}

impl InMemoryBackend {
    /// Backend using [`DEFAULT_PAGE_SIZE`].
    pub fn new() -> Self {
        Self::with_valid_size(DEFAULT_PAGE_SIZE)
    }

    /// Backend using `page_size`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPageSize`] if `page_size` is not a power of two
    /// in 512..=65536.
    pub fn with_page_size(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self::with_valid_size(page_size))
    }

    fn with_valid_size(page_size: usize) -> Self {
        let header = DatabaseHeader::new(page_size.trailing_zeros() as u8).to_bytes().to_vec();
        let image = Image { header, pages: HashMap::new(), len: HEADER_SIZE as u64 };
        Self { image: RwLock::new(image), page_size }
    }

    /// Distinct pages written so far.
    pub fn page_count(&self) -> usize {
        self.image.read().pages.len()
    }

    fn check_len(what: &str, got: usize, want: usize) -> Result<()> {
        if got != want {
            return Err(Error::Corrupted {
                reason: format!("{what} is {got} bytes, expected {want}"),
            });
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_header(&self) -> Result<Vec<u8>> {
        Ok(self.image.read().header.clone())
    }

    fn write_header(&self, header: &[u8]) -> Result<()> {
        Self::check_len("header", header.len(), HEADER_SIZE)?;
        self.image.write().header = header.to_vec();
        Ok(())
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let image = self.image.read();
        Ok(match image.pages.get(&page_id) {
            Some(data) => data.clone(),
            None => vec![0u8; self.page_size],
        })
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        Self::check_len("page", data.len(), self.page_size)?;
        let end = self.page_offset(page_id) + self.page_size as u64;
        let mut image = self.image.write();
        image.pages.insert(page_id, data.to_vec());
        image.len = image.len.max(end);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.image.read().len)
    }

    fn extend(&self, new_size: u64) -> Result<()> {
        let mut image = self.image.write();
        image.len = image.len.max(new_size);
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
