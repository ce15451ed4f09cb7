//! Single-file backend built on positional reads and writes.
//!
//! The file is the header followed by the page array. Reads use
//! `read_exact_at` and never move a shared cursor, so any number of readers
//! can hit the file at once. Writers and `set_len` calls take a short
//! [`parking_lot::Mutex`]; with one write transaction at a time it is almost
//! never contended.

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::{DatabaseHeader, HEADER_SIZE, StorageBackend};
use crate::{
    error::{Error, PageId, Result},
    page::validate_page_size,
};

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Storage backend over one database file.
///
/// Writes reach the disk only after [`sync`](StorageBackend::sync). Atomicity
/// across a crash is the job of the dual commit slots in [`DatabaseHeader`].
pub struct FileBackend {
    file: File,
    grow_lock: Mutex<()>,
    page_size: usize,
    path: PathBuf,
}

impl FileBackend {
    /// Opens an existing store file, taking the page size from its header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or is shorter than
    /// a header, [`Error::InvalidMagic`] or [`Error::UnsupportedVersion`] for
    /// foreign files, and [`Error::Corrupted`] for a malformed header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut raw = [0u8; HEADER_SIZE];
        file.read_at_exact(&mut raw, 0)?;
        let page_size = DatabaseHeader::from_bytes(&raw)?.page_size();

        Ok(Self { file, grow_lock: Mutex::new(()), page_size, path })
    }

    /// Creates (or truncates) a store file and writes a fresh header.
    ///
    /// On Unix the file is created with mode `0o600`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPageSize`] for an unsupported `page_size` and
    /// [`Error::Io`] if the file cannot be created or written.
    pub fn create(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);
        let file = options.open(&path)?;

        let header = DatabaseHeader::new(page_size.trailing_zeros() as u8);
        file.write_at_all(&header.to_bytes(), 0)?;
        file.sync_all()?;

        Ok(Self { file, grow_lock: Mutex::new(()), page_size, path })
    }

    /// Location of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn grow_to(&self, len: u64) -> Result<()> {
        if self.len()? < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }
}

fn expect_len(what: &str, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::Corrupted { reason: format!("{what} is {got} bytes, expected {want}") });
    }
    Ok(())
}

impl StorageBackend for FileBackend {
    fn read_header(&self) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; HEADER_SIZE];
        self.file.read_at_exact(&mut raw, 0)?;
        Ok(raw)
    }

    fn write_header(&self, header: &[u8]) -> Result<()> {
        expect_len("header", header.len(), HEADER_SIZE)?;
        let _guard = self.grow_lock.lock();
        Ok(self.file.write_at_all(header, 0)?)
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = self.page_offset(page_id);
        let mut page = vec![0u8; self.page_size];
        // Past the end of the file reads as a hole.
        if offset + self.page_size as u64 <= self.len()? {
            self.file.read_at_exact(&mut page, offset)?;
        }
        Ok(page)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        expect_len("page", data.len(), self.page_size)?;
        let offset = self.page_offset(page_id);
        let _guard = self.grow_lock.lock();
        self.grow_to(offset + self.page_size as u64)?;
        Ok(self.file.write_at_all(data, offset)?)
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    fn file_size(&self) -> Result<u64> {
        self.len()
    }

    fn extend(&self, new_size: u64) -> Result<()> {
        let _guard = self.grow_lock.lock();
        self.grow_to(new_size)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Whole-buffer reads and writes at an absolute offset.
trait PositionalIo {
    fn read_at_exact(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_at_all(&self, data: &[u8], offset: u64) -> io::Result<()>;
}

#[cfg(unix)]
impl PositionalIo for File {
    fn read_at_exact(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.read_exact_at(buf, offset)
    }

    fn write_at_all(&self, data: &[u8], offset: u64) -> io::Result<()> {
        self.write_all_at(data, offset)
    }
}

/// `seek_read` and `seek_write` move the file cursor, so these loop until
/// the whole buffer is transferred.
#[cfg(windows)]
impl PositionalIo for File {
    fn read_at_exact(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.seek_read(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                },
            }
        }
        Ok(())
    }

    fn write_at_all(&self, mut data: &[u8], mut offset: u64) -> io::Result<()> {
        while !data.is_empty() {
            match self.seek_write(data, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    data = &data[n..];
                    offset += n as u64;
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{sync::Arc, thread};

    use tempfile::tempdir;

    use super::*;
    use crate::backend::DEFAULT_PAGE_SIZE;

    fn scratch(page_size: usize) -> (tempfile::TempDir, FileBackend) {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("scratch.db"), page_size).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_reopen_reads_page_size_from_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sized.db");

        let created = FileBackend::create(&path, 8192).unwrap();
        assert_eq!(created.path(), path.as_path());
        drop(created);

        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.page_size(), 8192);
        let header = DatabaseHeader::from_bytes(&reopened.read_header().unwrap()).unwrap();
        assert_eq!(header.page_size(), 8192);
    }

    #[cfg(unix)]
    #[test]
    fn test_created_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, _backend) = scratch(DEFAULT_PAGE_SIZE);
        let mode = std::fs::metadata(dir.path().join("scratch.db")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_create_and_open_reject_bad_input() {
        let dir = tempdir().unwrap();
        let result = FileBackend::create(dir.path().join("bad.db"), 1000);
        assert!(matches!(result, Err(Error::InvalidPageSize { size: 1000 })));

        let foreign = dir.path().join("foreign.db");
        std::fs::write(&foreign, vec![0xAB; HEADER_SIZE]).unwrap();
        assert!(matches!(FileBackend::open(&foreign), Err(Error::InvalidMagic)));

        let short = dir.path().join("short.db");
        std::fs::write(&short, b"bucketdb").unwrap();
        assert!(matches!(FileBackend::open(&short), Err(Error::Io { .. })));
    }

    #[test]
    fn test_page_lands_after_header() {
        let (_dir, backend) = scratch(512);
        let mut page = vec![0u8; 512];
        page[0] = 0xC3;
        page[511] = 0x3C;

        backend.write_page(2, &page).unwrap();
        backend.sync().unwrap();

        assert_eq!(backend.read_page(2).unwrap(), page);
        assert_eq!(backend.file_size().unwrap(), HEADER_SIZE as u64 + 3 * 512);
        // Skipped slots are holes.
        assert_eq!(backend.read_page(1).unwrap(), vec![0u8; 512]);
        assert_eq!(backend.read_page(40).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_size_mismatches_are_rejected() {
        let (_dir, backend) = scratch(DEFAULT_PAGE_SIZE);
        assert!(matches!(backend.write_page(1, &[0u8; 10]), Err(Error::Corrupted { .. })));
        assert!(matches!(backend.write_header(&[0u8; 10]), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_extend_only_grows() {
        let (_dir, backend) = scratch(DEFAULT_PAGE_SIZE);
        assert_eq!(backend.file_size().unwrap(), HEADER_SIZE as u64);

        let target = HEADER_SIZE as u64 + 6 * DEFAULT_PAGE_SIZE as u64;
        backend.extend(target).unwrap();
        backend.extend(HEADER_SIZE as u64).unwrap();
        assert_eq!(backend.file_size().unwrap(), target);
    }

    #[test]
    fn test_readers_unaffected_by_writes_elsewhere() {
        let (_dir, backend) = scratch(DEFAULT_PAGE_SIZE);
        let backend = Arc::new(backend);
        let stable = vec![0x11u8; DEFAULT_PAGE_SIZE];
        backend.write_page(1, &stable).unwrap();

        let writer = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for round in 0u8..40 {
                    backend.write_page(6, &vec![round; DEFAULT_PAGE_SIZE]).unwrap();
                }
            })
        };
        for _ in 0..40 {
            assert_eq!(backend.read_page(1).unwrap(), stable);
        }
        writer.join().unwrap();

        assert_eq!(backend.read_page(6).unwrap(), vec![39u8; DEFAULT_PAGE_SIZE]);
    }
}
