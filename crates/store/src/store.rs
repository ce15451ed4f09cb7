//! Bucketed key-value facade over [`Database`].
//!
//! Each operation runs in its own transaction: reads in a read snapshot,
//! mutations in a write transaction that commits before returning. Scans hand
//! entries to a visitor that returns `false` to stop early.

use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crate::{
    backend::{FileBackend, InMemoryBackend, StorageBackend},
    btree::{
        PageReader,
        cursor::{Entries, Range},
    },
    db::{Database, DatabaseConfig, DatabaseStats, ReadTransaction, WriteTransaction},
    error::{Error, Result},
};

/// Length of a stored counter value.
const COUNTER_LEN: usize = 8;

/// An open store.
///
/// A plain owned handle; share it behind an `Arc` to use it from several
/// threads.
///
/// ```no_run
/// use bucketdb_store::Store;
///
/// let store = Store::open("app.db")?;
/// store.create_bucket_if_not_exists(b"visits")?;
/// let count = store.incr(b"visits", b"/index.html")?;
/// store.save(b"visits", b"last", b"/index.html")?;
/// store.scan(b"visits", |key, value| {
///     println!("{key:?} = {value:?}");
///     true
/// })?;
/// store.close()?;
/// # Ok::<(), bucketdb_store::Error>(())
/// ```
pub struct Store<B: StorageBackend = FileBackend> {
    db: Database<B>,
}

impl Store<FileBackend> {
    /// Opens the store file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a valid store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { db: Database::open(path)? })
    }

    /// Opens the store file at `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a valid store.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        Ok(Self { db: Database::open_with_config(path, config)? })
    }
}

impl Store<InMemoryBackend> {
    /// Opens a store that lives in memory only.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be initialized.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { db: Database::open_in_memory()? })
    }
}

impl<B: StorageBackend> Store<B> {
    /// Wraps an open database.
    pub fn from_database(db: Database<B>) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    pub fn database(&self) -> &Database<B> {
        &self.db
    }

    /// Closes the store, persisting its free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final header write fails.
    pub fn close(self) -> Result<()> {
        self.db.close()
    }

    /// Returns database statistics.
    pub fn stats(&self) -> DatabaseStats {
        self.db.stats()
    }

    /// Runs `f` inside a read transaction.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTransaction<'_, B>) -> Result<T>) -> Result<T> {
        let txn = self.db.read()?;
        f(&txn)
    }

    /// Runs `f` inside a write transaction, committing if it succeeds.
    ///
    /// The transaction rolls back when `f` fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, of acquiring the write lock or of the commit.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut WriteTransaction<'_, B>) -> Result<T>,
    ) -> Result<T> {
        let mut txn = self.db.write()?;
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Creates `bucket` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBucketName`] for empty or over-long names.
    pub fn create_bucket_if_not_exists(&self, bucket: &[u8]) -> Result<()> {
        self.update(|txn| txn.create_bucket_if_not_exists(bucket).map(drop))
    }

    /// Deletes `bucket` and all its entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn delete_bucket(&self, bucket: &[u8]) -> Result<()> {
        self.update(|txn| txn.delete_bucket(bucket))
    }

    /// Lists bucket names in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn buckets(&self) -> Result<Vec<Vec<u8>>> {
        self.view(|txn| txn.bucket_names())
    }

    /// Increments the big-endian `u64` counter under `key`, returning the new value.
    ///
    /// A missing key counts as 0. The counter saturates at `u64::MAX`; a
    /// saturated counter is left untouched and commits nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist and
    /// [`Error::InvalidCounter`] if the stored value is not 8 bytes long.
    pub fn incr(&self, bucket: &[u8], key: &[u8]) -> Result<u64> {
        self.update(|txn| {
            let current = match txn.get(bucket, key)? {
                Some(bytes) => decode_counter(&bytes)?,
                None => 0,
            };
            if current == u64::MAX {
                return Ok(current);
            }
            let next = current + 1;

            let mut buf = [0u8; COUNTER_LEN];
            BigEndian::write_u64(&mut buf, next);
            txn.insert(bucket, key, &buf)?;
            Ok(next)
        })
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist, and
    /// the entry validation errors of [`WriteTransaction::insert`].
    pub fn save(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.update(|txn| txn.insert(bucket, key, value).map(drop))
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key or the bucket is absent.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        match self.view(|txn| txn.get(bucket, key)) {
            Ok(Some(value)) => Ok(value),
            Ok(None) | Err(Error::BucketNotFound { .. }) => Err(Error::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Removes `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        self.update(|txn| txn.delete(bucket, key).map(drop))
    }

    /// Visits every entry of `bucket` in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn scan(&self, bucket: &[u8], visitor: impl FnMut(&[u8], &[u8]) -> bool) -> Result<()> {
        self.view(|txn| visit(txn.iter(bucket)?, visitor))
    }

    /// Visits the entries whose key starts with `prefix`, in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn find_prefix(
        &self,
        bucket: &[u8],
        prefix: &[u8],
        visitor: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.view(|txn| visit(txn.prefix(bucket, prefix)?, visitor))
    }

    /// Visits the entries with `start <= key <= end`, in ascending key order.
    ///
    /// Reversed bounds are swapped first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket does not exist.
    pub fn find_between(
        &self,
        bucket: &[u8],
        start: &[u8],
        end: &[u8],
        visitor: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let (start, end) = if start > end { (end, start) } else { (start, end) };
        self.view(|txn| visit(txn.range(bucket, Range::inclusive(start, end))?, visitor))
    }
}

fn decode_counter(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != COUNTER_LEN {
        return Err(Error::InvalidCounter { len: bytes.len() });
    }
    Ok(BigEndian::read_u64(bytes))
}

/// Feeds entries to `visitor` until it returns false or they run out.
fn visit<R: PageReader>(
    entries: Entries<'_, R>,
    mut visitor: impl FnMut(&[u8], &[u8]) -> bool,
) -> Result<()> {
    for entry in entries {
        let (key, value) = entry?;
        if !visitor(&key, &value) {
            break;
        }
    }
    Ok(())
}
