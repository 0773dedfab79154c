//! Storage driver trait definition.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Options for [`StorageDriver::write_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Fail with `AlreadyExists` instead of replacing an existing object.
    pub do_not_overwrite: bool,
}

impl WriteOptions {
    /// Options for an unconditional overwrite.
    #[must_use]
    pub const fn overwrite() -> Self {
        Self {
            do_not_overwrite: false,
        }
    }

    /// Options for a create-if-absent write.
    #[must_use]
    pub const fn create_new() -> Self {
        Self {
            do_not_overwrite: true,
        }
    }
}

/// Kind of a stat'ed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A regular object.
    File,
    /// A directory, or a key prefix on flat object stores.
    Dir,
}

/// Metadata returned by [`StorageDriver::stat`].
///
/// Times are epoch milliseconds. Backends that cannot report a time leave it
/// as `None`; `mtime_ms` is always filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// File or directory.
    pub kind: FileKind,
    /// Size in bytes (0 for directories on most backends).
    pub size: u64,
    /// Last modification time.
    pub mtime_ms: u64,
    /// Last access time, if known.
    pub atime_ms: Option<u64>,
    /// Creation time, if known.
    pub birthtime_ms: Option<u64>,
}

impl FileStat {
    /// Returns true for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Names of direct children, relative to the listed directory.
    pub entries: Vec<String>,
    /// Token for the next page; `None` when the listing is complete.
    pub continuation: Option<String>,
}

/// Static capability profile of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `rename` replaces the destination atomically.
    pub atomic_rename: bool,
    /// The backend has real directories (as opposed to key prefixes).
    pub hierarchical: bool,
    /// Maximum number of paths accepted by one `delete_batch` call.
    pub max_batch_delete: Option<usize>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            atomic_rename: false,
            hierarchical: false,
            max_batch_delete: None,
        }
    }
}

/// Joins a directory and a child name with `/`.
#[must_use]
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// A storage backend for ShelfDB.
///
/// Drivers are **opaque object stores** addressed by `/`-separated logical
/// paths. They know nothing about table files, append records or documents;
/// the core owns all of that.
///
/// # Invariants
///
/// - Not-found is never a failure for `unlink`, `exists`, `readdir` and
///   `remove_folder`
/// - `write_file` with `do_not_overwrite` never mutates an existing object
/// - `rename` replaces the destination; it may be copy-then-delete when
///   [`Capabilities::atomic_rename`] is false
/// - A driver may issue concurrent sub-requests but each call completes once
///
/// # Implementors
///
/// - [`super::InMemoryDriver`] - flat object store, used in tests
/// - [`super::FileDriver`] - local filesystem
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Short backend label used in logs.
    fn name(&self) -> &'static str;

    /// Capability profile of this backend.
    fn capabilities(&self) -> Capabilities;

    /// Prepares the backend (bucket creation, login). Optional.
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Creates or overwrites an object.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if `options.do_not_overwrite` is set and the
    /// object exists, or a transient error from the backend.
    async fn write_file(&self, path: &str, data: Bytes, options: WriteOptions)
        -> StorageResult<()>;

    /// Reads a whole object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object is absent.
    async fn read_file(&self, path: &str) -> StorageResult<Bytes>;

    /// Deletes an object. Absent objects are not an error.
    async fn unlink(&self, path: &str) -> StorageResult<()>;

    /// Moves `from` to `to`, replacing `to`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `from` is absent.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Returns whether an object or directory exists.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Returns metadata for an object or directory.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the path is absent.
    async fn stat(&self, path: &str) -> StorageResult<FileStat>;

    /// Lists the names of the direct children of a directory.
    ///
    /// An absent directory yields an empty list.
    async fn readdir(&self, path: &str) -> StorageResult<Vec<String>>;

    /// Creates a directory and its parents. May be a no-op.
    async fn mkdirp(&self, path: &str) -> StorageResult<()>;

    /// Recursively deletes a directory. Absent directories are not an error.
    async fn remove_folder(&self, path: &str) -> StorageResult<()>;

    /// Lists one page of a directory.
    ///
    /// The default implementation returns the whole `readdir` result as a
    /// single page.
    async fn list_page(&self, dir: &str, continuation: Option<String>) -> StorageResult<ListPage> {
        if continuation.is_some() {
            return Ok(ListPage::default());
        }
        Ok(ListPage {
            entries: self.readdir(dir).await?,
            continuation: None,
        })
    }

    /// Size in bytes of an object, or the total size of every object under
    /// a directory. An absent path has size 0.
    ///
    /// The default implementation stats the path and, for directories, walks
    /// the tree page by page.
    async fn size(&self, path: &str) -> StorageResult<u64> {
        match self.stat(path).await {
            Ok(stat) if !stat.is_dir() => return Ok(stat.size),
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut total = 0;
        let mut dirs = vec![path.to_string()];
        while let Some(dir) = dirs.pop() {
            let mut continuation = None;
            loop {
                let page = self.list_page(&dir, continuation).await?;
                for name in page.entries {
                    let child = join_path(&dir, &name);
                    match self.stat(&child).await {
                        Ok(stat) if stat.is_dir() => dirs.push(child),
                        Ok(stat) => total += stat.size,
                        // Deleted while walking.
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                match page.continuation {
                    Some(next) => continuation = Some(next),
                    None => break,
                }
            }
        }
        Ok(total)
    }

    /// Deletes several objects in the given order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `paths` exceeds
    /// [`Capabilities::max_batch_delete`].
    async fn delete_batch(&self, paths: &[String]) -> StorageResult<()> {
        if let Some(limit) = self.capabilities().max_batch_delete {
            if paths.len() > limit {
                return Err(crate::StorageError::invalid_input(format!(
                    "batch of {} exceeds delete limit {}",
                    paths.len(),
                    limit
                )));
            }
        }
        for path in paths {
            self.unlink(path).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for dyn StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageDriver({})", self.name())
    }
}
