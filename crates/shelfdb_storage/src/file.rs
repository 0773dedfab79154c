//! Local filesystem driver.

use crate::diagnostics::DiagnosticRing;
use crate::driver::{Capabilities, FileKind, FileStat, StorageDriver, WriteOptions};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

/// A driver backed by the local filesystem.
///
/// Logical paths are resolved below a root directory and may not escape it.
///
/// # Durability
///
/// - Every `write_file` ends with `sync_all()` on the written file
/// - `rename` is the native atomic rename, followed by an fsync of the
///   destination's parent directory so the new entry survives power loss
///
/// # Example
///
/// ```no_run
/// use shelfdb_storage::FileDriver;
/// use std::path::Path;
///
/// let driver = FileDriver::open(Path::new("/var/lib/app")).unwrap();
/// assert!(driver.root().ends_with("app"));
/// ```
#[derive(Debug, Clone)]
pub struct FileDriver {
    root: PathBuf,
    ring: Arc<DiagnosticRing>,
}

impl FileDriver {
    /// Opens a driver rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            ring: Arc::default(),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Diagnostic ring of this driver.
    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticRing {
        &self.ring
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(StorageError::invalid_input(format!(
                        "path escapes the driver root: {path}"
                    )))
                }
            }
        }
        Ok(resolved)
    }

    fn check<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(err) = &result {
            self.ring.flush_on_error(self.name(), err);
        }
        result
    }

    async fn ensure_parent(target: &Path) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn write_inner(&self, path: &str, data: &[u8], options: WriteOptions) -> StorageResult<()> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target).await?;

        let mut open = tokio::fs::OpenOptions::new();
        open.write(true);
        if options.do_not_overwrite {
            open.create_new(true);
        } else {
            open.create(true).truncate(true);
        }
        let mut file = open
            .open(&target)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn rename_inner(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| StorageError::from_io(e, from))?;
        if let Some(parent) = target.parent() {
            sync_dir(parent).await?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn epoch_ms(time: io::Result<SystemTime>) -> Option<u64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl StorageDriver for FileDriver {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            atomic_rename: true,
            hierarchical: true,
            max_batch_delete: None,
        }
    }

    async fn write_file(
        &self,
        path: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> StorageResult<()> {
        self.ring.record("write_file", path);
        tracing::debug!(path, bytes = data.len(), "file write");
        let result = self.write_inner(path, &data, options).await;
        self.check(result)
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        self.ring.record("read_file", path);
        let target = self.resolve(path)?;
        let result = tokio::fs::read(&target)
            .await
            .map(Bytes::from)
            .map_err(|e| StorageError::from_io(e, path));
        self.check(result)
    }

    async fn unlink(&self, path: &str) -> StorageResult<()> {
        self.ring.record("unlink", path);
        let target = self.resolve(path)?;
        let result = ignore_not_found(tokio::fs::remove_file(&target).await).map_err(StorageError::from);
        self.check(result)
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.ring.record("rename", from);
        tracing::debug!(from, to, "file rename");
        let result = self.rename_inner(from, to).await;
        self.check(result)
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.ring.record("exists", path);
        let target = self.resolve(path)?;
        let result = tokio::fs::try_exists(&target).await.map_err(StorageError::from);
        self.check(result)
    }

    async fn stat(&self, path: &str) -> StorageResult<FileStat> {
        self.ring.record("stat", path);
        let target = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(e) => return self.check(Err(StorageError::from_io(e, path))),
        };
        Ok(FileStat {
            kind: if meta.is_dir() {
                FileKind::Dir
            } else {
                FileKind::File
            },
            size: meta.len(),
            mtime_ms: epoch_ms(meta.modified()).unwrap_or(0),
            atime_ms: epoch_ms(meta.accessed()),
            birthtime_ms: epoch_ms(meta.created()),
        })
    }

    async fn readdir(&self, path: &str) -> StorageResult<Vec<String>> {
        self.ring.record("readdir", path);
        let target = self.resolve(path)?;
        let mut entries = match tokio::fs::read_dir(&target).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return self.check(Err(e.into())),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn mkdirp(&self, path: &str) -> StorageResult<()> {
        self.ring.record("mkdirp", path);
        let target = self.resolve(path)?;
        let result = tokio::fs::create_dir_all(&target).await.map_err(StorageError::from);
        self.check(result)
    }

    async fn remove_folder(&self, path: &str) -> StorageResult<()> {
        self.ring.record("remove_folder", path);
        let target = self.resolve(path)?;
        let result =
            ignore_not_found(tokio::fs::remove_dir_all(&target).await).map_err(StorageError::from);
        self.check(result)
    }
}
