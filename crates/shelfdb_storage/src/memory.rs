//! In-memory object store driver for testing.

use crate::diagnostics::DiagnosticRing;
use crate::driver::{Capabilities, FileKind, FileStat, ListPage, StorageDriver, WriteOptions};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of names returned per `list_page` call.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default `delete_batch` limit, matching common object-store APIs.
pub const DEFAULT_BATCH_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mtime_ms: u64,
}

/// An in-memory driver with flat object-store semantics.
///
/// Keys are full paths. There are no real folders: a "directory" exists while
/// at least one key lives under its prefix, `mkdirp` is a no-op, and `rename`
/// is copy-then-delete. This is the capability profile of the remote stores
/// the append log exists for, so tests against it exercise the hard paths.
///
/// Clones share the same objects.
///
/// # Example
///
/// ```rust
/// # tokio_test_block_on(async {
/// use shelfdb_storage::{InMemoryDriver, StorageDriver, WriteOptions};
/// use bytes::Bytes;
///
/// let driver = InMemoryDriver::new().with_page_size(2);
/// driver.write_file("db/a", Bytes::from_static(b"x"), WriteOptions::default()).await.unwrap();
/// assert!(driver.exists("db").await.unwrap());
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryDriver {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    page_size: usize,
    batch_limit: usize,
    ring: Arc<DiagnosticRing>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self {
            objects: Arc::default(),
            page_size: DEFAULT_PAGE_SIZE,
            batch_limit: DEFAULT_BATCH_LIMIT,
            ring: Arc::default(),
        }
    }
}

impl InMemoryDriver {
    /// Creates a new empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of names returned per listing page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the `delete_batch` limit.
    #[must_use]
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Returns every stored key, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Overrides the modification time of an object, for expiry tests.
    pub fn set_mtime(&self, path: &str, mtime_ms: u64) {
        if let Some(obj) = self.objects.write().get_mut(path) {
            obj.mtime_ms = mtime_ms;
        }
    }

    /// Diagnostic ring of this driver.
    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticRing {
        &self.ring
    }

    fn prefix(dir: &str) -> String {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        }
    }

    /// Sorted, de-duplicated direct children of `dir`.
    fn children(&self, dir: &str) -> BTreeSet<String> {
        let prefix = Self::prefix(dir);
        self.objects
            .read()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn fail<T>(&self, err: StorageError) -> StorageResult<T> {
        self.ring.flush_on_error(self.name(), &err);
        Err(err)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            atomic_rename: false,
            hierarchical: false,
            max_batch_delete: Some(self.batch_limit),
        }
    }

    async fn write_file(
        &self,
        path: &str,
        data: Bytes,
        options: WriteOptions,
    ) -> StorageResult<()> {
        self.ring.record("write_file", path);
        let mut objects = self.objects.write();
        if options.do_not_overwrite && objects.contains_key(path) {
            drop(objects);
            return self.fail(StorageError::already_exists(path));
        }
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                mtime_ms: now_ms(),
            },
        );
        Ok(())
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        self.ring.record("read_file", path);
        let found = self.objects.read().get(path).map(|o| o.data.clone());
        match found {
            Some(data) => Ok(data),
            None => self.fail(StorageError::not_found(path)),
        }
    }

    async fn unlink(&self, path: &str) -> StorageResult<()> {
        self.ring.record("unlink", path);
        self.objects.write().remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.ring.record("rename", from);
        // Two steps, like a remote copy followed by a delete.
        let source = self.objects.read().get(from).cloned();
        let Some(source) = source else {
            return self.fail(StorageError::not_found(from));
        };
        self.objects.write().insert(to.to_string(), source);
        self.objects.write().remove(from);
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.ring.record("exists", path);
        if self.objects.read().contains_key(path) {
            return Ok(true);
        }
        Ok(!self.children(path).is_empty())
    }

    async fn stat(&self, path: &str) -> StorageResult<FileStat> {
        self.ring.record("stat", path);
        if let Some(obj) = self.objects.read().get(path) {
            return Ok(FileStat {
                kind: FileKind::File,
                size: obj.data.len() as u64,
                mtime_ms: obj.mtime_ms,
                atime_ms: None,
                birthtime_ms: None,
            });
        }
        let prefix = Self::prefix(path);
        let newest = self
            .objects
            .read()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, obj)| obj.mtime_ms)
            .max();
        match newest {
            Some(mtime_ms) => Ok(FileStat {
                kind: FileKind::Dir,
                size: 0,
                mtime_ms,
                atime_ms: None,
                birthtime_ms: None,
            }),
            None => self.fail(StorageError::not_found(path)),
        }
    }

    async fn readdir(&self, path: &str) -> StorageResult<Vec<String>> {
        self.ring.record("readdir", path);
        Ok(self.children(path).into_iter().collect())
    }

    async fn mkdirp(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn remove_folder(&self, path: &str) -> StorageResult<()> {
        self.ring.record("remove_folder", path);
        let prefix = Self::prefix(path);
        self.objects
            .write()
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn list_page(&self, dir: &str, continuation: Option<String>) -> StorageResult<ListPage> {
        self.ring.record("list_page", dir);
        let children = self.children(dir);
        let remaining: Vec<String> = match continuation {
            Some(after) => children
                .into_iter()
                .filter(|name| name.as_str() > after.as_str())
                .collect(),
            None => children.into_iter().collect(),
        };
        let more = remaining.len() > self.page_size;
        let entries: Vec<String> = remaining.into_iter().take(self.page_size).collect();
        let continuation = if more { entries.last().cloned() } else { None };
        Ok(ListPage {
            entries,
            continuation,
        })
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        self.ring.record("size", path);
        let objects = self.objects.read();
        if let Some(obj) = objects.get(path) {
            return Ok(obj.data.len() as u64);
        }
        let prefix = Self::prefix(path);
        Ok(objects
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, obj)| obj.data.len() as u64)
            .sum())
    }

    async fn delete_batch(&self, paths: &[String]) -> StorageResult<()> {
        if paths.len() > self.batch_limit {
            return self.fail(StorageError::invalid_input(format!(
                "batch of {} exceeds delete limit {}",
                paths.len(),
                self.batch_limit
            )));
        }
        self.ring.record("delete_batch", paths.first().cloned().unwrap_or_default());
        let mut objects = self.objects.write();
        for path in paths {
            objects.remove(path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn memory_write_and_read() {
        let driver = InMemoryDriver::new();
        driver
            .write_file("a/b.db", data("hello"), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(driver.read_file("a/b.db").await.unwrap(), data("hello"));
    }

    #[tokio::test]
    async fn memory_read_missing_is_not_found() {
        let driver = InMemoryDriver::new();
        let err = driver.read_file("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn memory_do_not_overwrite_keeps_existing() {
        let driver = InMemoryDriver::new();
        driver
            .write_file("x", data("first"), WriteOptions::create_new())
            .await
            .unwrap();
        let err = driver
            .write_file("x", data("second"), WriteOptions::create_new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(driver.read_file("x").await.unwrap(), data("first"));
    }

    #[tokio::test]
    async fn memory_unlink_is_idempotent() {
        let driver = InMemoryDriver::new();
        driver.unlink("ghost").await.unwrap();
        driver.unlink("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn memory_rename_replaces_destination() {
        let driver = InMemoryDriver::new();
        driver.write_file("t~", data("new"), WriteOptions::default()).await.unwrap();
        driver.write_file("t", data("old"), WriteOptions::default()).await.unwrap();
        driver.rename("t~", "t").await.unwrap();
        assert_eq!(driver.read_file("t").await.unwrap(), data("new"));
        assert!(!driver.exists("t~").await.unwrap());
    }

    #[tokio::test]
    async fn memory_rename_missing_source_fails() {
        let driver = InMemoryDriver::new();
        assert!(driver.rename("a", "b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn memory_directories_are_prefixes() {
        let driver = InMemoryDriver::new();
        driver.mkdirp("d").await.unwrap();
        assert!(!driver.exists("d").await.unwrap());
        assert!(driver.readdir("d").await.unwrap().is_empty());

        driver.write_file("d/one", data("1"), WriteOptions::default()).await.unwrap();
        driver.write_file("d/sub/two", data("2"), WriteOptions::default()).await.unwrap();
        assert!(driver.exists("d").await.unwrap());
        assert_eq!(driver.readdir("d").await.unwrap(), vec!["one", "sub"]);
        assert!(driver.stat("d").await.unwrap().is_dir());
        assert!(!driver.stat("d/one").await.unwrap().is_dir());

        driver.remove_folder("d").await.unwrap();
        assert_eq!(driver.object_count(), 0);
        driver.remove_folder("d").await.unwrap();
    }

    #[tokio::test]
    async fn memory_stat_missing_fails() {
        let driver = InMemoryDriver::new();
        assert!(driver.stat("nothing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn memory_list_pages() {
        let driver = InMemoryDriver::new().with_page_size(2);
        for i in 0..5 {
            driver
                .write_file(&format!("dir/f{i}"), data("x"), WriteOptions::default())
                .await
                .unwrap();
        }

        let mut all = Vec::new();
        let mut token = None;
        let mut pages = 0;
        loop {
            let page = driver.list_page("dir", token).await.unwrap();
            pages += 1;
            all.extend(page.entries);
            token = page.continuation;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(all, vec!["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test]
    async fn memory_size_sums_prefix() {
        let driver = InMemoryDriver::new();
        for (path, value) in [("d/a", "123"), ("d/sub/b", "45"), ("dx", "9")] {
            driver.write_file(path, data(value), WriteOptions::default()).await.unwrap();
        }
        assert_eq!(driver.size("d/a").await.unwrap(), 3);
        assert_eq!(driver.size("d").await.unwrap(), 5);
        assert_eq!(driver.size("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_batch_limit_is_enforced() {
        let driver = InMemoryDriver::new().with_batch_limit(2);
        let paths: Vec<String> = (0..3).map(|i| format!("p{i}")).collect();
        for p in &paths {
            driver.write_file(p, data("x"), WriteOptions::default()).await.unwrap();
        }
        let err = driver.delete_batch(&paths).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput { .. }));
        assert_eq!(driver.object_count(), 3);

        driver.delete_batch(&paths[..2]).await.unwrap();
        assert_eq!(driver.keys(), vec!["p2"]);
    }

    #[tokio::test]
    async fn memory_clones_share_objects() {
        let driver = InMemoryDriver::new();
        let other = driver.clone();
        driver.write_file("k", data("v"), WriteOptions::default()).await.unwrap();
        assert!(other.exists("k").await.unwrap());
    }
}
