//! Rebuilding logical content from the main object and pending records.

use crate::error::{CoreError, CoreResult};
use crate::layout::{append_dir, temp_path, OrderKey};
use bytes::{Bytes, BytesMut};
use shelfdb_storage::{join_path, StorageDriver};
use std::sync::Arc;
use tokio::task::JoinSet;

/// A pending append record found in an append directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// Full path of the record object.
    pub path: String,
    /// Ordering key parsed from the name.
    pub key: OrderKey,
}

/// Lists the pending records of `logical_path`, sorted ascending by key.
///
/// Walks every listing page. Names that do not parse as record names are
/// skipped with a warning. An absent append directory yields no records.
///
/// # Errors
///
/// Returns any listing failure from the driver.
pub async fn list_records(
    driver: &dyn StorageDriver,
    logical_path: &str,
) -> CoreResult<Vec<PendingRecord>> {
    let dir = append_dir(logical_path);
    let mut records = Vec::new();
    let mut continuation = None;

    loop {
        let page = driver.list_page(&dir, continuation).await?;
        for name in page.entries {
            match OrderKey::parse(&name) {
                Some(key) => records.push(PendingRecord {
                    path: join_path(&dir, &name),
                    key,
                }),
                None => tracing::warn!(dir = %dir, name = %name, "skipping foreign entry in append directory"),
            }
        }
        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
    }

    records.sort_by_key(|r| r.key);
    Ok(records)
}

/// Reads logical files: main content followed by pending records in order.
#[derive(Debug, Clone)]
pub struct LogReader {
    driver: Arc<dyn StorageDriver>,
    read_concurrency: usize,
}

impl LogReader {
    /// Creates a reader issuing at most `read_concurrency` record reads at
    /// once.
    #[must_use]
    pub fn new(driver: Arc<dyn StorageDriver>, read_concurrency: usize) -> Self {
        Self {
            driver,
            read_concurrency: read_concurrency.max(1),
        }
    }

    /// Reads the main object.
    ///
    /// An absent main object reads as empty, unless a temp object exists: that
    /// is a complete snapshot stranded by a crash inside a non-atomic rename,
    /// and is returned instead.
    ///
    /// # Errors
    ///
    /// Returns any driver failure other than not-found.
    pub async fn read_main(&self, logical_path: &str) -> CoreResult<Bytes> {
        match self.driver.read_file(logical_path).await {
            Ok(data) => return Ok(data),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let temp = temp_path(logical_path);
        match self.driver.read_file(&temp).await {
            Ok(data) => {
                tracing::warn!(path = %logical_path, "main object missing, reading stranded temp object");
                Ok(data)
            }
            Err(e) if e.is_not_found() => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the full logical content of `logical_path`.
    ///
    /// # Errors
    ///
    /// Returns any driver failure, including not-found on a listed record.
    pub async fn read_logical(&self, logical_path: &str) -> CoreResult<Bytes> {
        let main = self.read_main(logical_path).await?;
        let records = list_records(self.driver.as_ref(), logical_path).await?;
        if records.is_empty() {
            return Ok(main);
        }

        let fragments = self.read_records(&records).await?;
        let total = main.len() + fragments.iter().map(Bytes::len).sum::<usize>();
        let mut out = BytesMut::with_capacity(total);
        out.extend_from_slice(&main);
        for fragment in &fragments {
            out.extend_from_slice(fragment);
        }

        tracing::debug!(path = %logical_path, records = records.len(), bytes = total, "logical file read");
        Ok(out.freeze())
    }

    /// Reads the given records concurrently, returning contents in the same
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the first read failure. Outstanding reads are cancelled.
    pub async fn read_records(&self, records: &[PendingRecord]) -> CoreResult<Vec<Bytes>> {
        let mut slots: Vec<Option<Bytes>> = vec![None; records.len()];
        let mut tasks = JoinSet::new();

        for (idx, record) in records.iter().enumerate() {
            while tasks.len() >= self.read_concurrency {
                Self::collect_one(&mut tasks, &mut slots).await?;
            }
            let driver = Arc::clone(&self.driver);
            let path = record.path.clone();
            tasks.spawn(async move { (idx, driver.read_file(&path).await) });
        }
        while !tasks.is_empty() {
            Self::collect_one(&mut tasks, &mut slots).await?;
        }

        Ok(slots.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn collect_one(
        tasks: &mut JoinSet<(usize, shelfdb_storage::StorageResult<Bytes>)>,
        slots: &mut [Option<Bytes>],
    ) -> CoreResult<()> {
        match tasks.join_next().await {
            Some(Ok((idx, result))) => {
                slots[idx] = Some(result?);
                Ok(())
            }
            Some(Err(join)) => Err(CoreError::task_panicked(join.to_string())),
            None => Ok(()),
        }
    }
}
