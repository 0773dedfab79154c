//! Table-file operations over any storage driver.

use crate::config::Config;
use crate::error::CoreResult;
use crate::layout::{append_dir, temp_path};
use crate::log::{list_records, AppendEmulator, CompactionReport, Compactor, LogReader, PendingRecord, RecordRef};
use bytes::Bytes;
use shelfdb_storage::StorageDriver;
use std::sync::Arc;

/// The table-file surface a datastore persists through.
///
/// Combines the append emulator, reader and compactor over one driver. All
/// operations take the logical path of the table file.
#[derive(Debug)]
pub struct TableFiles {
    driver: Arc<dyn StorageDriver>,
    emulator: AppendEmulator,
    reader: LogReader,
    compactor: Compactor,
}

impl TableFiles {
    /// Creates the table-file layer using defaults from `Config`.
    #[must_use]
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self::with_config(driver, &Config::default())
    }

    /// Creates the table-file layer with explicit settings.
    #[must_use]
    pub fn with_config(driver: Arc<dyn StorageDriver>, config: &Config) -> Self {
        Self {
            emulator: AppendEmulator::new(Arc::clone(&driver), config.strict_order_keys),
            reader: LogReader::new(Arc::clone(&driver), config.read_concurrency),
            compactor: Compactor::new(Arc::clone(&driver)),
            driver,
        }
    }

    /// The underlying driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Appends `data` to the logical file as a new pending record.
    ///
    /// # Errors
    ///
    /// Returns any driver failure. A name collision is a `Conflict`.
    pub async fn append_table_file(&self, path: &str, data: Bytes) -> CoreResult<RecordRef> {
        self.emulator.append_fragment(path, data).await
    }

    /// Reads the full logical content of the file.
    ///
    /// # Errors
    ///
    /// Returns any driver failure other than an absent main object.
    pub async fn read_table_file(&self, path: &str) -> CoreResult<Bytes> {
        self.reader.read_logical(path).await
    }

    /// Overwrites the main object in place and retires absorbed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_table_file(&self, path: &str, data: Bytes) -> CoreResult<CompactionReport> {
        self.compactor
            .write_direct(path, data, self.emulator.last_issued(path))
            .await
    }

    /// Replaces the logical content through temp-then-rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp write or rename fails, leaving the
    /// previous main object intact.
    pub async fn crash_safe_write_table_file(&self, path: &str, data: Bytes) -> CoreResult<CompactionReport> {
        self.compactor
            .compact(path, data, self.emulator.last_issued(path))
            .await
    }

    /// Deletes the append directory, the temp object and the main object,
    /// in that order.
    ///
    /// The main object goes last so an interrupted delete never leaves
    /// pending records or a stale temp object without their snapshot.
    ///
    /// # Errors
    ///
    /// Returns any driver failure. Missing pieces are not failures.
    pub async fn delete_table_files(&self, path: &str) -> CoreResult<()> {
        self.driver.remove_folder(&append_dir(path)).await?;
        self.driver.unlink(&temp_path(path)).await?;
        self.driver.unlink(path).await?;
        tracing::debug!(path = %path, "table files deleted");
        Ok(())
    }

    /// Restores the main object from a stranded temp object.
    ///
    /// Returns `true` if a recovery rename happened.
    ///
    /// # Errors
    ///
    /// Returns any driver failure.
    pub async fn ensure_integrity(&self, path: &str) -> CoreResult<bool> {
        if self.driver.exists(path).await? {
            return Ok(false);
        }
        let temp = temp_path(path);
        if !self.driver.exists(&temp).await? {
            return Ok(false);
        }
        self.driver.rename(&temp, path).await?;
        tracing::warn!(path = %path, "main object restored from temp object");
        Ok(true)
    }

    /// Bytes stored for the file: main object plus pending records.
    ///
    /// # Errors
    ///
    /// Returns any driver failure.
    pub async fn stored_size(&self, path: &str) -> CoreResult<u64> {
        let main = self.driver.size(path).await?;
        let pending = self.driver.size(&append_dir(path)).await?;
        Ok(main + pending)
    }

    /// Continues order keys above the pending records of the file.
    ///
    /// Appends do this lazily; calling it up front lets a compaction that
    /// runs before any append absorb every record already on storage.
    ///
    /// # Errors
    ///
    /// Returns any listing failure.
    pub async fn resume_order_keys(&self, path: &str) -> CoreResult<()> {
        self.emulator.resume(path).await
    }

    /// Lists the pending records of the file, oldest first.
    ///
    /// # Errors
    ///
    /// Returns any listing failure.
    pub async fn pending_records(&self, path: &str) -> CoreResult<Vec<PendingRecord>> {
        list_records(self.driver.as_ref(), path).await
    }
}
