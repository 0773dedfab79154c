//! Append emulation over whole-object stores.

use crate::error::CoreResult;
use crate::layout::{append_dir, OrderKey, OrderKeyGenerator};
use crate::log::reader::list_records;
use bytes::Bytes;
use parking_lot::Mutex;
use shelfdb_storage::{join_path, StorageDriver, WriteOptions};
use std::collections::HashMap;
use std::sync::Arc;

/// Location and ordering key of a written append record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    /// Full path of the record object.
    pub path: String,
    /// Ordering key encoded in the record name.
    pub key: OrderKey,
}

/// Turns "append bytes to F" into "create a new record object beside F".
///
/// Each fragment becomes an immutable object in the append directory of the
/// logical file. Records are created with `do_not_overwrite`, so a name
/// collision surfaces as a conflict instead of silently replacing data.
///
/// Keys are issued per logical file. In strict mode the first append to a
/// file lists its pending records and continues above the newest one, so
/// records written by an earlier process never sort after new ones.
#[derive(Debug)]
pub struct AppendEmulator {
    driver: Arc<dyn StorageDriver>,
    strict: bool,
    generators: Mutex<HashMap<String, Arc<OrderKeyGenerator>>>,
}

impl AppendEmulator {
    /// Creates an emulator writing through `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn StorageDriver>, strict_order_keys: bool) -> Self {
        Self {
            driver,
            strict: strict_order_keys,
            generators: Mutex::new(HashMap::new()),
        }
    }

    /// Writes `data` as a new pending record of `logical_path`.
    ///
    /// # Errors
    ///
    /// Returns a `Conflict`-class storage error if the record name already
    /// exists, or any driver failure. Nothing is retried.
    pub async fn append_fragment(&self, logical_path: &str, data: Bytes) -> CoreResult<RecordRef> {
        let keys = self.generator(logical_path).await?;
        let dir = append_dir(logical_path);
        if self.driver.capabilities().hierarchical {
            self.driver.mkdirp(&dir).await?;
        }

        let key = keys.next_key();
        let path = join_path(&dir, &key.record_name());
        let len = data.len();
        self.driver
            .write_file(&path, data, WriteOptions::create_new())
            .await?;

        tracing::debug!(path = %path, bytes = len, "append record written");
        Ok(RecordRef { path, key })
    }

    /// Loads the key floor of `logical_path` from its pending records, if
    /// not done yet.
    ///
    /// # Errors
    ///
    /// Returns any listing failure.
    pub async fn resume(&self, logical_path: &str) -> CoreResult<()> {
        self.generator(logical_path).await?;
        Ok(())
    }

    /// Highest key issued (or continued from) for `logical_path` by this
    /// emulator. `None` before the first append and in loose mode.
    #[must_use]
    pub fn last_issued(&self, logical_path: &str) -> Option<OrderKey> {
        self.generators
            .lock()
            .get(logical_path)
            .and_then(|keys| keys.last_issued())
    }

    async fn generator(&self, logical_path: &str) -> CoreResult<Arc<OrderKeyGenerator>> {
        let existing = self.generators.lock().get(logical_path).cloned();
        if let Some(keys) = existing {
            return Ok(keys);
        }

        let keys = OrderKeyGenerator::new(self.strict);
        if self.strict {
            if let Some(newest) = list_records(self.driver.as_ref(), logical_path).await?.last() {
                tracing::debug!(path = %logical_path, key = %newest.key, "continuing after pending records");
                keys.observe(newest.key);
            }
        }

        let mut generators = self.generators.lock();
        let keys = generators
            .entry(logical_path.to_string())
            .or_insert_with(|| Arc::new(keys));
        Ok(Arc::clone(keys))
    }
}
