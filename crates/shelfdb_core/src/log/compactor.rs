//! Crash-safe rewrite of a logical file.
//!
//! Compaction folds pending append records back into the main object:
//!
//! 1. capture the snapshot instant
//! 2. write the snapshot to the temp object, overwriting it
//! 3. rename the temp object over the main object
//! 4. delete absorbed records, oldest first
//!
//! A record is absorbed when it is older than the snapshot instant, or when
//! its key is at or below the last key the caller's append emulator issued
//! before the compaction began. The second rule covers strict keys that ran
//! ahead of the wall clock during append bursts.
//!
//! ## Invariants
//!
//! - A failure in 2 or 3 leaves the previous main object untouched
//! - Records are deleted only after the snapshot holding them is durable
//! - Records that are not absorbed are never deleted
//! - Retirement runs oldest first, so survivors of a partial retirement are
//!   always a suffix of history and replay harmlessly over the snapshot

use crate::error::CoreResult;
use crate::layout::{now_millis, temp_path, OrderKey};
use crate::log::reader::list_records;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shelfdb_storage::{StorageDriver, WriteOptions};
use std::sync::Arc;

/// Outcome of a compaction or direct table write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Logical path that was rewritten.
    pub path: String,
    /// Snapshot instant in epoch milliseconds.
    pub snapshot_instant_ms: u64,
    /// Last emulator-issued key absorbed regardless of the instant.
    pub issued_through: Option<OrderKey>,
    /// Size of the new main object.
    pub bytes_written: usize,
    /// Whether the driver replaced the main object atomically.
    pub rename_atomic: bool,
    /// Records deleted.
    pub retired: usize,
    /// Old records left for the next compaction because of the batch limit.
    pub deferred: usize,
    /// Records that were not absorbed, left untouched.
    pub preserved: usize,
    /// Non-fatal failure while retiring records.
    pub retire_error: Option<String>,
}

impl CompactionReport {
    /// Returns true if every old record was retired.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.deferred == 0 && self.retire_error.is_none()
    }
}

/// Rewrites logical files and retires the records they absorb.
#[derive(Debug, Clone)]
pub struct Compactor {
    driver: Arc<dyn StorageDriver>,
}

impl Compactor {
    /// Creates a compactor writing through `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver }
    }

    /// Replaces the logical content of `logical_path` with `snapshot`
    /// through temp-then-rename.
    ///
    /// `issued_through` is the last key the writer's emulator issued for the
    /// file; every record up to it is assumed to be part of `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the temp object or the rename fails; the
    /// main object is then unchanged. Retirement failures are reported in
    /// [`CompactionReport::retire_error`] instead.
    pub async fn compact(
        &self,
        logical_path: &str,
        snapshot: Bytes,
        issued_through: Option<OrderKey>,
    ) -> CoreResult<CompactionReport> {
        let instant = now_millis();
        let temp = temp_path(logical_path);
        let bytes_written = snapshot.len();

        self.driver
            .write_file(&temp, snapshot, WriteOptions::overwrite())
            .await?;
        self.driver.rename(&temp, logical_path).await?;

        let mut report = CompactionReport {
            path: logical_path.to_string(),
            snapshot_instant_ms: instant,
            issued_through,
            bytes_written,
            rename_atomic: self.driver.capabilities().atomic_rename,
            ..CompactionReport::default()
        };
        self.retire_absorbed(logical_path, &mut report).await;
        Self::log_report(&report);
        Ok(report)
    }

    /// Overwrites the main object in place, then retires absorbed records.
    ///
    /// Not crash safe: a failure mid-write can leave a truncated main object.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_direct(
        &self,
        logical_path: &str,
        data: Bytes,
        issued_through: Option<OrderKey>,
    ) -> CoreResult<CompactionReport> {
        let instant = now_millis();
        let bytes_written = data.len();
        self.driver
            .write_file(logical_path, data, WriteOptions::overwrite())
            .await?;

        let mut report = CompactionReport {
            path: logical_path.to_string(),
            snapshot_instant_ms: instant,
            issued_through,
            bytes_written,
            rename_atomic: false,
            ..CompactionReport::default()
        };
        self.retire_absorbed(logical_path, &mut report).await;
        Self::log_report(&report);
        Ok(report)
    }

    /// Deletes the records of `logical_path` absorbed by the snapshot
    /// described in `report`, oldest first, in one batch bounded by the
    /// driver's limit.
    pub async fn retire_absorbed(&self, logical_path: &str, report: &mut CompactionReport) {
        let instant = report.snapshot_instant_ms;
        let issued = report.issued_through;
        let records = match list_records(self.driver.as_ref(), logical_path).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %logical_path, error = %e, "listing append records for retirement failed");
                report.retire_error = Some(e.to_string());
                return;
            }
        };

        let (old, young): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.key.millis < instant || issued.is_some_and(|last| r.key <= last));
        report.preserved = young.len();
        if old.is_empty() {
            return;
        }

        let limit = self
            .driver
            .capabilities()
            .max_batch_delete
            .unwrap_or(old.len())
            .min(old.len());
        let batch: Vec<String> = old.iter().take(limit).map(|r| r.path.clone()).collect();
        report.deferred = old.len() - limit;

        match self.driver.delete_batch(&batch).await {
            Ok(()) => report.retired = batch.len(),
            Err(e) => {
                tracing::warn!(path = %logical_path, error = %e, "retiring append records failed");
                report.deferred = old.len();
                report.retire_error = Some(e.to_string());
            }
        }
    }

    fn log_report(report: &CompactionReport) {
        tracing::info!(
            path = %report.path,
            bytes = report.bytes_written,
            retired = report.retired,
            deferred = report.deferred,
            preserved = report.preserved,
            "table file rewritten"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::reader::LogReader;
    use shelfdb_storage::InMemoryDriver;

    async fn put(driver: &InMemoryDriver, path: &str, data: &str) {
        driver
            .write_file(path, Bytes::from(data.to_string()), WriteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compaction_replaces_main_and_retires_old_records() {
        let driver = InMemoryDriver::new();
        put(&driver, "t.db", "old").await;
        put(&driver, "~t.db/rec-1-10.adb", "a").await;
        put(&driver, "~t.db/rec-2-20.adb", "b").await;

        let report = Compactor::new(Arc::new(driver.clone()))
            .compact("t.db", Bytes::from_static(b"oldab"), None)
            .await
            .unwrap();

        assert_eq!(report.retired, 2);
        assert!(report.is_complete());
        assert!(!report.rename_atomic);
        assert_eq!(driver.keys(), vec!["t.db"]);
        assert_eq!(&driver.read_file("t.db").await.unwrap()[..], b"oldab");
    }

    #[tokio::test]
    async fn future_records_are_preserved() {
        let driver = InMemoryDriver::new();
        let future = now_millis() + 3_600_000;
        put(&driver, "~t.db/rec-1-10.adb", "a").await;
        put(&driver, &format!("~t.db/rec-1-{future}.adb"), "late").await;

        let report = Compactor::new(Arc::new(driver.clone()))
            .compact("t.db", Bytes::from_static(b"a"), None)
            .await
            .unwrap();

        assert_eq!(report.retired, 1);
        assert_eq!(report.preserved, 1);
        let content = LogReader::new(Arc::new(driver), 2).read_logical("t.db").await.unwrap();
        assert_eq!(&content[..], b"alate");
    }

    #[tokio::test]
    async fn issued_keys_ahead_of_the_clock_are_absorbed() {
        let driver = InMemoryDriver::new();
        let ahead = now_millis() + 60_000;
        put(&driver, &format!("~t.db/rec-3-{ahead}.adb"), "a").await;
        put(&driver, &format!("~t.db/rec-4-{ahead}.adb"), "b").await;
        put(&driver, &format!("~t.db/rec-9-{ahead}.adb"), "later").await;

        let report = Compactor::new(Arc::new(driver.clone()))
            .compact("t.db", Bytes::from_static(b"ab"), Some(OrderKey::new(ahead, 4)))
            .await
            .unwrap();

        assert_eq!(report.retired, 2);
        assert_eq!(report.preserved, 1);
        let content = LogReader::new(Arc::new(driver), 2).read_logical("t.db").await.unwrap();
        assert_eq!(&content[..], b"ablater");
    }

    #[tokio::test]
    async fn batch_limit_defers_newest() {
        let driver = InMemoryDriver::new().with_batch_limit(3);
        for i in 1..=5 {
            put(&driver, &format!("~t.db/rec-0-{i}.adb"), "x").await;
        }

        let report = Compactor::new(Arc::new(driver.clone()))
            .compact("t.db", Bytes::from_static(b"xxxxx"), None)
            .await
            .unwrap();

        assert_eq!(report.retired, 3);
        assert_eq!(report.deferred, 2);
        assert_eq!(
            driver.keys(),
            vec!["t.db", "~t.db/rec-0-4.adb", "~t.db/rec-0-5.adb"]
        );
    }

    #[tokio::test]
    async fn direct_write_retires_too() {
        let driver = InMemoryDriver::new();
        put(&driver, "~t.db/rec-0-1.adb", "x").await;

        let report = Compactor::new(Arc::new(driver.clone()))
            .write_direct("t.db", Bytes::from_static(b"fresh"), None)
            .await
            .unwrap();

        assert_eq!(report.retired, 1);
        assert_eq!(driver.keys(), vec!["t.db"]);
        assert!(!driver.keys().iter().any(|k| k.ends_with('~')));
    }
}
