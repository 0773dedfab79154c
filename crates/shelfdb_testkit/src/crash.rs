//! Crash recovery testing for ShelfDB.
//!
//! Simulates a process dying at a chosen point of a write protocol and then
//! reopens the datastore from whatever the backend holds, checking that no
//! acknowledged document was lost and no failed mutation became visible.
//!
//! ## Test Strategy
//!
//! 1. **Append fails** - the mutation errors and must not appear on reload
//! 2. **Temp write fails** - compaction errors, the old main object survives
//! 3. **Rename fails** - compaction errors, the old main object survives
//! 4. **Torn rename** - main object lost, restored from the temp object
//! 5. **Retirement fails** - compaction succeeds, stale records replay harmlessly
//!
//! ## Usage
//!
//! ```rust
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use shelfdb_testkit::crash::{CrashHarness, CrashPoint};
//!
//! let result = CrashHarness::new("data/t.db").run(CrashPoint::TornRename).await;
//! assert!(result.passed, "{result:?}");
//! # });
//! ```

use crate::failing::{DriverOp, FailingDriver};
use crate::fixtures::doc;
use serde_json::json;
use shelfdb_core::layout::temp_path;
use shelfdb_core::{Config, CoreError, Datastore, Document, Query, Update, UpdateOptions};
use shelfdb_storage::{InMemoryDriver, StorageDriver};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The append record of a mutation is never written.
    DuringAppend,
    /// Compaction dies writing the temp object.
    DuringTempWrite,
    /// Compaction dies before the rename takes effect.
    DuringRename,
    /// A copy-then-delete rename dies after deleting the main object.
    TornRename,
    /// Compaction dies after the rename, before retiring records.
    DuringRetirement,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [CrashPoint; 5] = [
        CrashPoint::DuringAppend,
        CrashPoint::DuringTempWrite,
        CrashPoint::DuringRename,
        CrashPoint::TornRename,
        CrashPoint::DuringRetirement,
    ];
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Crash point that was simulated.
    pub point: CrashPoint,
    /// Whether the test passed.
    pub passed: bool,
    /// Whether the interrupted operation reported an error.
    pub operation_failed: bool,
    /// Documents expected after recovery.
    pub expected_documents: usize,
    /// Documents found after recovery.
    pub actual_documents: usize,
    /// Any error message.
    pub error: Option<String>,
}

/// Runs crash scenarios against a fresh in-memory backend.
#[derive(Debug, Clone)]
pub struct CrashHarness {
    filename: String,
    documents: usize,
}

impl CrashHarness {
    /// Creates a harness writing to `filename`.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            documents: 8,
        }
    }

    /// Number of documents seeded before the crash.
    #[must_use]
    pub fn with_documents(mut self, documents: usize) -> Self {
        self.documents = documents.max(2);
        self
    }

    /// Runs every crash point.
    pub async fn run_all(&self) -> Vec<CrashRecoveryResult> {
        let mut results = Vec::with_capacity(CrashPoint::ALL.len());
        for point in CrashPoint::ALL {
            results.push(self.run(point).await);
        }
        results
    }

    /// Seeds a datastore, crashes at `point` and reopens it.
    pub async fn run(&self, point: CrashPoint) -> CrashRecoveryResult {
        match self.scenario(point).await {
            Ok(result) => result,
            Err(message) => CrashRecoveryResult {
                point,
                passed: false,
                operation_failed: false,
                expected_documents: 0,
                actual_documents: 0,
                error: Some(message),
            },
        }
    }

    async fn scenario(&self, point: CrashPoint) -> Result<CrashRecoveryResult, String> {
        let memory = InMemoryDriver::new();
        let failing = FailingDriver::new(Arc::new(memory.clone()));
        let db = Datastore::open(Arc::new(failing.clone()), Config::new().filename(&self.filename))
            .await
            .map_err(|e| format!("open failed: {e}"))?;

        self.seed(&db).await?;
        let expected = snapshot(&db.get_all_data());
        // Seeded records must predate the compaction instant.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcome = match point {
            CrashPoint::DuringAppend => {
                failing.fail_once(DriverOp::Write, "rec-");
                db.insert(doc(json!({"_id": "lost"}))).await.map(|_| ())
            }
            CrashPoint::DuringTempWrite => {
                failing.fail_once(DriverOp::Write, &temp_path(&self.filename));
                db.compact_datafile().await.map(|_| ())
            }
            CrashPoint::DuringRename => {
                failing.fail_once(DriverOp::Rename, &self.filename);
                db.compact_datafile().await.map(|_| ())
            }
            CrashPoint::TornRename => {
                failing.tear_next_rename(&self.filename);
                db.compact_datafile().await.map(|_| ())
            }
            CrashPoint::DuringRetirement => {
                failing.fail_once(DriverOp::DeleteBatch, "");
                db.compact_datafile().await.and_then(|report| match report {
                    Some(r) if r.retire_error.is_some() => Ok(()),
                    _ => Err(CoreError::invalid_operation("retirement was not interrupted")),
                })
            }
        };
        drop(db);

        let operation_failed = outcome.is_err();
        let should_fail = !matches!(point, CrashPoint::DuringRetirement);

        let driver: Arc<dyn StorageDriver> = Arc::new(memory);
        let reopened = Datastore::open(driver, Config::new().filename(&self.filename))
            .await
            .map_err(|e| format!("reopen failed: {e}"))?;
        let actual = snapshot(&reopened.get_all_data());

        let mut error = None;
        if operation_failed != should_fail {
            error = Some(format!("operation outcome {outcome:?}, expected failure: {should_fail}"));
        } else if actual != expected {
            error = Some(format!("recovered {} documents, expected {}", actual.len(), expected.len()));
        }
        tracing::debug!(?point, passed = error.is_none(), "crash scenario finished");

        Ok(CrashRecoveryResult {
            point,
            passed: error.is_none(),
            operation_failed,
            expected_documents: expected.len(),
            actual_documents: actual.len(),
            error,
        })
    }

    /// Inserts, updates and removes so the log holds every line kind.
    async fn seed(&self, db: &Datastore) -> Result<(), String> {
        let docs = (0..self.documents)
            .map(|i| doc(json!({"_id": format!("doc-{i}"), "n": i, "even": i % 2 == 0})))
            .collect();
        db.insert_many(docs).await.map_err(|e| e.to_string())?;
        db.update(
            Query::all().field("even", true),
            Update::Set(doc(json!({"touched": true}))),
            UpdateOptions {
                multi: true,
                upsert: false,
            },
        )
        .await
        .map_err(|e| e.to_string())?;
        db.remove(Query::by_id("doc-1"), false)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn snapshot(docs: &[Document]) -> BTreeMap<String, Document> {
    docs.iter()
        .filter_map(|d| shelfdb_core::document_id(d).map(|id| (id.to_string(), d.clone())))
        .collect()
}
