//! Test fixtures and datastore helpers.
//!
//! Provides drivers with automatic cleanup and shortcuts for opening
//! datastores and building documents in tests.

use serde_json::Value;
use shelfdb_core::{Config, Datastore, Document, TableFiles};
use shelfdb_storage::{FileDriver, InMemoryDriver, StorageDriver};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A test storage backend with automatic cleanup.
pub struct TestStore {
    driver: Arc<dyn StorageDriver>,
    memory: Option<InMemoryDriver>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl std::fmt::Debug for TestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStore")
            .field("driver", &self.driver.name())
            .field("root", &self.root())
            .finish()
    }
}

impl TestStore {
    /// Creates an in-memory store.
    pub fn memory() -> Self {
        Self::from_memory(InMemoryDriver::new())
    }

    /// Wraps a configured in-memory driver.
    pub fn from_memory(driver: InMemoryDriver) -> Self {
        Self {
            driver: Arc::new(driver.clone()),
            memory: Some(driver),
            _temp_dir: None,
        }
    }

    /// Creates a filesystem store rooted in a fresh temp directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let driver = FileDriver::open(temp_dir.path()).expect("Failed to open file driver");
        Self {
            driver: Arc::new(driver),
            memory: None,
            _temp_dir: Some(temp_dir),
        }
    }

    /// The driver as a trait object.
    pub fn driver(&self) -> Arc<dyn StorageDriver> {
        Arc::clone(&self.driver)
    }

    /// The in-memory driver, if this store is memory-backed.
    pub fn as_memory(&self) -> Option<&InMemoryDriver> {
        self.memory.as_ref()
    }

    /// Filesystem root, if this store is file-backed.
    pub fn root(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Table-file layer over this store with default settings.
    pub fn table_files(&self) -> TableFiles {
        TableFiles::new(self.driver())
    }

    /// Opens and loads a datastore persisting to `filename`.
    pub async fn open_datastore(&self, filename: &str) -> Datastore {
        self.open_datastore_with(Config::new().filename(filename)).await
    }

    /// Opens and loads a datastore with an explicit config.
    pub async fn open_datastore_with(&self, config: Config) -> Datastore {
        Datastore::open(self.driver(), config)
            .await
            .expect("Failed to open datastore")
    }
}

/// Both store flavours, for tests that must hold on every backend.
pub fn all_stores() -> Vec<TestStore> {
    vec![TestStore::memory(), TestStore::file()]
}

/// Builds a document from a JSON object literal.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Runs a test with a loaded in-memory datastore persisting to `t.db`.
///
/// # Example
///
/// ```rust
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// use serde_json::json;
/// use shelfdb_core::Query;
/// use shelfdb_testkit::{doc, with_temp_datastore};
///
/// with_temp_datastore(|db| async move {
///     db.insert(doc(json!({"name": "ada"}))).await.unwrap();
///     assert_eq!(db.count(Query::all()).await.unwrap(), 1);
/// })
/// .await;
/// # });
/// ```
pub async fn with_temp_datastore<F, Fut, R>(f: F) -> R
where
    F: FnOnce(Datastore) -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let store = TestStore::memory();
    let db = store.open_datastore("t.db").await;
    f(db).await
}
