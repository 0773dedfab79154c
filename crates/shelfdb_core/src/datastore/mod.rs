//! In-memory document collection persisted through the table-file layer.
//!
//! Every operation goes through the datastore's [`Executor`], so at most one
//! runs at a time and they complete in submission order. Mutations persist
//! first (one append record per operation) and only then change the
//! in-memory documents, so a failed write leaves memory untouched.
//!
//! ## Example
//!
//! ```rust
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use shelfdb_core::{Config, Datastore, Query};
//! use shelfdb_storage::InMemoryDriver;
//! use std::sync::Arc;
//!
//! let driver = Arc::new(InMemoryDriver::new());
//! let db = Datastore::open(driver, Config::new().filename("data/users.db")).await.unwrap();
//!
//! let mut doc = serde_json::Map::new();
//! doc.insert("name".into(), "ada".into());
//! db.insert(doc).await.unwrap();
//!
//! assert_eq!(db.count(Query::all().field("name", "ada")).await.unwrap(), 1);
//! # });
//! ```

mod document;
mod persistence;

pub use document::{document_id, get_path, new_id, validate, Document, Query, Update, ID_FIELD};
pub use persistence::{deletion_line, document_line, replay, Persistence, ReplayedLog, DELETED_MARKER};

use crate::config::{Config, MIN_AUTOCOMPACTION_INTERVAL};
use crate::error::{CoreError, CoreResult};
use crate::executor::{Executor, Pending, Sink};
use crate::log::CompactionReport;
use parking_lot::{Mutex, RwLock};
use shelfdb_storage::StorageDriver;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Options for [`Datastore::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every match instead of the first one.
    pub multi: bool,
    /// Insert a document when nothing matches.
    pub upsert: bool,
}

/// Outcome of an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// Number of documents modified.
    pub matched: usize,
    /// Document inserted by an upsert.
    pub upserted: Option<Document>,
}

/// An operation submitted through [`Datastore::submit`].
#[derive(Debug, Clone)]
pub enum Request {
    /// Load the datafile.
    Load,
    /// Insert documents.
    Insert(Vec<Document>),
    /// Find matching documents.
    Find(Query),
    /// Count matching documents.
    Count(Query),
    /// Update matching documents.
    Update {
        /// Selection.
        query: Query,
        /// Modification.
        update: Update,
        /// Flags.
        options: UpdateOptions,
    },
    /// Remove matching documents.
    Remove {
        /// Selection.
        query: Query,
        /// Remove every match instead of the first one.
        multi: bool,
    },
    /// Compact the datafile.
    Compact,
    /// Delete every document and the datafile.
    Drop,
}

impl Request {
    fn label(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Insert(_) => "insert",
            Self::Find(_) => "find",
            Self::Count(_) => "count",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
            Self::Compact => "compact",
            Self::Drop => "drop",
        }
    }
}

/// Result of a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The datafile was loaded.
    Loaded,
    /// Documents as inserted, with their ids.
    Inserted(Vec<Document>),
    /// Matching documents.
    Found(Vec<Document>),
    /// Number of matching documents.
    Counted(usize),
    /// Update outcome.
    Updated(UpdateOutcome),
    /// Number of removed documents.
    Removed(usize),
    /// Compaction report (`None` for in-memory datastores).
    Compacted(Option<CompactionReport>),
    /// The datastore was dropped.
    Dropped,
}

struct Inner {
    persistence: Persistence,
    persist_on_load: bool,
    executor: Executor,
    documents: RwLock<BTreeMap<String, Document>>,
    loaded: AtomicBool,
    compactions: broadcast::Sender<CompactionReport>,
    autocompaction: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.autocompaction.get_mut().take() {
            task.abort();
        }
    }
}

/// A document collection with serialized, persisted operations.
///
/// Clones share the same collection and executor.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("filename", &self.inner.persistence.filename())
            .field("loaded", &self.is_loaded())
            .field("executor", &self.inner.executor)
            .finish()
    }
}

impl Datastore {
    /// Creates an unloaded datastore.
    ///
    /// Operations issued before [`load_database`](Self::load_database)
    /// completes are buffered and run after it, in order.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(driver: Arc<dyn StorageDriver>, config: Config) -> Self {
        let (compactions, _) = broadcast::channel(16);
        let datastore = Self {
            inner: Arc::new(Inner {
                persistence: Persistence::new(driver, &config),
                persist_on_load: config.persist_on_load,
                executor: Executor::new(),
                documents: RwLock::new(BTreeMap::new()),
                loaded: AtomicBool::new(false),
                compactions,
                autocompaction: Mutex::new(None),
            }),
        };
        if let Some(interval) = config.autocompaction_interval {
            datastore.set_autocompaction_interval(interval);
        }
        datastore
    }

    /// Creates a datastore and loads it.
    ///
    /// # Errors
    ///
    /// Returns the load failure.
    pub async fn open(driver: Arc<dyn StorageDriver>, config: Config) -> CoreResult<Self> {
        let datastore = Self::new(driver, config);
        datastore.load_database().await?;
        Ok(datastore)
    }

    /// Returns true once a load has succeeded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::SeqCst)
    }

    /// The datastore's executor.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Logical path of the datafile, if any.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.inner.persistence.filename()
    }

    /// Subscribes to compaction reports.
    #[must_use]
    pub fn subscribe_compactions(&self) -> broadcast::Receiver<CompactionReport> {
        self.inner.compactions.subscribe()
    }

    /// Submits a request with an optional completion sink.
    ///
    /// This is the callback-style entry point: the sink is invoked exactly
    /// once with the response, in submission order. `None` discards the
    /// result.
    pub fn submit(&self, request: Request, sink: Option<Sink<Response>>) {
        let label = request.label();
        let force = matches!(request, Request::Load);
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .push(label, move || async move { inner.execute(request).await }, sink, force);
    }

    /// Loads (or reloads) the datafile, replacing in-memory documents.
    pub fn load_database(&self) -> Pending<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule_forced("load", move || async move { inner.load().await })
    }

    /// Inserts one document, assigning an `_id` if missing.
    pub fn insert(&self, doc: Document) -> Pending<Document> {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.schedule("insert", move || async move {
            let mut inserted = inner.insert(vec![doc]).await?;
            inserted
                .pop()
                .ok_or_else(|| CoreError::invalid_operation("insert produced no document"))
        })
    }

    /// Inserts several documents as one persisted record.
    pub fn insert_many(&self, docs: Vec<Document>) -> Pending<Vec<Document>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule("insert", move || async move { inner.insert(docs).await })
    }

    /// Finds matching documents.
    pub fn find(&self, query: Query) -> Pending<Vec<Document>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule("find", move || async move { Ok(inner.find(&query)) })
    }

    /// Finds the first matching document.
    pub fn find_one(&self, query: Query) -> Pending<Option<Document>> {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.schedule("find", move || async move {
            let documents = inner.documents.read();
            Ok(documents.values().find(|d| query.matches(d)).cloned())
        })
    }

    /// Counts matching documents.
    pub fn count(&self, query: Query) -> Pending<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule("count", move || async move { Ok(inner.count(&query)) })
    }

    /// Updates matching documents.
    pub fn update(&self, query: Query, update: Update, options: UpdateOptions) -> Pending<UpdateOutcome> {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.schedule("update", move || async move {
            inner.update(&query, &update, options).await
        })
    }

    /// Removes the first match, or every match with `multi`.
    pub fn remove(&self, query: Query, multi: bool) -> Pending<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule("remove", move || async move { inner.remove(&query, multi).await })
    }

    /// Rewrites the datafile as a snapshot of the current documents.
    pub fn compact_datafile(&self) -> Pending<Option<CompactionReport>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule("compact", move || async move { inner.compact().await })
    }

    /// Deletes every document and every stored object of the datafile.
    pub fn drop_database(&self) -> Pending<()> {
        self.stop_autocompaction();
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule("drop", move || async move { inner.drop_all().await })
    }

    /// Snapshot of every document, outside the queue.
    #[must_use]
    pub fn get_all_data(&self) -> Vec<Document> {
        self.inner.documents.read().values().cloned().collect()
    }

    /// Compacts the datafile periodically (at least every 5 seconds apart).
    ///
    /// Replaces any previous schedule. Each run is queued like any other
    /// operation and its result is discarded; reports are still broadcast.
    pub fn set_autocompaction_interval(&self, interval: Duration) {
        let period = interval.max(MIN_AUTOCOMPACTION_INTERVAL);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let runner = Arc::clone(&inner);
                inner.executor.push(
                    "autocompaction",
                    move || async move { runner.compact().await },
                    None,
                    false,
                );
            }
        });
        if let Some(previous) = self.inner.autocompaction.lock().replace(task) {
            previous.abort();
        }
        tracing::debug!(period_ms = period.as_millis() as u64, "autocompaction scheduled");
    }

    /// Stops periodic compaction.
    pub fn stop_autocompaction(&self) {
        if let Some(task) = self.inner.autocompaction.lock().take() {
            task.abort();
        }
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, request: Request) -> CoreResult<Response> {
        Ok(match request {
            Request::Load => {
                self.load().await?;
                Response::Loaded
            }
            Request::Insert(docs) => Response::Inserted(self.insert(docs).await?),
            Request::Find(query) => Response::Found(self.find(&query)),
            Request::Count(query) => Response::Counted(self.count(&query)),
            Request::Update {
                query,
                update,
                options,
            } => Response::Updated(self.update(&query, &update, options).await?),
            Request::Remove { query, multi } => Response::Removed(self.remove(&query, multi).await?),
            Request::Compact => Response::Compacted(self.compact().await?),
            Request::Drop => {
                self.drop_all().await?;
                Response::Dropped
            }
        })
    }

    async fn load(&self) -> CoreResult<()> {
        let log = self.persistence.load().await?;
        *self.documents.write() = log.documents;
        if self.persist_on_load {
            self.compact().await?;
        }
        self.loaded.store(true, Ordering::SeqCst);
        self.executor.set_ready();
        Ok(())
    }

    async fn insert(&self, docs: Vec<Document>) -> CoreResult<Vec<Document>> {
        let mut prepared = Vec::with_capacity(docs.len());
        let mut batch_ids = HashSet::new();
        {
            let documents = self.documents.read();
            for mut doc in docs {
                validate(&doc)?;
                let id = match document_id(&doc) {
                    Some(id) => id.to_string(),
                    None => {
                        let id = new_id();
                        doc.insert(ID_FIELD.to_string(), id.clone().into());
                        id
                    }
                };
                if documents.contains_key(&id) || !batch_ids.insert(id.clone()) {
                    return Err(CoreError::invalid_document(format!(
                        "unique constraint violated: _id {id} already exists"
                    )));
                }
                prepared.push((id, doc));
            }
        }

        self.persistence
            .persist_documents(prepared.iter().map(|(_, doc)| doc))
            .await?;

        let mut documents = self.documents.write();
        for (id, doc) in &prepared {
            documents.insert(id.clone(), doc.clone());
        }
        Ok(prepared.into_iter().map(|(_, doc)| doc).collect())
    }

    fn find(&self, query: &Query) -> Vec<Document> {
        self.documents
            .read()
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect()
    }

    fn count(&self, query: &Query) -> usize {
        self.documents.read().values().filter(|d| query.matches(d)).count()
    }

    async fn update(&self, query: &Query, update: &Update, options: UpdateOptions) -> CoreResult<UpdateOutcome> {
        let changed: Vec<(String, Document)> = {
            let documents = self.documents.read();
            let matches = documents.iter().filter(|(_, d)| query.matches(d));
            let limit = if options.multi { usize::MAX } else { 1 };
            matches
                .take(limit)
                .map(|(id, d)| Ok((id.clone(), update.apply(d)?)))
                .collect::<CoreResult<_>>()?
        };

        if changed.is_empty() && options.upsert {
            let mut doc = update.upsert_document(query)?;
            if document_id(&doc).is_none() {
                doc.insert(ID_FIELD.to_string(), new_id().into());
            }
            let mut inserted = self.insert(vec![doc]).await?;
            return Ok(UpdateOutcome {
                matched: 0,
                upserted: inserted.pop(),
            });
        }

        self.persistence
            .persist_documents(changed.iter().map(|(_, doc)| doc))
            .await?;

        let matched = changed.len();
        let mut documents = self.documents.write();
        for (id, doc) in changed {
            documents.insert(id, doc);
        }
        Ok(UpdateOutcome {
            matched,
            upserted: None,
        })
    }

    async fn remove(&self, query: &Query, multi: bool) -> CoreResult<usize> {
        let ids: Vec<String> = {
            let documents = self.documents.read();
            let limit = if multi { usize::MAX } else { 1 };
            documents
                .iter()
                .filter(|(_, d)| query.matches(d))
                .take(limit)
                .map(|(id, _)| id.clone())
                .collect()
        };

        self.persistence.persist_deletions(&ids).await?;

        let mut documents = self.documents.write();
        for id in &ids {
            documents.remove(id);
        }
        Ok(ids.len())
    }

    async fn compact(&self) -> CoreResult<Option<CompactionReport>> {
        let snapshot: Vec<Document> = self.documents.read().values().cloned().collect();
        let report = self.persistence.compact(snapshot.iter()).await?;
        if let Some(report) = &report {
            // No subscribers is fine.
            let _ = self.compactions.send(report.clone());
        }
        Ok(report)
    }

    async fn drop_all(&self) -> CoreResult<()> {
        self.persistence.destroy().await?;
        self.documents.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use shelfdb_storage::InMemoryDriver;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn open(driver: &InMemoryDriver) -> Datastore {
        Datastore::open(Arc::new(driver.clone()), Config::new().filename("db/t.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_find_count() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;

        let inserted = db.insert(doc(json!({"name": "ada"}))).await.unwrap();
        assert!(document_id(&inserted).is_some());
        db.insert(doc(json!({"name": "bob"}))).await.unwrap();

        assert_eq!(db.count(Query::all()).await.unwrap(), 2);
        let found = db.find(Query::all().field("name", "ada")).await.unwrap();
        assert_eq!(found, vec![inserted]);
        assert_eq!(db.get_all_data().len(), 2);
    }

    #[tokio::test]
    async fn each_mutation_is_one_record() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;

        db.insert_many(vec![doc(json!({"a": 1})), doc(json!({"a": 2}))])
            .await
            .unwrap();
        db.remove(Query::all(), true).await.unwrap();

        let records = db
            .inner
            .persistence
            .tables()
            .pending_records("db/t.db")
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_id_rejected_without_side_effects() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;
        db.insert(doc(json!({"_id": "x"}))).await.unwrap();
        let before = driver.object_count();

        let err = db.insert(doc(json!({"_id": "x"}))).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidDocument { .. }));
        assert_eq!(driver.object_count(), before);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let driver = InMemoryDriver::new();
        {
            let db = open(&driver).await;
            db.insert(doc(json!({"_id": "1", "v": 1}))).await.unwrap();
            db.insert(doc(json!({"_id": "2", "v": 1}))).await.unwrap();
            db.update(
                Query::by_id("1"),
                Update::Set(doc(json!({"v": 2}))),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
            db.remove(Query::by_id("2"), false).await.unwrap();
        }

        let db = open(&driver).await;
        let all = db.get_all_data();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["v"], json!(2));
    }

    #[tokio::test]
    async fn update_multi_and_upsert() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;
        for _ in 0..3 {
            db.insert(doc(json!({"kind": "a", "n": 0}))).await.unwrap();
        }

        let one = db
            .update(Query::all().field("kind", "a"), Update::Set(doc(json!({"n": 1}))), UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(one.matched, 1);

        let all = db
            .update(
                Query::all().field("kind", "a"),
                Update::Set(doc(json!({"n": 2}))),
                UpdateOptions { multi: true, upsert: false },
            )
            .await
            .unwrap();
        assert_eq!(all.matched, 3);

        let upsert = db
            .update(
                Query::all().field("kind", "b"),
                Update::Set(doc(json!({"n": 9}))),
                UpdateOptions { multi: false, upsert: true },
            )
            .await
            .unwrap();
        assert_eq!(upsert.matched, 0);
        let created = upsert.upserted.unwrap();
        assert_eq!(created["kind"], json!("b"));
        assert_eq!(db.count(Query::all()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn compaction_folds_records_and_broadcasts() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;
        let mut reports = db.subscribe_compactions();
        db.insert(doc(json!({"_id": "a"}))).await.unwrap();
        db.insert(doc(json!({"_id": "b"}))).await.unwrap();
        db.remove(Query::by_id("a"), false).await.unwrap();
        // Records from the current millisecond would be preserved.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = db.compact_datafile().await.unwrap().unwrap();
        assert_eq!(report.retired, 3);
        assert_eq!(driver.keys(), vec!["db/t.db"]);
        assert_eq!(reports.recv().await.unwrap(), report);

        let main = driver.read_file("db/t.db").await.unwrap();
        assert_eq!(&main[..], b"{\"_id\":\"b\"}\n");
    }

    #[tokio::test]
    async fn operations_before_load_wait_for_it() {
        let driver = InMemoryDriver::new();
        driver
            .write_file(
                "db/t.db",
                bytes::Bytes::from_static(b"{\"_id\":\"seed\"}\n"),
                shelfdb_storage::WriteOptions::default(),
            )
            .await
            .unwrap();

        let db = Datastore::new(Arc::new(driver.clone()), Config::new().filename("db/t.db"));
        let early = db.count(Query::all());
        db.load_database().await.unwrap();
        assert_eq!(early.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn submit_with_sink() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        db.submit(
            Request::Insert(vec![doc(json!({"_id": "s"}))]),
            Some(Box::new(move |r| {
                let _ = tx.send(r);
            })),
        );
        db.submit(Request::Count(Query::all()), None);
        match rx.await.unwrap().unwrap() {
            Response::Inserted(docs) => assert_eq!(docs.len(), 1),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn drop_database_removes_everything() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;
        db.insert(doc(json!({"a": 1}))).await.unwrap();
        db.compact_datafile().await.unwrap();
        db.insert(doc(json!({"a": 2}))).await.unwrap();

        db.drop_database().await.unwrap();
        assert_eq!(driver.object_count(), 0);
        assert!(db.get_all_data().is_empty());
    }

    #[tokio::test]
    async fn in_memory_datastore_writes_nothing() {
        let driver = InMemoryDriver::new();
        let db = Datastore::open(Arc::new(driver.clone()), Config::new()).await.unwrap();
        db.insert(doc(json!({"a": 1}))).await.unwrap();
        assert!(db.compact_datafile().await.unwrap().is_none());
        assert_eq!(driver.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn autocompaction_runs_periodically() {
        let driver = InMemoryDriver::new();
        let db = open(&driver).await;
        let mut reports = db.subscribe_compactions();
        db.insert(doc(json!({"a": 1}))).await.unwrap();

        db.set_autocompaction_interval(Duration::from_millis(1));
        let report = reports.recv().await.unwrap();
        assert_eq!(report.path, "db/t.db");

        db.stop_autocompaction();
    }
}
