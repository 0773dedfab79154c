//! Failure injection for storage drivers.
//!
//! [`FailingDriver`] wraps any [`StorageDriver`] and fails selected calls on
//! demand. Rules match a driver operation and a path substring. A rule fires
//! once unless it is made sticky.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shelfdb_storage::{
    Capabilities, FileStat, ListPage, StorageDriver, StorageError, StorageResult, WriteOptions,
};
use std::sync::Arc;

/// Driver calls that can be intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    /// `write_file`.
    Write,
    /// `read_file`.
    Read,
    /// `unlink`.
    Unlink,
    /// `rename`.
    Rename,
    /// `exists`.
    Exists,
    /// `stat`.
    Stat,
    /// `readdir` and `list_page`.
    List,
    /// `mkdirp`.
    Mkdirp,
    /// `remove_folder`.
    RemoveFolder,
    /// `delete_batch`.
    DeleteBatch,
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Return a transient error without touching the inner driver.
    Transient,
    /// Return `SessionExpired` without touching the inner driver.
    SessionExpired,
    /// Rename only: delete the destination, then fail without moving.
    ///
    /// Models a copy-then-delete backend dying between its two halves.
    TornRename,
}

#[derive(Debug, Clone)]
struct Rule {
    op: DriverOp,
    path_contains: String,
    mode: FailureMode,
    sticky: bool,
}

impl Rule {
    fn matches(&self, op: DriverOp, path: &str) -> bool {
        self.op == op && path.contains(&self.path_contains)
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Intercepted operation.
    pub op: DriverOp,
    /// Primary path of the call.
    pub path: String,
    /// Whether the call was failed by a rule.
    pub injected: bool,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
}

/// A driver wrapper that fails calls matching configured rules.
///
/// # Example
///
/// ```rust
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use bytes::Bytes;
/// use shelfdb_storage::{InMemoryDriver, StorageDriver, WriteOptions};
/// use shelfdb_testkit::{DriverOp, FailingDriver};
/// use std::sync::Arc;
///
/// let driver = FailingDriver::new(Arc::new(InMemoryDriver::new()));
/// driver.fail_once(DriverOp::Write, "t.db");
///
/// let data = Bytes::from_static(b"x");
/// assert!(driver.write_file("t.db", data.clone(), WriteOptions::default()).await.is_err());
/// assert!(driver.write_file("t.db", data, WriteOptions::default()).await.is_ok());
/// # });
/// ```
#[derive(Clone)]
pub struct FailingDriver {
    inner: Arc<dyn StorageDriver>,
    state: Arc<Mutex<State>>,
    capabilities: Option<Capabilities>,
}

impl std::fmt::Debug for FailingDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingDriver")
            .field("inner", &self.inner.name())
            .field("rules", &self.state.lock().rules.len())
            .finish()
    }
}

impl FailingDriver {
    /// Wraps `inner` with no rules.
    #[must_use]
    pub fn new(inner: Arc<dyn StorageDriver>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(State::default())),
            capabilities: None,
        }
    }

    /// Reports `capabilities` instead of the inner driver's.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// The wrapped driver.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn StorageDriver> {
        &self.inner
    }

    /// Fails the next matching call with a transient error.
    pub fn fail_once(&self, op: DriverOp, path_contains: &str) {
        self.add_rule(op, path_contains, FailureMode::Transient, false);
    }

    /// Fails every matching call with a transient error.
    pub fn fail_always(&self, op: DriverOp, path_contains: &str) {
        self.add_rule(op, path_contains, FailureMode::Transient, true);
    }

    /// Fails the next matching call in the given mode.
    pub fn fail_once_with(&self, op: DriverOp, path_contains: &str, mode: FailureMode) {
        self.add_rule(op, path_contains, mode, false);
    }

    /// Makes the next rename into a path containing `path_contains` tear.
    pub fn tear_next_rename(&self, path_contains: &str) {
        self.add_rule(DriverOp::Rename, path_contains, FailureMode::TornRename, false);
    }

    /// Removes every rule.
    pub fn clear(&self) {
        self.state.lock().rules.clear();
    }

    /// Every call seen so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op` seen so far.
    #[must_use]
    pub fn count(&self, op: DriverOp) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    fn add_rule(&self, op: DriverOp, path_contains: &str, mode: FailureMode, sticky: bool) {
        self.state.lock().rules.push(Rule {
            op,
            path_contains: path_contains.to_string(),
            mode,
            sticky,
        });
    }

    /// Records the call and returns the failure mode of the first matching
    /// rule, consuming it unless sticky.
    fn intercept(&self, op: DriverOp, path: &str) -> Option<FailureMode> {
        let mut state = self.state.lock();
        let hit = state.rules.iter().position(|r| r.matches(op, path));
        let mode = hit.map(|i| {
            let mode = state.rules[i].mode;
            if !state.rules[i].sticky {
                state.rules.remove(i);
            }
            mode
        });
        state.calls.push(RecordedCall {
            op,
            path: path.to_string(),
            injected: mode.is_some(),
        });
        mode
    }

    fn check(&self, op: DriverOp, path: &str) -> StorageResult<()> {
        match self.intercept(op, path) {
            None => Ok(()),
            Some(mode) => Err(injected_error(op, path, mode)),
        }
    }
}

fn injected_error(op: DriverOp, path: &str, mode: FailureMode) -> StorageError {
    tracing::debug!(?op, path = %path, ?mode, "injected driver failure");
    match mode {
        FailureMode::SessionExpired => StorageError::session_expired(format!("injected on {path}")),
        FailureMode::Transient | FailureMode::TornRename => {
            StorageError::transient(format!("injected {op:?} failure on {path}"))
        }
    }
}

#[async_trait]
impl StorageDriver for FailingDriver {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.unwrap_or_else(|| self.inner.capabilities())
    }

    async fn init(&self) -> StorageResult<()> {
        self.inner.init().await
    }

    async fn write_file(&self, path: &str, data: Bytes, options: WriteOptions) -> StorageResult<()> {
        self.check(DriverOp::Write, path)?;
        self.inner.write_file(path, data, options).await
    }

    async fn read_file(&self, path: &str) -> StorageResult<Bytes> {
        self.check(DriverOp::Read, path)?;
        self.inner.read_file(path).await
    }

    async fn unlink(&self, path: &str) -> StorageResult<()> {
        self.check(DriverOp::Unlink, path)?;
        self.inner.unlink(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        match self.intercept(DriverOp::Rename, to) {
            None => self.inner.rename(from, to).await,
            Some(FailureMode::TornRename) => {
                self.inner.unlink(to).await?;
                Err(injected_error(DriverOp::Rename, to, FailureMode::TornRename))
            }
            Some(mode) => Err(injected_error(DriverOp::Rename, to, mode)),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.check(DriverOp::Exists, path)?;
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &str) -> StorageResult<FileStat> {
        self.check(DriverOp::Stat, path)?;
        self.inner.stat(path).await
    }

    async fn readdir(&self, path: &str) -> StorageResult<Vec<String>> {
        self.check(DriverOp::List, path)?;
        self.inner.readdir(path).await
    }

    async fn mkdirp(&self, path: &str) -> StorageResult<()> {
        self.check(DriverOp::Mkdirp, path)?;
        self.inner.mkdirp(path).await
    }

    async fn remove_folder(&self, path: &str) -> StorageResult<()> {
        self.check(DriverOp::RemoveFolder, path)?;
        self.inner.remove_folder(path).await
    }

    async fn list_page(&self, dir: &str, continuation: Option<String>) -> StorageResult<ListPage> {
        self.check(DriverOp::List, dir)?;
        self.inner.list_page(dir, continuation).await
    }

    async fn delete_batch(&self, paths: &[String]) -> StorageResult<()> {
        let first = paths.first().map(String::as_str).unwrap_or_default();
        self.check(DriverOp::DeleteBatch, first)?;
        if let Some(limit) = self.capabilities.and_then(|c| c.max_batch_delete) {
            if paths.len() > limit {
                return Err(StorageError::invalid_input(format!(
                    "batch of {} exceeds delete limit {}",
                    paths.len(),
                    limit
                )));
            }
        }
        self.inner.delete_batch(paths).await
    }
}
