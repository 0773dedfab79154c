//! Single-flight FIFO operation executor.
//!
//! Every datastore owns one [`Executor`]. Operations run one at a time, in
//! submission order, on a dedicated worker task:
//!
//! ```text
//! push ──► [ready buffer] ──► mpsc queue ──► worker loop
//!                                              │
//!                                              ├─ spawn(operation)   (panic captured)
//!                                              └─ spawn(sink(result)) (panic captured)
//! ```
//!
//! ## Guarantees
//!
//! - At most one operation is in flight
//! - Operations start in submission order
//! - Each completion sink is invoked exactly once; a missing sink is a no-op
//! - A panicking operation or sink does not stop the queue
//! - The worker is a loop that yields between operations, so long queues
//!   never grow the stack

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;

/// Completion callback receiving the result of one operation.
pub type Sink<T> = Box<dyn FnOnce(CoreResult<T>) + Send + 'static>;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Whether the executor is working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// No operation running and nothing queued.
    Idle,
    /// An operation is running or waiting in the queue.
    Busy,
}

/// A queued operation with its sink, type-erased.
trait Job: Send {
    fn label(&self) -> &'static str;
    fn run(self: Box<Self>) -> BoxFuture;
}

struct Operation<T, F> {
    label: &'static str,
    op: Option<F>,
    sink: Option<Sink<T>>,
}

impl<T, F, Fut> Job for Operation<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = CoreResult<T>> + Send + 'static,
{
    fn label(&self) -> &'static str {
        self.label
    }

    fn run(mut self: Box<Self>) -> BoxFuture {
        let label = self.label;
        let op = self.op.take();
        let sink = self.sink.take();
        Box::pin(async move {
            let Some(op) = op else { return };
            let result = match tokio::spawn(async move { op().await }).await {
                Ok(result) => result,
                Err(join) => {
                    let message = panic_message(join);
                    tracing::warn!(op = label, %message, "operation panicked");
                    Err(CoreError::task_panicked(message))
                }
            };
            if let Some(sink) = sink {
                if let Err(join) = tokio::spawn(async move { sink(result) }).await {
                    tracing::warn!(op = label, message = %panic_message(join), "completion sink panicked");
                }
            }
        })
    }
}

impl<T, F> Drop for Operation<T, F> {
    // An operation dropped before it ran still owes its sink an answer.
    fn drop(&mut self) {
        if self.op.is_none() {
            return;
        }
        if let Some(sink) = self.sink.take() {
            let delivered = catch_unwind(AssertUnwindSafe(|| sink(Err(CoreError::ExecutorClosed))));
            if delivered.is_err() {
                tracing::warn!(op = self.label, "completion sink panicked on shutdown");
            }
        }
    }
}

fn panic_message(join: JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    running: AtomicBool,
}

struct Gate {
    ready: bool,
    buffer: VecDeque<Box<dyn Job>>,
    tx: mpsc::UnboundedSender<Box<dyn Job>>,
}

struct Shared {
    gate: Mutex<Gate>,
    counters: Arc<Counters>,
}

impl Shared {
    /// Hands a job to the worker. A rejected job is returned so the caller
    /// can drop it (answering its sink) after releasing the gate.
    fn send(&self, gate: &Gate, job: Box<dyn Job>) -> Option<Box<dyn Job>> {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match gate.tx.send(job) {
            Ok(()) => None,
            Err(mpsc::error::SendError(job)) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(op = job.label(), "executor worker gone, operation dropped");
                Some(job)
            }
        }
    }
}

/// Serializing executor handle. Clones share the same queue.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("ready", &self.is_ready())
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Executor {
    /// Creates a not-ready executor and spawns its worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(rx, Arc::clone(&counters)));
        Self {
            shared: Arc::new(Shared {
                gate: Mutex::new(Gate {
                    ready: false,
                    buffer: VecDeque::new(),
                    tx,
                }),
                counters,
            }),
        }
    }

    /// Creates an executor that is ready immediately.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new_ready() -> Self {
        let executor = Self::new();
        executor.set_ready();
        executor
    }

    /// Enqueues an operation.
    ///
    /// Before [`set_ready`](Self::set_ready) the operation is buffered unless
    /// `force_queuing` is set. `sink` receives the result exactly once; `None`
    /// discards it.
    pub fn push<T, F, Fut>(&self, label: &'static str, op: F, sink: Option<Sink<T>>, force_queuing: bool)
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let job: Box<dyn Job> = Box::new(Operation {
            label,
            op: Some(op),
            sink,
        });
        let mut gate = self.shared.gate.lock();
        let rejected = if gate.ready || force_queuing {
            self.shared.send(&gate, job)
        } else {
            gate.buffer.push_back(job);
            None
        };
        drop(gate);
        drop(rejected);
    }

    /// Enqueues an operation and returns a future of its result.
    ///
    /// The operation is queued immediately; dropping the returned future does
    /// not cancel it.
    pub fn schedule<T, F, Fut>(&self, label: &'static str, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        self.schedule_inner(label, op, false)
    }

    /// Like [`schedule`](Self::schedule) but bypasses the ready buffer.
    pub fn schedule_forced<T, F, Fut>(&self, label: &'static str, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        self.schedule_inner(label, op, true)
    }

    fn schedule_inner<T, F, Fut>(&self, label: &'static str, op: F, force: bool) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sink: Sink<T> = Box::new(move |result| {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        });
        self.push(label, op, Some(sink), force);
        Pending { rx }
    }

    /// Marks the executor ready and releases buffered operations in order.
    pub fn set_ready(&self) {
        let mut gate = self.shared.gate.lock();
        if gate.ready {
            return;
        }
        gate.ready = true;
        let buffered: Vec<Box<dyn Job>> = gate.buffer.drain(..).collect();
        if !buffered.is_empty() {
            tracing::debug!(count = buffered.len(), "releasing buffered operations");
        }
        let rejected: Vec<Box<dyn Job>> = buffered
            .into_iter()
            .filter_map(|job| self.shared.send(&gate, job))
            .collect();
        drop(gate);
        drop(rejected);
    }

    /// Returns true once [`set_ready`](Self::set_ready) has been called.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.gate.lock().ready
    }

    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> ExecutorState {
        let counters = &self.shared.counters;
        if counters.running.load(Ordering::SeqCst) || counters.queued.load(Ordering::SeqCst) > 0 {
            ExecutorState::Busy
        } else {
            ExecutorState::Idle
        }
    }

    /// Number of operations waiting to start, buffered ones included.
    #[must_use]
    pub fn queued(&self) -> usize {
        let buffered = self.shared.gate.lock().buffer.len();
        buffered + self.shared.counters.queued.load(Ordering::SeqCst)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Box<dyn Job>>, counters: Arc<Counters>) {
    while let Some(job) = rx.recv().await {
        counters.running.store(true, Ordering::SeqCst);
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        job.run().await;
        counters.running.store(false, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
    tracing::debug!("executor worker stopped");
}

/// Future resolving to the result of a scheduled operation.
#[derive(Debug)]
#[must_use = "the operation runs regardless; await this to observe its result"]
pub struct Pending<T> {
    rx: oneshot::Receiver<CoreResult<T>>,
}

impl<T> Future for Pending<T> {
    type Output = CoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::ExecutorClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
