//! Batch coalescer: groups concurrent requests into bounded batches.
//!
//! One background task owns the pending queue. Submissions arrive over an
//! unbounded mpsc channel, so `add_request` never blocks. The worker flushes
//! when the queue reaches `batch_size`, when `batch_timeout` has elapsed
//! since the oldest pending request, or on shutdown. Each flushed batch runs
//! in its own task so a slow backend call does not stall accumulation of the
//! next batch.
//!
//! ```text
//!   submit ──► mpsc ──► worker queue ──(size | timeout | shutdown)──► executor task
//!                                                                       │
//!   PendingResult ◄──────────────── oneshot (one per request) ◄─────────┘
//! ```

pub mod executor;

pub use executor::{BatchExecutor, FnExecutor};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;
use crate::error::{BatchError, ConfigError};

/// One unit of work submitted to the coalescer.
#[derive(Debug, Clone)]
pub struct BatchRequest<P> {
    pub id: String,
    pub payload: P,
}

impl<P> BatchRequest<P> {
    /// Request with a generated id.
    pub fn new(payload: P) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }

    pub fn with_id(id: impl Into<String>, payload: P) -> Self {
        Self { id: id.into(), payload }
    }
}

/// Handle to a submitted request's eventual result.
#[derive(Debug)]
pub struct PendingResult<R> {
    id: String,
    rx: oneshot::Receiver<Result<R, BatchError>>,
}

impl<R> PendingResult<R> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the batch containing this request to resolve.
    pub async fn wait(self) -> Result<R, BatchError> {
        self.rx.await.unwrap_or(Err(BatchError::Abandoned))
    }
}

/// Lifecycle of the coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescerState {
    Idle,
    Accumulating,
    Draining,
    Stopping,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoalescerStatus {
    pub state: CoalescerState,
    pub pending: usize,
    pub in_flight_batches: usize,
    pub batches_executed: u64,
    pub batches_failed: u64,
    pub requests_processed: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    Size,
    Timeout,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

struct Pending<P, R> {
    id: String,
    payload: P,
    respond: oneshot::Sender<Result<R, BatchError>>,
}

enum Command<P, R> {
    Submit(Pending<P, R>),
    Shutdown,
}

/// Counters shared between the handle and the worker.
#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    batches_executed: AtomicU64,
    batches_failed: AtomicU64,
    requests_processed: AtomicU64,
    stopping: AtomicBool,
    drained: AtomicBool,
}

pub struct BatchCoalescer<P, R> {
    tx: mpsc::UnboundedSender<Command<P, R>>,
    shared: Arc<Shared>,
    config: BatchConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P, R> BatchCoalescer<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Validate `config` and start the background worker. Must be called
    /// from within a Tokio runtime.
    pub fn spawn(config: BatchConfig, executor: Arc<dyn BatchExecutor<P, R>>) -> Result<Self, ConfigError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(run_worker(rx, executor, config.clone(), Arc::clone(&shared)));

        info!(
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            "Batch coalescer started"
        );

        Ok(Self {
            tx,
            shared,
            config,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a request. Never blocks; fails only once the coalescer has
    /// shut down.
    pub fn add_request(&self, request: BatchRequest<P>) -> Result<PendingResult<R>, BatchError> {
        let (respond, rx) = oneshot::channel();
        let id = request.id;

        // Count before sending so the worker never decrements below zero
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self.tx.send(Command::Submit(Pending {
            id: id.clone(),
            payload: request.payload,
            respond,
        }));
        if sent.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(BatchError::Closed);
        }

        Ok(PendingResult { id, rx })
    }

    /// Queue a payload under a generated id.
    pub fn submit(&self, payload: P) -> Result<PendingResult<R>, BatchError> {
        self.add_request(BatchRequest::new(payload))
    }

    /// Flush whatever is pending, wait for every in-flight batch, and stop
    /// the worker. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else { return };

        // The worker may already be gone if every sender was dropped
        let _ = self.tx.send(Command::Shutdown);
        if let Err(e) = handle.await {
            error!(error = %e, "Batch coalescer worker terminated abnormally");
        }
    }

    pub fn status(&self) -> CoalescerStatus {
        let pending = self.shared.pending.load(Ordering::SeqCst);
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst);

        let state = if self.shared.drained.load(Ordering::SeqCst) {
            CoalescerState::Drained
        } else if self.shared.stopping.load(Ordering::SeqCst) {
            CoalescerState::Stopping
        } else if in_flight > 0 {
            CoalescerState::Draining
        } else if pending > 0 {
            CoalescerState::Accumulating
        } else {
            CoalescerState::Idle
        };

        CoalescerStatus {
            state,
            pending,
            in_flight_batches: in_flight,
            batches_executed: self.shared.batches_executed.load(Ordering::Relaxed),
            batches_failed: self.shared.batches_failed.load(Ordering::Relaxed),
            requests_processed: self.shared.requests_processed.load(Ordering::Relaxed),
            batch_size: self.config.batch_size,
            batch_timeout_ms: self.config.batch_timeout.as_millis() as u64,
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────

enum Event<P, R> {
    Message(Option<Command<P, R>>),
    Deadline,
    Finished(Result<(), tokio::task::JoinError>),
}

async fn run_worker<P, R>(
    mut rx: mpsc::UnboundedReceiver<Command<P, R>>,
    executor: Arc<dyn BatchExecutor<P, R>>,
    config: BatchConfig,
    shared: Arc<Shared>,
) where
    P: Send + 'static,
    R: Send + 'static,
{
    let mut queue: Vec<Pending<P, R>> = Vec::with_capacity(config.batch_size);
    let mut deadline: Option<Instant> = None;
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        let event = tokio::select! {
            msg = rx.recv() => Event::Message(msg),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Event::Deadline,
            Some(done) = running.join_next(), if !running.is_empty() => Event::Finished(done),
        };

        match event {
            Event::Message(Some(Command::Submit(pending))) => {
                if queue.is_empty() {
                    deadline = Some(Instant::now() + config.batch_timeout);
                }
                queue.push(pending);

                if queue.len() >= config.batch_size {
                    flush(&mut queue, FlushTrigger::Size, &executor, &shared, &mut running);
                    deadline = None;
                }
            }
            Event::Deadline => {
                if !queue.is_empty() {
                    flush(&mut queue, FlushTrigger::Timeout, &executor, &shared, &mut running);
                }
                deadline = None;
            }
            Event::Finished(done) => reap(done, &shared),
            Event::Message(Some(Command::Shutdown)) | Event::Message(None) => break,
        }
    }

    // Stop accepting, then drain everything that made it into the channel
    shared.stopping.store(true, Ordering::SeqCst);
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let Command::Submit(pending) = command {
            queue.push(pending);
            if queue.len() >= config.batch_size {
                flush(&mut queue, FlushTrigger::Shutdown, &executor, &shared, &mut running);
            }
        }
    }
    if !queue.is_empty() {
        flush(&mut queue, FlushTrigger::Shutdown, &executor, &shared, &mut running);
    }

    while let Some(done) = running.join_next().await {
        reap(done, &shared);
    }

    shared.drained.store(true, Ordering::SeqCst);
    info!(
        batches = shared.batches_executed.load(Ordering::Relaxed),
        failed = shared.batches_failed.load(Ordering::Relaxed),
        "Batch coalescer drained"
    );
}

fn flush<P, R>(
    queue: &mut Vec<Pending<P, R>>,
    trigger: FlushTrigger,
    executor: &Arc<dyn BatchExecutor<P, R>>,
    shared: &Arc<Shared>,
    running: &mut JoinSet<()>,
) where
    P: Send + 'static,
    R: Send + 'static,
{
    let batch = std::mem::take(queue);
    shared.pending.fetch_sub(batch.len(), Ordering::SeqCst);
    shared.in_flight.fetch_add(1, Ordering::SeqCst);
    debug!(batch_size = batch.len(), trigger = trigger.as_str(), "Flushing batch");

    running.spawn(execute_batch(batch, Arc::clone(executor), Arc::clone(shared)));
}

/// Account for a finished batch task. A panicked task has dropped its
/// senders, so its callers already see `BatchError::Abandoned`, and its
/// requests were counted by [`ProcessedGuard`] while unwinding.
fn reap(done: Result<(), tokio::task::JoinError>, shared: &Shared) {
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    if let Err(e) = done {
        shared.batches_failed.fetch_add(1, Ordering::Relaxed);
        error!(error = %e, "Batch task panicked");
    }
}

/// Adds a batch's requests to `requests_processed` when dropped, so a
/// batch whose executor panics is still counted.
struct ProcessedGuard<'a> {
    shared: &'a Shared,
    count: u64,
}

impl Drop for ProcessedGuard<'_> {
    fn drop(&mut self) {
        self.shared.requests_processed.fetch_add(self.count, Ordering::Relaxed);
    }
}

async fn execute_batch<P, R>(batch: Vec<Pending<P, R>>, executor: Arc<dyn BatchExecutor<P, R>>, shared: Arc<Shared>)
where
    P: Send + 'static,
    R: Send + 'static,
{
    let expected = batch.len();
    let processed = ProcessedGuard {
        shared: &shared,
        count: expected as u64,
    };
    let mut payloads = Vec::with_capacity(expected);
    let mut waiters = Vec::with_capacity(expected);
    for pending in batch {
        payloads.push(pending.payload);
        waiters.push((pending.id, pending.respond));
    }

    let outcome = match executor.execute(payloads).await {
        Ok(results) if results.len() == expected => Ok(results),
        Ok(results) => Err(BatchError::LengthMismatch {
            expected,
            actual: results.len(),
        }),
        Err(e) => Err(e),
    };

    drop(processed);

    match outcome {
        Ok(results) => {
            shared.batches_executed.fetch_add(1, Ordering::Relaxed);
            for ((id, respond), result) in waiters.into_iter().zip(results) {
                if respond.send(Ok(result)).is_err() {
                    debug!(request_id = %id, "Caller went away before its result arrived");
                }
            }
        }
        Err(err) => {
            shared.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(batch_size = expected, error = %err, "Batch failed, failing every request in it");
            for (_, respond) in waiters {
                let _ = respond.send(Err(err.clone()));
            }
        }
    }
}
