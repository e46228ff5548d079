//! Single-threaded work dispatcher.
//!
//! One worker thread owns a piece of thread-local state `S` (for the bridge,
//! the embedded engine) and runs boxed work items against it in FIFO order.
//! `S` is built on the worker by the `init` closure and never leaves it, so
//! it does not need to be `Send`.
//!
//! Producers push onto a lock-free queue and unpark the worker; they never
//! wait for execution.
//!
//! # Invariants
//!
//! - Items run one at a time, in the order their pushes linearized.
//! - Every accepted item runs exactly once, unless shutdown was requested
//!   with [`ShutdownPolicy::Immediate`], in which case it is dropped.
//! - A panic inside an item is contained; the worker moves on to the next one.

use crate::config::{BridgeConfig, ShutdownPolicy};
use crate::error::{Error, Failure, Result};
use crossbeam_queue::SegQueue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

pub type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

const WATCHDOG_MIN_TICK: Duration = Duration::from_millis(5);

struct WorkItem<S> {
    id: u64,
    label: &'static str,
    work: Work<S>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued { id: u64, depth: usize },
    /// Shutdown has begun. The item was dropped, so its completion sink has
    /// already reported the failure.
    Rejected,
}

impl EnqueueResult {
    #[must_use]
    pub const fn is_queued(self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherOptions {
    pub thread_name: String,
    pub shutdown: ShutdownPolicy,
    pub watchdog_threshold: Option<Duration>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for DispatcherOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            thread_name: config.thread_name.clone(),
            shutdown: config.shutdown,
            watchdog_threshold: config.watchdog_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherTelemetry {
    pub pending: usize,
    pub executed: u64,
    pub panicked: u64,
    pub discarded: u64,
    pub watchdog_flags: u64,
}

#[derive(Debug)]
struct BusyItem {
    id: u64,
    label: &'static str,
    started: Instant,
    flagged: bool,
}

struct Shared<S> {
    queue: SegQueue<WorkItem<S>>,
    // Held shared while pushing, exclusively while setting `closing`, so no
    // push can land after the worker has seen `closing`.
    gate: RwLock<()>,
    closing: AtomicBool,
    discard: AtomicBool,
    finished: AtomicBool,
    next_id: AtomicU64,
    pending: AtomicUsize,
    executed: AtomicU64,
    panicked: AtomicU64,
    discarded: AtomicU64,
    watchdog_flags: AtomicU64,
    busy: Mutex<Option<BusyItem>>,
    worker: OnceLock<Thread>,
}

impl<S> Shared<S> {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            gate: RwLock::new(()),
            closing: AtomicBool::new(false),
            discard: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            watchdog_flags: AtomicU64::new(0),
            busy: Mutex::new(None),
            worker: OnceLock::new(),
        }
    }

    /// Returns `true` if this call flipped the flag.
    fn close(&self) -> bool {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        !self.closing.swap(true, Ordering::AcqRel)
    }

    fn wake_worker(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }

    fn discard_remaining(&self) {
        while let Some(item) = self.queue.pop() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = item.id, label = item.label, "discarding queued work item");
            drop(item);
        }
    }
}

pub struct WorkDispatcher<S: 'static> {
    shared: Arc<Shared<S>>,
    worker_id: ThreadId,
    options: DispatcherOptions,
    worker: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> WorkDispatcher<S> {
    /// Start the worker thread. `init` runs on that thread and builds the
    /// state every work item receives.
    pub fn spawn<F>(options: DispatcherOptions, init: F) -> Result<Self>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let shared = Arc::new(Shared::new());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(options.thread_name.clone())
            .spawn(move || worker_main(&worker_shared, init))
            .map_err(|err| Error::internal(format!("spawn dispatcher thread: {err}")))?;
        let worker_id = worker.thread().id();
        let _ = shared.worker.set(worker.thread().clone());

        let watchdog = match options.watchdog_threshold {
            Some(threshold) => {
                let watchdog_shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(format!("{}-watchdog", options.thread_name))
                    .spawn(move || watchdog_main(&watchdog_shared, threshold))
                    .map_err(|err| Error::internal(format!("spawn watchdog thread: {err}")))?;
                Some(handle)
            }
            None => None,
        };

        tracing::debug!(thread = %options.thread_name, "dispatcher started");
        Ok(Self {
            shared,
            worker_id,
            options,
            worker: Mutex::new(Some(worker)),
            watchdog: Mutex::new(watchdog),
        })
    }

    /// Append a work item. Never blocks on execution.
    pub fn enqueue<F>(&self, label: &'static str, work: F) -> EnqueueResult
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let gate = self.shared.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.shared.closing.load(Ordering::Acquire) {
            drop(gate);
            tracing::warn!(label, "dispatcher is shutting down; rejecting work item");
            drop(work);
            return EnqueueResult::Rejected;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let depth = self.shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.queue.push(WorkItem {
            id,
            label,
            work: Box::new(work),
        });
        drop(gate);
        self.shared.wake_worker();
        tracing::trace!(id, label, depth, "work item queued");
        EnqueueResult::Queued { id, depth }
    }

    #[must_use]
    pub fn is_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    #[must_use]
    pub const fn worker_thread_id(&self) -> ThreadId {
        self.worker_id
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn telemetry(&self) -> DispatcherTelemetry {
        DispatcherTelemetry {
            pending: self.pending(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            watchdog_flags: self.shared.watchdog_flags.load(Ordering::Relaxed),
        }
    }

    /// Shut down with the configured policy.
    pub fn shutdown(&self) {
        self.shutdown_with(self.options.shutdown);
    }

    /// Stop accepting work and join the worker. Called from the worker itself
    /// (e.g. the last handle dropped inside a work item) it only signals.
    pub fn shutdown_with(&self, policy: ShutdownPolicy) {
        if policy == ShutdownPolicy::Immediate {
            self.shared.discard.store(true, Ordering::Release);
        }
        if self.shared.close() {
            tracing::debug!(?policy, pending = self.pending(), "dispatcher shutting down");
        }
        self.shared.wake_worker();

        if self.is_dispatcher_thread() {
            return;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("dispatcher worker exited by panic");
            }
        }
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watchdog) = watchdog {
            watchdog.thread().unpark();
            let _ = watchdog.join();
        }
    }
}

impl<S: 'static> Drop for WorkDispatcher<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: 'static> std::fmt::Debug for WorkDispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkDispatcher")
            .field("thread", &self.options.thread_name)
            .field("telemetry", &self.telemetry())
            .finish_non_exhaustive()
    }
}

/// Aborts the process if the dispatcher loop itself unwinds. Work item
/// panics never get this far.
struct LoopGuard;

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("dispatcher control loop panicked; aborting");
            std::process::abort();
        }
    }
}

fn worker_main<S, F>(shared: &Shared<S>, init: F)
where
    F: FnOnce() -> S,
{
    let guard = LoopGuard;
    let mut state = match catch_unwind(AssertUnwindSafe(init)) {
        Ok(state) => state,
        Err(payload) => {
            let failure = Failure::from_panic(payload.as_ref());
            tracing::error!(error = %failure, "dispatcher state initialization panicked");
            shared.close();
            shared.discard_remaining();
            shared.finished.store(true, Ordering::Release);
            drop(guard);
            return;
        }
    };

    loop {
        if let Some(item) = shared.queue.pop() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            if shared.discard.load(Ordering::Acquire) {
                shared.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = item.id, label = item.label, "discarding queued work item");
                continue;
            }
            run_item(shared, &mut state, item);
            continue;
        }
        if shared.closing.load(Ordering::Acquire) {
            // Nothing can be pushed once `closing` is visible; look once more
            // for a push that raced the pop above.
            if shared.queue.is_empty() {
                break;
            }
            continue;
        }
        thread::park();
    }

    drop(state);
    shared.finished.store(true, Ordering::Release);
    tracing::debug!(
        executed = shared.executed.load(Ordering::Relaxed),
        "dispatcher stopped"
    );
    drop(guard);
}

fn run_item<S>(shared: &Shared<S>, state: &mut S, item: WorkItem<S>) {
    let WorkItem { id, label, work } = item;
    *shared.busy.lock().unwrap_or_else(PoisonError::into_inner) = Some(BusyItem {
        id,
        label,
        started: Instant::now(),
        flagged: false,
    });
    tracing::trace!(id, label, "work item started");

    let outcome = catch_unwind(AssertUnwindSafe(move || work(state)));

    let busy = shared
        .busy
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    shared.executed.fetch_add(1, Ordering::Relaxed);
    if let Err(payload) = outcome {
        shared.panicked.fetch_add(1, Ordering::Relaxed);
        let failure = Failure::from_panic(payload.as_ref());
        tracing::error!(id, label, error = %failure, "work item panicked");
    } else if let Some(busy) = busy {
        tracing::trace!(
            id,
            label,
            elapsed_us = u64::try_from(busy.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "work item finished"
        );
    }
}

fn watchdog_main<S>(shared: &Shared<S>, threshold: Duration) {
    let tick = (threshold / 4).max(WATCHDOG_MIN_TICK);
    while !shared.finished.load(Ordering::Acquire) {
        thread::park_timeout(tick);
        let mut busy = shared.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(item) = busy.as_mut() {
            let elapsed = item.started.elapsed();
            if !item.flagged && elapsed > threshold {
                item.flagged = true;
                shared.watchdog_flags.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    id = item.id,
                    label = item.label,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "work item exceeded watchdog threshold"
                );
            }
        }
    }
}
