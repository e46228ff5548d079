//! One-shot completion plumbing between the dispatcher and callers.
//!
//! Every asynchronous entry point creates exactly one [`CompletionSink`]
//! before it enqueues work. The sink is consumed by [`CompletionSink::complete`],
//! so it cannot be delivered twice, and a sink dropped without being
//! completed reports an `InternalError` from its `Drop`, so it cannot be
//! delivered zero times either.
//!
//! The receiving half is either a [`Completion`] future or a plain callback.
//! Delivery happens on whichever thread completes the sink; moving the result
//! to a UI thread is the host's business.

use crate::error::{ErrorKind, Failure};
use futures::channel::oneshot;
use futures::task::{ArcWake, waker};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::Thread;
use std::time::{Duration, Instant};

pub type CompletionResult<T> = Result<T, Failure>;

type Callback<T> = Box<dyn FnOnce(CompletionResult<T>) + Send>;

enum Target<T> {
    Channel(oneshot::Sender<CompletionResult<T>>),
    Callback(Callback<T>),
}

impl<T> Target<T> {
    fn deliver(self, result: CompletionResult<T>) {
        match self {
            Self::Channel(tx) => {
                if tx.send(result).is_err() {
                    tracing::trace!("completion receiver dropped before delivery");
                }
            }
            Self::Callback(callback) => callback(result),
        }
    }
}

/// Single-assignment sender for one work item's outcome.
pub struct CompletionSink<T> {
    target: Option<Target<T>>,
}

impl<T> CompletionSink<T> {
    /// Deliver to `callback` on the completing thread.
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: FnOnce(CompletionResult<T>) + Send + 'static,
    {
        Self {
            target: Some(Target::Callback(Box::new(callback))),
        }
    }

    pub fn complete(mut self, result: CompletionResult<T>) {
        if let Some(target) = self.target.take() {
            target.deliver(result);
        }
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, failure: impl Into<Failure>) {
        self.complete(Err(failure.into()));
    }
}

impl<T> Drop for CompletionSink<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            tracing::warn!("work item dropped before completing");
            target.deliver(Err(Failure::new(
                ErrorKind::InternalError,
                "work item was dropped before it completed",
            )));
        }
    }
}

impl<T> std::fmt::Debug for CompletionSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSink")
            .field("pending", &self.target.is_some())
            .finish()
    }
}

/// Create a connected sink / future pair.
#[must_use]
pub fn completion<T>() -> (CompletionSink<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (
        CompletionSink {
            target: Some(Target::Channel(tx)),
        },
        Completion {
            state: State::Pending(rx),
        },
    )
}

enum State<T> {
    Ready(Option<CompletionResult<T>>),
    Pending(oneshot::Receiver<CompletionResult<T>>),
}

/// Receiving half of a completion. Resolves exactly once.
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T> {
    state: State<T>,
}

// No field is ever pinned structurally.
impl<T> Unpin for Completion<T> {}

impl<T> Completion<T> {
    /// An already-resolved completion, used when nothing needs enqueueing.
    pub const fn ready(result: CompletionResult<T>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    pub const fn ok(value: T) -> Self {
        Self::ready(Ok(value))
    }

    /// Block the current thread until the result arrives.
    ///
    /// Never call this on the dispatcher thread for work queued behind the
    /// current item; it would wait forever.
    pub fn wait(self) -> CompletionResult<T> {
        futures::executor::block_on(self)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, handing the
    /// completion back so the caller can keep waiting.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<CompletionResult<T>, Self> {
        let deadline = Instant::now() + timeout;
        let wake = waker(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = Context::from_waker(&wake);
        loop {
            if let Poll::Ready(result) = Pin::new(&mut self).poll(&mut cx) {
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self);
            }
            std::thread::park_timeout(deadline - now);
        }
    }

    /// Take the result if it has already been delivered.
    pub fn try_take(&mut self) -> Option<CompletionResult<T>> {
        match &mut self.state {
            State::Ready(slot) => slot.take(),
            State::Pending(rx) => match rx.try_recv() {
                Ok(Some(result)) => {
                    self.state = State::Ready(None);
                    Some(result)
                }
                Ok(None) => None,
                Err(oneshot::Canceled) => {
                    self.state = State::Ready(None);
                    Some(Err(canceled()))
                }
            },
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = CompletionResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(Failure::new(
                    ErrorKind::InternalError,
                    "completion polled after it resolved",
                ))
            })),
            State::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(received) => {
                    this.state = State::Ready(None);
                    Poll::Ready(received.unwrap_or_else(|oneshot::Canceled| Err(canceled())))
                }
            },
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "taken",
            State::Pending(_) => "pending",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

fn canceled() -> Failure {
    Failure::new(ErrorKind::InternalError, "completion sink vanished")
}

struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}
