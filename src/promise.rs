//! The completion handle every `_async` operation and outbound write returns.
//!
//! A coroutine/async suspension in the source material maps here to an
//! explicit [`Promise`]: complete-success, complete-failure, cancel,
//! set-uncancellable, and has-completed are all first-class operations, and
//! the type also implements [`Future`] so in-loop code can simply `.await` it
//! instead of polling by hand.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context as TaskContext, Poll, Waker};

use spin::Mutex;

use crate::CoreError;

/// The terminal state of a [`Promise`].
#[derive(Clone, Debug)]
pub enum Outcome<T> {
    /// The operation completed successfully.
    Success(T),
    /// The operation failed; `cause` carries the reported error.
    Failure(CoreError),
    /// The operation was cancelled before it committed.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Converts the outcome into a `Result`, mapping cancellation to a
    /// `Cancelled`-category [`CoreError`].
    pub fn into_result(self) -> Result<T, CoreError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(cause) => Err(cause),
            Outcome::Cancelled => Err(CoreError::new(
                crate::error::codes::PIPELINE_EXCEPTION,
                "operation was cancelled",
            )
            .with_category(crate::error::ErrorCategory::Cancelled)),
        }
    }

    /// True iff this outcome is [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// True iff this outcome is [`Outcome::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

type Callback<T> = alloc::boxed::Box<dyn FnOnce(Outcome<T>) + Send>;

enum State<T> {
    Pending {
        wakers: Vec<Waker>,
        uncancellable: bool,
        callbacks: Vec<Callback<T>>,
    },
    Done(Outcome<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// A one-shot completion object, shareable across threads and observable by
/// any number of clones. Every clone sees the same terminal [`Outcome`].
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match &*self.inner.state.lock() {
            State::Pending { uncancellable, .. } => {
                if *uncancellable {
                    "pending(uncancellable)"
                } else {
                    "pending"
                }
            }
            State::Done(Outcome::Success(_)) => "success",
            State::Done(Outcome::Failure(_)) => "failure",
            State::Done(Outcome::Cancelled) => "cancelled",
        };
        write!(f, "Promise({})", tag)
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates a new, pending, cancellable promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    wakers: Vec::new(),
                    uncancellable: false,
                    callbacks: Vec::new(),
                }),
            }),
        }
    }

    /// Creates a promise already resolved to `outcome`. Used by call sites
    /// that synchronously know the answer (e.g. `close()` called a second
    /// time returns the already-completed `close_completion`).
    pub fn ready(outcome: Outcome<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(outcome)),
            }),
        }
    }

    fn transition_to_done(&self, outcome: Outcome<T>) -> bool
    where
        T: Clone,
    {
        let mut guard = self.inner.state.lock();
        match &*guard {
            State::Done(_) => false,
            State::Pending { .. } => {
                let (wakers, callbacks) =
                    match core::mem::replace(&mut *guard, State::Done(outcome.clone())) {
                        State::Pending {
                            wakers, callbacks, ..
                        } => (wakers, callbacks),
                        State::Done(_) => unreachable!(),
                    };
                drop(guard);
                for waker in wakers {
                    waker.wake();
                }
                for callback in callbacks {
                    callback(outcome.clone());
                }
                true
            }
        }
    }

    /// Registers a callback invoked exactly once with the terminal outcome —
    /// immediately (inline) if the promise has already completed, or later
    /// (inline, from whichever call transitions the promise to done)
    /// otherwise. Used to link one promise's completion to another's, e.g.
    /// forwarding a pending-write queue entry's promise into the outbound
    /// buffer's own entry so both observe the same outcome.
    pub fn on_complete<F>(&self, callback: F)
    where
        T: Clone,
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let mut guard = self.inner.state.lock();
        match &mut *guard {
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(guard);
                callback(outcome);
            }
            State::Pending { callbacks, .. } => {
                callbacks.push(alloc::boxed::Box::new(callback));
            }
        }
    }

    /// Builds a promise that completes successfully once every member of
    /// `members` has completed successfully, fails as soon as any member
    /// fails, and is cancelled if any member is cancelled. Used by the
    /// pending-write queue's batching variant to hand back one handle for a
    /// whole batch.
    pub fn aggregate(members: alloc::vec::Vec<Promise<T>>) -> Promise<()>
    where
        T: Clone + Send + 'static,
    {
        let combined: Promise<()> = Promise::new();
        if members.is_empty() {
            combined.complete(());
            return combined;
        }
        let remaining = Arc::new(core::sync::atomic::AtomicUsize::new(members.len()));
        for member in members {
            let combined = combined.clone();
            let remaining = remaining.clone();
            member.on_complete(move |outcome| match outcome {
                Outcome::Success(_) => {
                    if remaining.fetch_sub(1, core::sync::atomic::Ordering::AcqRel) == 1 {
                        combined.complete(());
                    }
                }
                Outcome::Failure(cause) => {
                    combined.fail(cause);
                }
                Outcome::Cancelled => {
                    combined.cancel();
                }
            });
        }
        combined
    }

    /// Completes the promise with success. Returns `true` if this call
    /// performed the transition (the promise was still pending).
    pub fn complete(&self, value: T) -> bool
    where
        T: Clone,
    {
        self.transition_to_done(Outcome::Success(value))
    }

    /// Completes the promise with failure. Returns `true` if this call
    /// performed the transition.
    pub fn fail(&self, cause: CoreError) -> bool
    where
        T: Clone,
    {
        self.transition_to_done(Outcome::Failure(cause))
    }

    /// Attempts to cancel the promise. Returns `false` (a no-op) if the
    /// promise has already completed or has been marked uncancellable via
    /// [`Promise::set_uncancellable`] — this is exactly the guard the flush
    /// boundary relies on: once `add_flush` commits a write, a late `cancel`
    /// from the original caller must be ignored.
    pub fn cancel(&self) -> bool {
        let mut guard = self.inner.state.lock();
        match &*guard {
            State::Done(_) => false,
            State::Pending { uncancellable, .. } if *uncancellable => false,
            State::Pending { .. } => {
                let (wakers, callbacks) = match core::mem::replace(
                    &mut *guard,
                    State::Done(Outcome::Cancelled),
                ) {
                    State::Pending {
                        wakers, callbacks, ..
                    } => (wakers, callbacks),
                    State::Done(_) => unreachable!(),
                };
                drop(guard);
                for waker in wakers {
                    waker.wake();
                }
                for callback in callbacks {
                    callback(Outcome::Cancelled);
                }
                true
            }
        }
    }

    /// Marks the promise uncancellable if it is still pending. Returns
    /// `true` on success, `false` if it was already cancelled (the caller
    /// must then treat the operation as never having started) or already
    /// completed.
    pub fn set_uncancellable(&self) -> bool {
        let mut guard = self.inner.state.lock();
        match &mut *guard {
            State::Pending { uncancellable, .. } => {
                *uncancellable = true;
                true
            }
            State::Done(Outcome::Cancelled) => false,
            State::Done(_) => true,
        }
    }

    /// True iff the promise has reached any terminal state.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// True iff the promise's terminal state is [`Outcome::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(Outcome::Cancelled))
    }

    /// Returns the outcome if the promise has already completed, without
    /// blocking or registering a waker.
    pub fn peek(&self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        match &*self.inner.state.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.state.lock();
        match &mut *guard {
            State::Done(outcome) => Poll::Ready(outcome.clone()),
            State::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn complete_resolves_pending_observers() {
        let promise: Promise<u32> = Promise::new();
        let clone = promise.clone();
        assert!(promise.complete(7));
        assert!(!promise.complete(9), "double complete must be a no-op");
        match block_on(clone) {
            Outcome::Success(v) => assert_eq!(v, 7),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancel_before_completion_short_circuits_later_complete() {
        let promise: Promise<()> = Promise::new();
        assert!(promise.cancel());
        assert!(promise.is_cancelled());
        assert!(!promise.complete(()), "completing a cancelled promise must be a no-op");
    }

    #[test]
    fn set_uncancellable_blocks_subsequent_cancel() {
        let promise: Promise<()> = Promise::new();
        assert!(promise.set_uncancellable());
        assert!(!promise.cancel(), "cancel must be ignored once uncancellable");
        assert!(promise.complete(()));
    }

    #[test]
    fn cancel_racing_set_uncancellable_is_consistent() {
        let promise: Promise<()> = Promise::new();
        assert!(promise.cancel());
        assert!(
            !promise.set_uncancellable(),
            "set_uncancellable must report failure once already cancelled"
        );
    }
}
