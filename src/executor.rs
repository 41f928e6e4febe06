//! The abstract executor every channel pins itself to.
//!
//! Concrete executor *groups* (thread-pool sizing, affinity, shutdown
//! coordination across many channels) are out of scope for this crate (§1);
//! only the single-channel-facing interface is specified here. A channel
//! never spawns work itself — every pipeline traversal, state transition, and
//! transport call is a task submitted to (or already running on) exactly one
//! [`Executor`].

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::CoreError;
use crate::promise::Promise;

/// A unit of work submitted to an [`Executor`]. Always `FnOnce` — the
/// executor runs it exactly once, synchronously from its own perspective,
/// with no yielding back into the submitter's stack frame.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A hook an executor invokes while shutting down, e.g. to let a channel
/// drain its outbound buffer before the executor stops accepting work.
pub type ShutdownHook = Box<dyn Fn() + Send + Sync + 'static>;

/// The executor interface a channel pins itself to (§6). An implementation
/// typically wraps a single OS thread's run loop plus a task queue; this
/// crate ships none, only the contract and the [`Channel`](crate::channel)
/// logic that calls into it.
pub trait Executor: Send + Sync + 'static {
    /// Submits `task` for execution. May return [`CoreError`] with
    /// [`crate::error::codes::REJECTED_EXECUTION`] if the executor refuses
    /// the task (e.g. it is shutting down); the caller is responsible for
    /// the fallout (the registration path force-closes the channel on a
    /// rejected submission, per §4.E).
    fn execute(&self, task: Task) -> Result<(), CoreError>;

    /// `true` iff the calling thread is this executor's own run loop.
    /// Every operation on [`crate::channel::Channel`] consults this before
    /// deciding whether to run inline or trampoline via [`Executor::execute`].
    fn in_event_loop(&self) -> bool;

    /// Submits `task` and returns a promise that completes once it has run.
    /// The default forwards to [`Executor::execute`]; an executor with a
    /// cheaper native future type may override this to avoid the extra
    /// boxing layer [`Promise`] imposes.
    fn submit(&self, task: Task) -> Promise<()> {
        let promise = Promise::new();
        let completion = promise.clone();
        let wrapped: Task = Box::new(move || {
            task();
            completion.complete(());
        });
        if let Err(err) = self.execute(wrapped) {
            promise.fail(err);
        }
        promise
    }

    /// Registers a hook run while the executor is shutting down. The default
    /// is a no-op; executors that support graceful drain override it.
    fn add_shutdown_hook(&self, _hook: ShutdownHook) {}

    /// Best-effort removal of a previously registered shutdown hook.
    /// Executors that do not track hook identity may treat this as a no-op.
    fn remove_shutdown_hook(&self, _hook: &ShutdownHook) {}
}

/// Returns `true` iff `a` and `b` are the very same executor instance —
/// the identity check §4.E's registration contract and §9's open question
/// about re-registration both require ("the same instance on every
/// re-registration", never merely an executor of the same type).
pub fn same_executor(a: &Arc<dyn Executor>, b: &Arc<dyn Executor>) -> bool {
    Arc::ptr_eq(a, b)
}

/// A trivial [`Executor`] that runs every submitted task synchronously, on
/// whatever thread calls [`Executor::execute`]. Used throughout this crate's
/// own test suite instead of pulling in an external async runtime as a
/// dev-dependency — every channel operation in a test therefore completes
/// before the call that triggered it returns, which is exactly what makes
/// the scenario tests in §8 straightforward to assert against.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use super::{CoreError, Executor, ShutdownHook, Task};
    use core::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct InlineExecutor {
        rejecting: AtomicBool,
    }

    impl InlineExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Builds an executor whose `execute` always fails with
        /// [`crate::error::codes::REJECTED_EXECUTION`], for exercising the
        /// force-close-on-rejection path (§8 scenario 6).
        pub fn rejecting() -> Self {
            Self {
                rejecting: AtomicBool::new(true),
            }
        }
    }

    impl Executor for InlineExecutor {
        fn execute(&self, task: Task) -> Result<(), CoreError> {
            if self.rejecting.load(Ordering::Acquire) {
                return Err(CoreError::new(
                    crate::error::codes::REJECTED_EXECUTION,
                    "InlineExecutor configured to reject every task",
                ));
            }
            task();
            Ok(())
        }

        fn in_event_loop(&self) -> bool {
            true
        }

        fn add_shutdown_hook(&self, _hook: ShutdownHook) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        runs: AtomicUsize,
    }

    impl Executor for CountingExecutor {
        fn execute(&self, task: Task) -> Result<(), CoreError> {
            task();
            self.runs.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn in_event_loop(&self) -> bool {
            true
        }
    }

    #[test]
    fn submit_completes_after_task_runs() {
        let executor = CountingExecutor {
            runs: AtomicUsize::new(0),
        };
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let promise = executor.submit(Box::new(move || {
            ran2.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(promise.is_done());
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(executor.runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn same_executor_is_pointer_identity_not_type_identity() {
        let a: Arc<dyn Executor> = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
        });
        let b: Arc<dyn Executor> = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
        });
        assert!(same_executor(&a, &a.clone()));
        assert!(!same_executor(&a, &b));
    }
}
