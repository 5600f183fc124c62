use bitflags::bitflags;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::executor::{Executor, ExecutorImpl, Work};
use crate::outcome::Outcome;
use crate::Error;

mod future;
pub use future::*;
mod promise;
pub use promise::*;

/// Result of a bounded wait. `TimedOut` leaves the outcome untouched, the
/// producer side keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    TimedOut,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StateFlags: u8 {
        /// A continuation chain is registered on this state.
        const ATTACHED = 1 << 0;
        /// The outcome was moved out to a reader or a continuation.
        const TAKEN = 1 << 1;
        /// Resolved by the promise being dropped while pending.
        const BROKEN = 1 << 2;
    }
}

/// The cell connecting a promise to its future.
///
/// The outcome is written exactly once; the lock arbitrates racing terminal
/// transitions, whichever takes it first wins and the loser is told
/// `AlreadySatisfied`.
pub(crate) struct SharedState<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

struct Inner<T> {
    outcome: Option<Outcome<T>>,
    continuation: Option<(Executor, Work)>,
    flags: StateFlags,
}

impl<T> SharedState<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                outcome: None,
                continuation: None,
                flags: StateFlags::empty(),
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn with_outcome(outcome: Outcome<T>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                outcome: Some(outcome),
                continuation: None,
                flags: StateFlags::empty(),
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("Unrecoverable error")
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub(crate) fn resolve(&self, outcome: Outcome<T>) -> Result<(), Error> {
        self.resolve_with(outcome, StateFlags::empty())
    }

    pub(crate) fn resolve_broken(&self) -> Result<(), Error> {
        self.resolve_with(
            Outcome::Error(Box::new(Error::BrokenPromise)),
            StateFlags::BROKEN,
        )
    }

    fn resolve_with(&self, outcome: Outcome<T>, extra: StateFlags) -> Result<(), Error> {
        let continuation = {
            let mut inner = self.lock();
            if inner.outcome.is_some() {
                return Err(Error::AlreadySatisfied);
            }
            inner.outcome = Some(outcome);
            inner.flags.insert(extra);
            inner.continuation.take()
        };
        self.ready.notify_all();
        if let Some((executor, work)) = continuation {
            Self::dispatch(&executor, work);
        }
        Ok(())
    }

    /// Register the continuation, or schedule it right away when the state
    /// is already resolved.
    pub(crate) fn attach(&self, executor: &Executor, work: Work) -> Result<(), Error> {
        let run_now = {
            let mut inner = self.lock();
            if inner.flags.contains(StateFlags::ATTACHED) {
                return Err(Error::DoubleAttach);
            }
            inner.flags.insert(StateFlags::ATTACHED);
            if inner.outcome.is_some() {
                Some(work)
            } else {
                inner.continuation = Some((executor.clone(), work));
                None
            }
        };
        if let Some(work) = run_now {
            Self::dispatch(executor, work);
        }
        Ok(())
    }

    fn dispatch(executor: &Executor, work: Work) {
        let name = work.name();
        if let Err(err) = executor.post(work) {
            // The dropped work resolves its derived state as a broken
            // promise, the chain never hangs.
            log::warn!("dropping continuation `{name}`: {err}");
        }
    }

    /// Move the outcome out. Only called once the state is resolved and
    /// only by the single reader of this state.
    pub(crate) fn take_outcome(&self) -> Outcome<T> {
        let mut inner = self.lock();
        inner.flags.insert(StateFlags::TAKEN);
        inner.outcome.take().expect("outcome is not available")
    }

    pub(crate) fn wait_outcome(&self) -> Outcome<T> {
        let mut inner = self.lock();
        while inner.outcome.is_none() {
            inner = self.ready.wait(inner).expect("Unrecoverable error");
        }
        inner.flags.insert(StateFlags::TAKEN);
        inner.outcome.take().expect("outcome is not available")
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return WaitStatus::TimedOut;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(inner, deadline - now)
                .expect("Unrecoverable error");
            inner = guard;
        }
        WaitStatus::Ready
    }
}

impl<T> fmt::Debug for SharedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SharedState")
            .field("resolved", &inner.outcome.is_some())
            .field("flags", &inner.flags)
            .finish_non_exhaustive()
    }
}

/// Construct a pending shared state with its single writer and single
/// reader, sharing a fresh cancellation token.
pub fn make_promise_future<T>() -> (Promise<T>, Future<T>) {
    pair_with_token(Arc::new(CancellationToken::new()))
}

pub(crate) fn pair_with_token<T>(token: Arc<CancellationToken>) -> (Promise<T>, Future<T>) {
    let state = Arc::new(SharedState::new());
    (
        Promise::new(state.clone(), token.clone()),
        Future::new(state, token),
    )
}
