use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::{pair_with_token, SharedState, WaitStatus};
use crate::cancel::CancellationToken;
use crate::executor::{inline_executor, Executor, Work};
use crate::outcome::{BoxError, Outcome};
use crate::Error;

/// Single-use read handle observing a promise's eventual outcome.
///
/// Attaching a continuation or blocking on the result consumes the future,
/// so only one continuation chain can ever hang off one instance. Dropping
/// an unconsumed future just releases the read capability; the producer
/// side is unaffected.
pub struct Future<T> {
    state: Arc<SharedState<T>>,
    token: Arc<CancellationToken>,
}

impl<T> Future<T> {
    pub(crate) fn new(state: Arc<SharedState<T>>, token: Arc<CancellationToken>) -> Self {
        Self { state, token }
    }

    fn with_outcome(outcome: Outcome<T>) -> Self {
        Self {
            state: Arc::new(SharedState::with_outcome(outcome)),
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// A future that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self::with_outcome(Outcome::Value(value))
    }

    /// A future that is already resolved with an error payload.
    pub fn from_error<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::with_outcome(Outcome::Error(error.into()))
    }

    /// A future that is already canceled.
    pub fn canceled() -> Self {
        Self::with_outcome(Outcome::Canceled)
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_resolved()
    }

    /// Block until resolved and move the outcome out.
    pub fn get(self) -> Outcome<T> {
        self.state.wait_outcome()
    }

    /// Block until resolved or until `timeout` elapsed. Timing out does
    /// not consume or disturb the outcome, the operation keeps running.
    pub fn wait_for(&self, timeout: Duration) -> WaitStatus {
        self.state.wait_timeout(timeout)
    }

    /// Request cancellation of the whole chain this future belongs to.
    ///
    /// Advisory: the state stays pending until a producer acts on the
    /// request. Requesting on an already-resolved future has no effect.
    pub fn request_cancel(&self) {
        self.token.request_cancel();
    }

    /// Register `callback` to run when cancellation is requested on this
    /// chain.
    pub fn set_cancelable<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.token.push_callback(callback);
    }

    /// A detached callable that requests cancellation of this chain.
    pub fn canceler(&self) -> impl FnOnce() + Send + 'static {
        let token = self.token.clone();
        move || token.request_cancel()
    }

    pub fn cancellation_token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    pub(crate) fn shared(&self) -> Arc<SharedState<T>> {
        self.state.clone()
    }
}

impl<T: Send + 'static> Future<T> {
    /// Chain a value handler running on `executor`.
    ///
    /// `Error` and `Canceled` outcomes propagate to the returned future
    /// without invoking `f`. A cancellation already requested on the chain
    /// when the value arrives also suppresses `f` and yields `Canceled`.
    /// A panic inside `f` resolves the returned future to an error.
    pub fn then<U, F>(self, executor: &Executor, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let token = self.token.clone();
        self.then_outcome(executor, "then", move |outcome| match outcome {
            Outcome::Value(value) => {
                if token.is_cancel_requested() {
                    Outcome::Canceled
                } else {
                    Outcome::Value(f(value))
                }
            }
            Outcome::Error(error) => Outcome::Error(error),
            Outcome::Canceled => Outcome::Canceled,
        })
    }

    /// Chain an outcome handler running on `executor`.
    ///
    /// Unlike [`then`](Self::then) the handler always runs and sees the raw
    /// outcome, so it can recover from errors or cancellation, or
    /// re-propagate them.
    pub fn then_catch<U, F>(self, executor: &Executor, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        self.then_outcome(executor, "then_catch", f)
    }

    fn then_outcome<U, F>(self, executor: &Executor, name: &'static str, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let (promise, derived) = pair_with_token(self.token.clone());
        let state = self.state;
        let source = state.clone();
        let work = Work::named(name, move || {
            let outcome = source.take_outcome();
            match catch_unwind(AssertUnwindSafe(move || f(outcome))) {
                Ok(outcome) => {
                    let _ = promise.complete(outcome);
                }
                Err(payload) => {
                    let _ = promise.set_error(Error::panicked(payload));
                }
            }
        });
        state
            .attach(executor, work)
            .expect("future already has a continuation");
        derived
    }

    /// Terminal attach used by internal consumers; `f` receives the
    /// outcome on `executor` and no derived future is produced.
    pub(crate) fn attach_outcome<F>(self, executor: &Executor, name: &'static str, f: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let state = self.state;
        let source = state.clone();
        let work = Work::named(name, move || f(source.take_outcome()));
        state
            .attach(executor, work)
            .expect("future already has a continuation");
    }
}

impl<T: Send + 'static> Future<Future<T>> {
    /// Collapse a nested future, chaining the inner completion to the
    /// returned future's resolution.
    ///
    /// Cancellation requests on the collapsed chain are forwarded to the
    /// inner future once it exists.
    pub fn unwrap(self) -> Future<T> {
        let token = self.token.clone();
        let (promise, collapsed) = pair_with_token(token.clone());
        self.attach_outcome(&inline_executor(), "unwrap", move |outer| match outer {
            Outcome::Value(inner) => {
                token.push_callback(inner.canceler());
                inner.attach_outcome(&inline_executor(), "unwrap-inner", move |outcome| {
                    let _ = promise.complete(outcome);
                });
            }
            Outcome::Error(error) => {
                let _ = promise.set_error(error);
            }
            Outcome::Canceled => {
                let _ = promise.set_canceled();
            }
        });
        collapsed
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::future::make_promise_future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_then_propagates_errors_without_running_handler() {
        let ran = Arc::new(AtomicUsize::new(0));
        let future = Future::<i32>::from_error(Error::Panicked("boom".to_owned()));
        let chained = {
            let ran = ran.clone();
            future.then(&inline_executor(), move |x| {
                ran.fetch_add(1, Ordering::SeqCst);
                x
            })
        };
        match chained.get() {
            Outcome::Error(err) => {
                assert_eq!(
                    err.downcast_ref::<Error>(),
                    Some(&Error::Panicked("boom".to_owned()))
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_canceled_chain_skips_value_handlers() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (promise, future) = make_promise_future::<i32>();
        let chained = {
            let ran = ran.clone();
            let ran2 = ran.clone();
            future
                .then(&inline_executor(), move |x| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    x + 1
                })
                .then(&inline_executor(), move |x| {
                    ran2.fetch_add(1, Ordering::SeqCst);
                    x + 1
                })
        };
        promise.set_canceled().unwrap();
        assert!(chained.get().is_canceled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_then_catch_recovers() {
        let future = Future::<i32>::canceled();
        let recovered = future.then_catch(&inline_executor(), |outcome| match outcome {
            Outcome::Canceled => Outcome::Value(-1),
            other => other,
        });
        assert_eq!(recovered.get().value(), Some(-1));
    }

    #[test]
    fn test_cancel_request_suppresses_late_value() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (promise, future) = make_promise_future::<i32>();
        let chained = {
            let ran = ran.clone();
            future.then(&inline_executor(), move |x| {
                ran.fetch_add(1, Ordering::SeqCst);
                x
            })
        };
        chained.request_cancel();
        // Advisory cancellation, the value still lands on the source.
        promise.set_value(1).unwrap();
        assert!(chained.get().is_canceled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_continuation_becomes_error() {
        let future = Future::resolved(1);
        let chained = future.then(&inline_executor(), |_| -> i32 { panic!("kaboom") });
        match chained.get() {
            Outcome::Error(err) => {
                assert_eq!(
                    err.downcast_ref::<Error>(),
                    Some(&Error::Panicked("kaboom".to_owned()))
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_set_cancelable_fires_once_and_value_still_lands() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (promise, future) = make_promise_future::<i32>();
        {
            let calls = calls.clone();
            future.set_cancelable(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        future.request_cancel();
        future.request_cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        promise.set_value(1).unwrap();
        assert_eq!(future.get().value(), Some(1));
    }

    #[test]
    fn test_unwrap_ready_nested() {
        let nested = Future::resolved(Future::resolved(42));
        assert_eq!(nested.unwrap().get().value(), Some(42));
    }

    #[test]
    fn test_unwrap_outer_error() {
        let nested = Future::<Future<i32>>::from_error(Error::Panicked("outer".to_owned()));
        assert!(nested.unwrap().get().is_error());
    }

    #[test]
    fn test_unwrap_outer_canceled() {
        let nested = Future::<Future<i32>>::canceled();
        assert!(nested.unwrap().get().is_canceled());
    }

    #[test]
    fn test_unwrap_pending_inner() {
        let (outer_promise, outer_future) = make_promise_future::<Future<i32>>();
        let (inner_promise, inner_future) = make_promise_future::<i32>();
        let collapsed = outer_future.unwrap();
        outer_promise.set_value(inner_future).unwrap();
        assert!(!collapsed.is_ready());
        inner_promise.set_value(42).unwrap();
        assert_eq!(collapsed.get().value(), Some(42));
    }

    #[test]
    fn test_unwrap_forwards_cancellation_to_inner() {
        let (outer_promise, outer_future) = make_promise_future::<Future<i32>>();
        let (inner_promise, inner_future) = make_promise_future::<i32>();
        {
            let inner_state = inner_future.shared();
            inner_future.set_cancelable(move || {
                let _ = inner_state.resolve(Outcome::Canceled);
            });
        }
        let collapsed = outer_future.unwrap();
        outer_promise.set_value(inner_future).unwrap();
        collapsed.request_cancel();
        assert!(collapsed.get().is_canceled());
        drop(inner_promise);
    }
}
