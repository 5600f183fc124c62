use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::executor::{Executor, ExecutorImpl, Work};
use crate::future::make_promise_future;
use crate::outcome::Outcome;
use crate::{Error, Future};

/// Run `f` on `executor` and observe its result through a future.
///
/// The future is cancelable as long as the task has not started: a
/// cancellation request resolves it to `Canceled` right away and the queued
/// task, once dequeued, observes the resolved state and skips `f`. A panic
/// in `f` becomes the future's error outcome.
pub fn spawn<T, F>(executor: &Executor, f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (promise, future) = make_promise_future::<T>();
    {
        let canceled = future.shared();
        future.cancellation_token().push_callback(move || {
            let _ = canceled.resolve(Outcome::Canceled);
        });
    }
    let state = future.shared();
    let work = Work::named("spawn", move || {
        if state.is_resolved() {
            // Canceled before we were dequeued.
            return;
        }
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = promise.set_value(value);
            }
            Err(payload) => {
                let _ = promise.set_error(Error::panicked(payload));
            }
        }
    });
    if let Err(err) = executor.post(work) {
        // The dropped work resolved the future as a broken promise.
        log::warn!("spawn: {err}");
    }
    future
}
