//! Concurrency primitives: promise/future pairs with single-assignment
//! shared state, cooperative cancellation, pluggable executors and a
//! stackful fiber bridge so direct-style code can suspend on a future
//! without blocking its OS thread.

mod cancel;
mod error;
mod executor;
mod fiber;
mod future;
mod outcome;
mod spawn;

pub use cancel::CancellationToken;
pub use error::Error;
pub use executor::{
    delay, inline_executor, make_timer_executor, make_worker_pool, Executor, ExecutorImpl,
    InlineExecutor, ThreadPool, TimerExecutor, TimerKey, Work,
};
pub use fiber::{await_on, run_in_fiber, yield_now};
pub use future::{make_promise_future, Future, Promise, WaitStatus};
pub use outcome::{BoxError, OperationCanceled, Outcome};
pub use spawn::spawn;

pub(crate) fn catch_enomem<C, T>(constructor: C) -> std::io::Result<T>
where
    C: FnOnce() -> T + std::panic::UnwindSafe,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(constructor))
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::OutOfMemory))
}
