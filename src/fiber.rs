use generator::{Generator, Gn};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::cancel::CancellationToken;
use crate::executor::{Executor, ExecutorImpl, Work};
use crate::future::make_promise_future;
use crate::outcome::{BoxError, OperationCanceled, Outcome};
use crate::{Error, Future};

const FIBER_STACK_SIZE: usize = 0x10000;

type FiberGen = Generator<'static, (), FiberOp>;

enum FiberOp {
    /// The fiber suspended on a future; the boxed registration runs in
    /// thread context, after the switch back, so the continuation cannot
    /// try to resume a fiber that has not fully suspended yet.
    Await(Box<dyn FnOnce() + Send>),
    Complete,
}

struct FiberShared {
    gen: Mutex<Option<FiberGen>>,
    token: Arc<CancellationToken>,
    executor: Executor,
}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<FiberShared>>> = const { RefCell::new(None) };
}

/// Start `f` on its own stack, scheduled on `executor`.
///
/// Inside `f`, [`await_on`] suspends the fiber instead of blocking the OS
/// thread. The returned future resolves from `f`'s result: `Ok` becomes a
/// value, an [`OperationCanceled`] error becomes `Canceled`, any other
/// error is carried as-is and a panic is converted to an error outcome.
pub fn run_in_fiber<T, F>(executor: &Executor, f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    let (promise, future) = make_promise_future::<T>();
    let fiber = Arc::new(FiberShared {
        gen: Mutex::new(None),
        token: future.cancellation_token().clone(),
        executor: executor.clone(),
    });
    let gen = Gn::<()>::new_opt(FIBER_STACK_SIZE, move || {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => {
                let _ = promise.set_value(value);
            }
            Ok(Err(err)) if err.is::<OperationCanceled>() => {
                let _ = promise.set_canceled();
            }
            Ok(Err(err)) => {
                let _ = promise.set_error(err);
            }
            Err(payload) => {
                let _ = promise.set_error(Error::panicked(payload));
            }
        }
        FiberOp::Complete
    });
    *fiber.gen.lock().expect("Unrecoverable error") = Some(gen);
    if let Err(err) = executor.post(Work::named("fiber", move || drive(fiber))) {
        // The dropped generator owns the promise, the future resolves as a
        // broken promise.
        log::warn!("fiber could not be started: {err}");
    }
    future
}

/// Suspend the current fiber until `future` resolves.
///
/// Only callable from inside [`run_in_fiber`]; anywhere else this is a
/// programming error and panics. An already-resolved future returns
/// without suspending. Cancellation of the fiber's chain while suspended
/// is forwarded to the awaited future and surfaces here, like the awaited
/// future's own cancellation, as an [`OperationCanceled`] error.
pub fn await_on<T>(future: Future<T>) -> Result<T, BoxError>
where
    T: Send + 'static,
{
    let fiber = current_fiber("await_on");
    if future.is_ready() {
        return finish_await(&fiber, future.get());
    }
    let slot: Arc<Mutex<Option<Outcome<T>>>> = Arc::new(Mutex::new(None));
    let register: Box<dyn FnOnce() + Send> = {
        let slot = slot.clone();
        let fiber = fiber.clone();
        Box::new(move || {
            fiber.token.push_callback(future.canceler());
            let executor = fiber.executor.clone();
            let resumed = fiber.clone();
            future.attach_outcome(&executor, "fiber-resume", move |outcome| {
                *slot.lock().expect("Unrecoverable error") = Some(outcome);
                drive(resumed);
            });
        })
    };
    generator::yield_with(FiberOp::Await(register));
    let outcome = slot
        .lock()
        .expect("Unrecoverable error")
        .take()
        .expect("fiber resumed without an outcome");
    finish_await(&fiber, outcome)
}

/// Put the fiber back at the tail of its executor's queue so other work
/// can run. A cancellation point.
pub fn yield_now() -> Result<(), BoxError> {
    let fiber = current_fiber("yield_now");
    let register: Box<dyn FnOnce() + Send> = {
        let fiber = fiber.clone();
        Box::new(move || {
            let executor = fiber.executor.clone();
            let resumed = fiber.clone();
            if let Err(err) = executor.post(Work::named("fiber-yield", move || drive(resumed))) {
                log::warn!("fiber could not be rescheduled: {err}");
            }
        })
    };
    generator::yield_with(FiberOp::Await(register));
    if fiber.token.is_cancel_requested() {
        return Err(OperationCanceled.into());
    }
    Ok(())
}

fn current_fiber(op: &str) -> Arc<FiberShared> {
    CURRENT_FIBER
        .with(|current| current.borrow().clone())
        .unwrap_or_else(|| panic!("{op} called outside of a fiber"))
}

fn finish_await<T>(fiber: &FiberShared, outcome: Outcome<T>) -> Result<T, BoxError> {
    if fiber.token.is_cancel_requested() {
        return Err(OperationCanceled.into());
    }
    match outcome {
        Outcome::Value(value) => Ok(value),
        Outcome::Error(error) => Err(error),
        Outcome::Canceled => Err(OperationCanceled.into()),
    }
}

/// Resume the fiber once, in thread context, then act on what it yielded.
fn drive(fiber: Arc<FiberShared>) {
    let mut gen = fiber
        .gen
        .lock()
        .expect("Unrecoverable error")
        .take()
        .expect("fiber is already running");
    let previous = CURRENT_FIBER.with(|current| current.replace(Some(fiber.clone())));
    let op = gen.resume();
    CURRENT_FIBER.with(|current| {
        *current.borrow_mut() = previous;
    });
    match op {
        Some(FiberOp::Await(register)) => {
            // Park the generator first; the registration may fire the
            // continuation immediately.
            *fiber.gen.lock().expect("Unrecoverable error") = Some(gen);
            register();
        }
        Some(FiberOp::Complete) | None => drop(gen),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::{delay, make_timer_executor, make_worker_pool};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_round_trip_on_ready_future() {
        let pool = make_worker_pool(1).unwrap();
        let future = run_in_fiber(&pool.clone().into(), || await_on(Future::resolved(42)));
        assert_eq!(future.get().value(), Some(42));
        pool.shutdown();
    }

    #[test]
    fn test_suspension_does_not_block_the_worker() {
        let pool = make_worker_pool(1).unwrap();
        let executor: Executor = pool.clone().into();
        let (promise, awaited) = make_promise_future::<i32>();

        let future = run_in_fiber(&executor, move || {
            let value = await_on(awaited)?;
            Ok(value + 1)
        });
        // The fiber holds the only worker until it suspends; this work can
        // only run, and resolve the awaited future, once it has.
        pool.post(Work::new(move || {
            promise.set_value(41).unwrap();
        }))
        .unwrap();

        assert_eq!(future.get().value(), Some(42));
        pool.shutdown();
    }

    #[test]
    #[should_panic(expected = "outside of a fiber")]
    fn test_await_outside_fiber_panics() {
        let _ = await_on(Future::resolved(1));
    }

    #[test]
    fn test_await_propagates_errors() {
        let pool = make_worker_pool(1).unwrap();
        let future = run_in_fiber(&pool.clone().into(), || {
            let value: i32 = await_on(Future::from_error(Error::Panicked("inner".to_owned())))?;
            Ok(value)
        });
        assert!(future.get().is_error());
        pool.shutdown();
    }

    #[test]
    fn test_cancel_while_suspended() {
        let pool = make_worker_pool(1).unwrap();
        let timer = make_timer_executor().unwrap();
        let executor: Executor = pool.clone().into();

        let future = {
            let timer = timer.clone();
            let executor = executor.clone();
            run_in_fiber(&executor.clone(), move || {
                await_on(delay(&timer, &executor, Duration::from_secs(3600)))?;
                Ok(1)
            })
        };
        // Give the fiber time to reach its suspension point.
        std::thread::sleep(Duration::from_millis(50));
        future.request_cancel();
        assert!(future.get().is_canceled());
        timer.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_yield_now_interleaves() {
        let pool = make_worker_pool(1).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

        // Hold the single worker until both the fiber and the marker work
        // are queued, so the fiber provably requeues behind the marker.
        pool.post(Work::new(move || {
            let _ = gate_rx.recv();
        }))
        .unwrap();
        let future = {
            let flag = flag.clone();
            run_in_fiber(&pool.clone().into(), move || {
                yield_now()?;
                Ok(flag.load(Ordering::SeqCst))
            })
        };
        {
            let flag = flag.clone();
            pool.post(Work::new(move || flag.store(true, Ordering::SeqCst)))
                .unwrap();
        }
        gate_tx.send(()).unwrap();
        assert_eq!(future.get().value(), Some(true));
        pool.shutdown();
    }

    #[test]
    fn test_fiber_panic_becomes_error() {
        let pool = make_worker_pool(1).unwrap();
        let future = run_in_fiber(&pool.clone().into(), || -> Result<i32, BoxError> {
            panic!("kaboom")
        });
        match future.get() {
            Outcome::Error(err) => {
                assert_eq!(
                    err.downcast_ref::<Error>(),
                    Some(&Error::Panicked("kaboom".to_owned()))
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        pool.shutdown();
    }

    #[test]
    fn test_nested_fibers() {
        let pool = make_worker_pool(2).unwrap();
        let executor: Executor = pool.clone().into();
        let future = {
            let executor = executor.clone();
            run_in_fiber(&executor.clone(), move || {
                let inner = run_in_fiber(&executor, || await_on(Future::resolved(20)));
                let value = await_on(inner)?;
                Ok(value + 22)
            })
        };
        assert_eq!(future.get().value(), Some(42));
        pool.shutdown();
    }
}
