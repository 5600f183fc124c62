use enum_dispatch::enum_dispatch;
use std::fmt;

use crate::Error;

mod inline;
pub use inline::*;
mod pool;
pub use pool::*;
mod timer;
pub use timer::*;

/// A unit of work: a move-only, type-erased callable plus a static name
/// used for trace logging.
pub struct Work {
    name: &'static str,
    f: Box<dyn FnOnce() + Send>,
}

impl Work {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::named("task", f)
    }

    pub fn named<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name,
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run(self) {
        (self.f)()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Scheduling capability accepted wherever a continuation needs a place to
/// run.
#[enum_dispatch]
pub trait ExecutorImpl {
    /// Schedule `work`. Whether it runs before `post` returns depends on
    /// the implementation; `Err(ExecutorStopped)` after shutdown.
    fn post(&self, work: Work) -> Result<(), Error>;

    fn is_running(&self) -> bool;
}

/// Cheap clonable handle over the executor implementations.
#[enum_dispatch(ExecutorImpl)]
#[derive(Clone, Debug)]
pub enum Executor {
    Inline(InlineExecutor),
    Pool(ThreadPool),
    Timer(TimerExecutor),
}

/// The run-in-place executor. Zero-sized, so this is as good as a shared
/// singleton.
pub fn inline_executor() -> Executor {
    Executor::Inline(InlineExecutor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_inline_executor_runs_in_place() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let executor = inline_executor();
        {
            let ran = ran.clone();
            executor
                .post(Work::new(move || ran.store(true, Ordering::SeqCst)))
                .unwrap();
        }
        // The inline executor returns only after the work completed.
        assert!(ran.load(Ordering::SeqCst));
        assert!(executor.is_running());
    }

    #[test]
    fn test_work_debug_shows_name() {
        let work = Work::named("noop", || {});
        assert!(format!("{work:?}").contains("noop"));
        work.run();
    }
}
