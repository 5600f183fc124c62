use super::{ExecutorImpl, Work};
use crate::Error;

/// Executor that runs its work in place, on the posting thread, before
/// `post` returns. Used as the cheap default so resolving a promise can run
/// light continuations without a thread hop.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl ExecutorImpl for InlineExecutor {
    fn post(&self, work: Work) -> Result<(), Error> {
        work.run();
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }
}
