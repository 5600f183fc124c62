use std::fmt;
use std::sync::Arc;

use super::SharedState;
use crate::cancel::CancellationToken;
use crate::outcome::{BoxError, Outcome};
use crate::Error;

/// Single-use write handle to a shared state.
///
/// Exactly one terminal call (`set_value`, `set_error`, `set_canceled`)
/// succeeds; the rest fail with `AlreadySatisfied`. Dropping the promise
/// while still pending resolves the paired future to a `BrokenPromise`
/// error so no waiter can hang.
pub struct Promise<T> {
    state: Arc<SharedState<T>>,
    token: Arc<CancellationToken>,
}

impl<T> Promise<T> {
    pub(crate) fn new(state: Arc<SharedState<T>>, token: Arc<CancellationToken>) -> Self {
        Self { state, token }
    }

    pub fn set_value(&self, value: T) -> Result<(), Error> {
        self.state.resolve(Outcome::Value(value))
    }

    pub fn set_error<E>(&self, error: E) -> Result<(), Error>
    where
        E: Into<BoxError>,
    {
        self.state.resolve(Outcome::Error(error.into()))
    }

    pub fn set_canceled(&self) -> Result<(), Error> {
        self.state.resolve(Outcome::Canceled)
    }

    /// The chain token. Producers register their cancellation behavior
    /// here, e.g. a callback that resolves this promise as canceled.
    pub fn cancellation_token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    pub(crate) fn complete(&self, outcome: Outcome<T>) -> Result<(), Error> {
        self.state.resolve(outcome)
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.state.is_resolved() {
            let _ = self.state.resolve_broken();
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
