use std::fmt;

/// Type-erased error payload carried by [`Outcome::Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal result of a promise/future pair.
///
/// `Canceled` is its own terminal state, not an error variant: a chain that
/// was canceled and a chain that failed are distinguishable all the way to
/// the final consumer.
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Error(BoxError),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Collapse to a `Result`, turning `Canceled` into an
    /// [`OperationCanceled`] error payload.
    pub fn into_result(self) -> Result<T, BoxError> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(error) => Err(error),
            Outcome::Canceled => Err(OperationCanceled.into()),
        }
    }
}

/// Error used when a cancellation outcome has to travel through an error
/// channel, e.g. the `Result` returned by a fiber body. It is recognized on
/// the way back and turned into [`Outcome::Canceled`] again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationCanceled;

impl fmt::Display for OperationCanceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was canceled")
    }
}

impl std::error::Error for OperationCanceled {}
