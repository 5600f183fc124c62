use std::any::Any;
use std::fmt;

/// Contract violations reported by the engine itself, as opposed to the
/// caller-defined payloads carried by `Outcome::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The shared state already holds a terminal outcome.
    AlreadySatisfied,
    /// The promise side was dropped while the state was still pending.
    BrokenPromise,
    /// `post` was called on an executor after `shutdown`.
    ExecutorStopped,
    /// A second continuation was attached to one shared state.
    DoubleAttach,
    /// A task or continuation panicked; the payload text is preserved.
    Panicked(String),
}

impl Error {
    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_owned());
        Error::Panicked(message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadySatisfied => f.write_str("shared state is already satisfied"),
            Error::BrokenPromise => f.write_str("promise was dropped before being satisfied"),
            Error::ExecutorStopped => f.write_str("executor is stopped"),
            Error::DoubleAttach => f.write_str("a continuation is already attached"),
            Error::Panicked(message) => write!(f, "task panicked: {message}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_panicked_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(Error::panicked(payload), Error::Panicked("boom".to_owned()));

        let payload: Box<dyn Any + Send> = Box::new("boom".to_owned());
        assert_eq!(Error::panicked(payload), Error::Panicked("boom".to_owned()));

        let payload: Box<dyn Any + Send> = Box::new(42usize);
        assert_eq!(
            Error::panicked(payload),
            Error::Panicked("opaque panic payload".to_owned())
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::ExecutorStopped.to_string(), "executor is stopped");
        assert_eq!(
            Error::Panicked("x".to_owned()).to_string(),
            "task panicked: x"
        );
    }
}
