use std::fmt;
use std::sync::Mutex;

type CancelCallback = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation flag shared by every future derived from a
/// common chain root.
///
/// Cancellation is advisory: requesting it fires the registered callbacks
/// but does not by itself resolve any shared state. A producer that wants
/// its future to become `Canceled` registers a callback doing so.
pub struct CancellationToken {
    inner: Mutex<TokenInner>,
}

struct TokenInner {
    requested: bool,
    callbacks: Vec<CancelCallback>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TokenInner {
                requested: false,
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.lock().expect("Unrecoverable error").requested
    }

    /// Register `callback` to run when cancellation is requested.
    ///
    /// Callbacks run in registration order, each at most once. If the flag
    /// is already set the callback runs immediately on the calling thread,
    /// so a late registration cannot miss the cancellation.
    pub fn push_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callback: CancelCallback = Box::new(callback);
        let run_now = {
            let mut inner = self.inner.lock().expect("Unrecoverable error");
            if inner.requested {
                Some(callback)
            } else {
                inner.callbacks.push(callback);
                None
            }
        };
        if let Some(callback) = run_now {
            callback();
        }
    }

    /// Set the flag and fire every registered callback, outside the lock.
    /// Requesting twice is a no-op, the flag never reverts.
    pub fn request_cancel(&self) {
        let fired = {
            let mut inner = self.inner.lock().expect("Unrecoverable error");
            if inner.requested {
                Vec::new()
            } else {
                inner.requested = true;
                std::mem::take(&mut inner.callbacks)
            }
        };
        for callback in fired {
            callback();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("Unrecoverable error");
        f.debug_struct("CancellationToken")
            .field("requested", &inner.requested)
            .field("callbacks", &inner.callbacks.len())
            .finish_non_exhaustive()
    }
}
