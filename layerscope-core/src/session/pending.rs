//! Cancellable background tasks.

use std::future::Future;
use std::panic::resume_unwind;

use tokio::task::{JoinError, JoinHandle};

use crate::error::{Error, Result};

/// An asynchronous operation running on the runtime.
///
/// Completion is observed with [`wait`](Self::wait), which yields the
/// operation's own error on failure. [`cancel`](Self::cancel) stops the
/// task at its next suspension point; waiting on a cancelled task yields
/// [`Error::Cancelled`].
///
/// Must be created from within a Tokio runtime.
#[derive(Debug)]
pub struct Pending<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Cancel the operation. Has no effect once it has finished.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<T> {
        self.handle.await.map_err(join_error)?
    }
}

/// Map a join failure: panics resume on the caller, aborts become `Cancelled`.
pub(crate) fn join_error(err: JoinError) -> Error {
    if err.is_panic() {
        resume_unwind(err.into_panic());
    }
    Error::Cancelled
}
