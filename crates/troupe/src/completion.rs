//! # Completion Tokens
//!
//! A one-shot rendezvous between the command loop and a caller. The caller
//! keeps the [`CompletionToken`] and waits on it; the command loop receives
//! the [`Completer`] inside a command and calls [`Completer::complete`] once
//! the command has been processed.
//!
//! This is how the synchronous public API is built on top of the
//! single-threaded dispatcher, and it is public so embedders can build their
//! own request/response patterns the same way.

use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::SystemError;

/// Create a connected completer/token pair.
pub fn completion<T>() -> (Completer<T>, CompletionToken<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, CompletionToken { rx })
}

/// Sending half. Dropping it without completing wakes the waiter with
/// [`SystemError::Stopped`].
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    /// Hand `value` to the waiting side. Returns false if nobody is waiting
    /// anymore.
    pub fn complete(self, value: T) -> bool {
        match self.tx.send(value) {
            Ok(()) => true,
            Err(_) => {
                debug!("Completion token dropped before value was returned");
                false
            }
        }
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct CompletionToken<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> CompletionToken<T> {
    /// Block the current thread until the value arrives.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`CompletionToken::wait_async`] there.
    pub fn wait(self) -> Result<T, SystemError> {
        self.rx.blocking_recv().map_err(|_| SystemError::Stopped)
    }

    pub async fn wait_async(self) -> Result<T, SystemError> {
        self.rx.await.map_err(|_| SystemError::Stopped)
    }

    /// Take the value if it has already been returned.
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
