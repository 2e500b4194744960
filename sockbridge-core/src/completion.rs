//! Single-shot completion handles for deferred call results.
//!
//! A dispatch call that cannot finish in one non-blocking syscall (connect,
//! send that would block, close with queued work) is acknowledged as pending
//! and resolved later by the reactor through one of these.

use std::fmt;

use crate::error::{BridgeError, Result};

/// Caller half: await the deferred result of one dispatch call.
///
/// Dropping the handle is allowed; the reactor's resolution is then discarded.
pub type CompletionHandle<T> = flume::Receiver<Result<T>>;

/// Reactor half: resolve one deferred call exactly once.
pub struct Completion<T> {
    tx: flume::Sender<Result<T>>,
}

impl<T> Completion<T> {
    /// Resolve with a success value.
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    /// Resolve with an error.
    pub fn reject(self, err: BridgeError) {
        let _ = self.tx.send(Err(err));
    }

    /// Resolve with a prepared result.
    pub fn finish(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// Create a completion pair.
pub fn completion<T>() -> (Completion<T>, CompletionHandle<T>) {
    let (tx, rx) = flume::bounded(1);
    (Completion { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let (done, handle) = completion::<usize>();
        done.resolve(42);
        assert_eq!(handle.recv().unwrap().unwrap(), 42);
    }

    #[test]
    fn test_reject() {
        let (done, handle) = completion::<()>();
        done.reject(BridgeError::Cancelled);
        assert!(matches!(handle.recv().unwrap(), Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_dropped_handle_does_not_block_reactor() {
        let (done, handle) = completion::<usize>();
        drop(handle);
        // Resolution against a dropped handle is a no-op, not a panic.
        done.resolve(1);
    }
}
