//! Mutation queue: cross-thread requests into a reactor.
//!
//! Dispatch threads never touch a handle once it has been handed to the
//! reactor; instead they push a message here and wake the poller. The queue is
//! a single flume MPSC channel per family, so messages for the same socket are
//! drained in push order.

use std::sync::Arc;

use mio::Waker;

use crate::error::{BridgeError, Result};

/// Envelope drained by the reactor loop.
#[derive(Debug)]
pub enum Command<M> {
    /// Family-specific mutation request.
    Msg(M),
    /// Terminate the reactor loop after the current pass.
    Stop,
}

/// Producer half of a reactor's mutation queue.
///
/// Cheap to clone; every push wakes the poller so the reactor never has to
/// time out to notice new requests.
#[derive(Debug)]
pub struct Mailbox<M> {
    tx: flume::Sender<Command<M>>,
    waker: Arc<Waker>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl<M> Mailbox<M> {
    /// Push a mutation request and wake the reactor.
    ///
    /// Fails with `Shutdown` if the reactor has already exited.
    pub fn push(&self, msg: M) -> Result<()> {
        self.tx
            .send(Command::Msg(msg))
            .map_err(|_| BridgeError::Shutdown)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Request reactor termination.
    pub fn stop(&self) -> Result<()> {
        self.tx.send(Command::Stop).map_err(|_| BridgeError::Shutdown)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Create a mutation queue bound to the given poll waker.
///
/// The receiver goes to the reactor thread; the [`Mailbox`] is handed to
/// dispatch surfaces.
pub fn mailbox<M>(waker: Arc<Waker>) -> (Mailbox<M>, flume::Receiver<Command<M>>) {
    let (tx, rx) = flume::unbounded();
    (Mailbox { tx, waker }, rx)
}
