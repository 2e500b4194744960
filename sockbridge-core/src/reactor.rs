//! Reactor loop harness: one thread, one poller, one family.
//!
//! The harness owns the pieces every family shares (the mio `Poll`, the wake
//! token, the mutation-queue drain, and the stop protocol) and delegates the
//! family-specific work to a [`Drive`] implementation. Per iteration:
//!
//! 1. Block in the readiness poll until a handle is ready or the waker fires.
//! 2. Hand each readiness event to the driver.
//! 3. Drain the mutation queue and apply each message.
//! 4. Exit after the pass if a stop command was drained.
//!
//! A single handle's I/O failure is the driver's problem to isolate (convert
//! to an error event, tear the socket down); it must never propagate out of a
//! driver callback. Interrupted polls are retried.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Events, Poll, Token, Waker};
use tracing::{debug, error, trace};

use crate::mailbox::{mailbox, Command, Mailbox};

/// Token reserved for the mutation-queue waker.
///
/// Socket ids start at 1, so `Token(id)` never collides with it.
pub const WAKE_TOKEN: Token = Token(0);

/// Readiness events processed per poll pass.
const EVENTS_CAPACITY: usize = 256;

/// Family-specific half of a reactor.
///
/// The driver owns every native handle of its family and is only ever called
/// from the reactor thread.
pub trait Drive: Send + 'static {
    /// Mutation-request type drained from the family's mailbox.
    type Msg: Send + 'static;

    /// A registered handle became ready.
    fn ready(&mut self, registry: &mio::Registry, event: &mio::event::Event);

    /// Apply one drained mutation request.
    fn apply(&mut self, registry: &mio::Registry, msg: Self::Msg);

    /// The loop is exiting: close every handle and cancel queued work.
    fn shutdown(&mut self, registry: &mio::Registry);
}

/// Owner handle for a running reactor thread.
///
/// Dropping the handle stops the reactor (the pending stop command cancels
/// queued work via `Drive::shutdown`) and joins the thread, so teardown is
/// deterministic.
#[derive(Debug)]
pub struct ReactorHandle<M> {
    mailbox: Mailbox<M>,
    thread: Option<JoinHandle<()>>,
}

impl<M> ReactorHandle<M> {
    /// Clone the producer half of the mutation queue.
    pub fn mailbox(&self) -> Mailbox<M> {
        self.mailbox.clone()
    }

    /// Stop the reactor and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(thread) = self.thread.take() {
            // The push can only fail if the loop already exited.
            let _ = self.mailbox.stop();
            if thread.join().is_err() {
                error!("[Reactor] thread panicked during shutdown");
            }
        }
    }
}

impl<M> Drop for ReactorHandle<M> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Spawn a reactor thread running the given driver.
///
/// The thread blocks in the poller until woken by readiness or a mailbox
/// push, and exits once a stop command has been drained.
pub fn spawn<D: Drive>(name: &str, driver: D) -> io::Result<ReactorHandle<D::Msg>> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (mailbox, rx) = mailbox(waker);

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(poll, rx, driver))?;

    Ok(ReactorHandle {
        mailbox,
        thread: Some(thread),
    })
}

fn run<D: Drive>(mut poll: Poll, rx: flume::Receiver<Command<D::Msg>>, mut driver: D) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    debug!("[Reactor] loop started");

    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("[Reactor] poll interrupted, retrying");
                continue;
            }
            // A broken poller cannot be recovered from; bail out the same way
            // a stop command would.
            error!("[Reactor] poll failed: {err}");
            driver.shutdown(poll.registry());
            return;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            driver.ready(poll.registry(), event);
        }

        let mut stop = false;
        for cmd in rx.try_iter() {
            match cmd {
                Command::Msg(msg) => driver.apply(poll.registry(), msg),
                Command::Stop => stop = true,
            }
        }

        if stop {
            driver.shutdown(poll.registry());
            debug!("[Reactor] loop stopped");
            return;
        }
    }
}
