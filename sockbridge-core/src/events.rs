//! Event-channel binding for asynchronous emissions.
//!
//! Each family delivers its asynchronous events (`receive`, `accept`, error
//! events) on a single bound channel. Binding again replaces the previous
//! channel (the old receiver disconnects), so there is at most one active
//! binding per family instance.

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared slot holding a family's active event channel, if any.
///
/// Cloning shares the slot: the dispatch surface binds, the reactor driver
/// emits.
#[derive(Debug)]
pub struct EventBinding<E> {
    slot: Arc<Mutex<Option<flume::Sender<E>>>>,
}

impl<E> Clone for EventBinding<E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<E> Default for EventBinding<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBinding<E> {
    /// Create an unbound slot.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Bind a fresh channel, replacing any previous binding.
    pub fn bind(&self) -> flume::Receiver<E> {
        let (tx, rx) = flume::unbounded();
        *self.slot.lock() = Some(tx);
        rx
    }

    /// Whether a channel is currently bound.
    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Emit an event on the bound channel.
    ///
    /// Returns `false` when no channel is bound or the receiver is gone;
    /// emission is fire-and-forget either way.
    pub fn emit(&self, event: E) -> bool {
        match &*self.slot.lock() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the active binding, if any.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}
