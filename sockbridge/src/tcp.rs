//! Stream-client socket family.
//!
//! `TcpSockets` is the dispatch surface: thin, synchronous, callable from any
//! thread. `TcpDriver` is the family's reactor half and the only code that
//! ever touches a stream once it has been handed off through the mailbox.
//!
//! Connect watching follows the classic non-blocking recipe: register the
//! connecting stream for writability, then probe `take_error` / `peer_addr`
//! when the writable edge fires. Reads and pending-send drains run until
//! `WouldBlock` because the poller is edge-triggered, in `buffer_size`-bounded
//! chunks with the paused flag re-checked between chunks.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use sockbridge_core::completion::{completion, Completion, CompletionHandle};
use sockbridge_core::config::{SocketConfig, SocketInfo};
use sockbridge_core::error::{codes, io_result_code, BridgeError, Result};
use sockbridge_core::events::EventBinding;
use sockbridge_core::mailbox::Mailbox;
use sockbridge_core::reactor::{self, Drive, ReactorHandle};
use sockbridge_core::registry::{IdAllocator, SocketId, SocketRegistry, SocketShared, SocketStatus};

use crate::addr::resolve;
use crate::tcp_server::AcceptSink;

/// Asynchronous events emitted by the stream-client family.
#[derive(Debug, Clone)]
pub enum TcpEvent {
    /// Data arrived on a connected socket.
    Receive { socket_id: SocketId, data: Bytes },
    /// A read failed; the socket is torn down after this event.
    ReceiveError { socket_id: SocketId, result_code: i32 },
    /// The socket was destroyed after a fatal I/O error.
    Closed { socket_id: SocketId },
}

/// Mutation requests handled by the family's reactor.
#[derive(Debug)]
pub(crate) enum TcpMsg {
    /// Hand off a connecting stream and watch for connect completion.
    Connect {
        id: SocketId,
        stream: TcpStream,
        done: Completion<()>,
    },
    /// Hand off an already-connected stream accepted by a server socket.
    Adopt { id: SocketId, stream: TcpStream },
    /// Queue (or immediately attempt) an outbound write.
    Send {
        id: SocketId,
        data: Bytes,
        done: Completion<usize>,
    },
    /// The paused flag changed; recompute interest.
    SetPaused { id: SocketId },
    /// Drop the connection but keep the socket for a later reconnect.
    Disconnect { id: SocketId, done: Completion<()> },
    /// Destroy the socket. The completion is absent for internal teardowns.
    Close {
        id: SocketId,
        done: Option<Completion<()>>,
    },
}

/// Stream-client dispatch surface.
///
/// Safe to call from any number of threads; the reactor thread is started
/// lazily by `register_receive_events` or the first operation that needs it.
pub struct TcpSockets {
    registry: SocketRegistry,
    events: EventBinding<TcpEvent>,
    reactor: Mutex<Option<ReactorHandle<TcpMsg>>>,
}

impl TcpSockets {
    /// Create a standalone family instance with its own id space.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(IdAllocator::new()))
    }

    /// Create a family instance drawing ids from a shared allocator.
    pub(crate) fn with_allocator(ids: Arc<IdAllocator>) -> Self {
        Self {
            registry: SocketRegistry::new(ids),
            events: EventBinding::new(),
            reactor: Mutex::new(None),
        }
    }

    /// Allocate a socket id and insert its record. Never touches the reactor.
    pub fn create(&self, config: SocketConfig) -> SocketId {
        let id = self.registry.allocate();
        self.registry.insert(Arc::new(SocketShared::new(id, &config)));
        debug!("[TcpSockets] created socket {id}");
        id
    }

    /// Replace a socket's configuration in place.
    ///
    /// A changed `buffer_size` takes effect on the next read.
    pub fn update(&self, id: SocketId, config: &SocketConfig) -> Result<()> {
        self.registry.get(id)?.apply_config(config);
        Ok(())
    }

    /// Pause or resume delivery of receive events.
    pub fn set_paused(&self, id: SocketId, paused: bool) -> Result<()> {
        let shared = self.registry.get(id)?;
        shared.set_paused(paused);
        // If the socket is reactor-managed this re-arms read interest; for an
        // un-managed socket the flag alone is enough until hand-off.
        if let Some(mailbox) = self.mailbox() {
            let _ = mailbox.push(TcpMsg::SetPaused { id });
        }
        Ok(())
    }

    /// Start a non-blocking connect to `address:port`.
    ///
    /// The returned handle resolves once the OS reports the connect finished,
    /// successfully or not. Connecting a closed-then-disconnected socket again
    /// reuses its id with a fresh stream.
    pub fn connect(&self, id: SocketId, address: &str, port: u16) -> Result<CompletionHandle<()>> {
        let shared = self.registry.get(id)?;
        if shared.status().connected {
            return Err(BridgeError::operation_failed("socket is already connected"));
        }
        let addr = resolve(address, port)?;
        let stream = TcpStream::connect(addr)?;
        let (done, handle) = completion();
        self.ensure_reactor()?.push(TcpMsg::Connect { id, stream, done })?;
        Ok(handle)
    }

    /// Send bytes on a connected socket.
    ///
    /// The handle resolves with the total number of bytes written (possibly
    /// after one immediate partial write plus reactor drains) or the error.
    pub fn send(&self, id: SocketId, data: impl Into<Bytes>) -> Result<CompletionHandle<usize>> {
        let shared = self.registry.get(id)?;
        if !shared.status().connected {
            return Err(BridgeError::NotConnected);
        }
        let (done, handle) = completion();
        self.ensure_reactor()?.push(TcpMsg::Send {
            id,
            data: data.into(),
            done,
        })?;
        Ok(handle)
    }

    /// Drop the connection, completing queued sends with `Cancelled`.
    ///
    /// The socket itself survives and may connect again.
    pub fn disconnect(&self, id: SocketId) -> Result<CompletionHandle<()>> {
        let shared = self.registry.get(id)?;
        let (done, handle) = completion();
        match self.mailbox() {
            Some(mailbox) => mailbox.push(TcpMsg::Disconnect { id, done })?,
            None => {
                // Nothing was ever handed off.
                shared.set_status(|s| *s = SocketStatus::default());
                done.resolve(());
            }
        }
        Ok(handle)
    }

    /// Destroy the socket: cancel queued sends, close the stream, remove the
    /// registry entry.
    pub fn close(&self, id: SocketId) -> Result<CompletionHandle<()>> {
        self.registry.get(id)?;
        let (done, handle) = completion();
        match self.mailbox() {
            Some(mailbox) => mailbox.push(TcpMsg::Close {
                id,
                done: Some(done),
            })?,
            None => {
                self.registry.remove(id);
                done.resolve(());
            }
        }
        Ok(handle)
    }

    /// Snapshot one socket.
    pub fn get_info(&self, id: SocketId) -> Result<SocketInfo> {
        Ok(self.registry.get(id)?.info())
    }

    /// Snapshot every live socket, ascending by id.
    pub fn get_sockets(&self) -> Vec<SocketInfo> {
        self.registry.infos()
    }

    /// Bind the event channel and start the reactor if needed.
    ///
    /// Rebinding replaces the previous channel.
    pub fn register_receive_events(&self) -> Result<flume::Receiver<TcpEvent>> {
        self.ensure_reactor()?;
        Ok(self.events.bind())
    }

    /// Stop the reactor thread deterministically.
    ///
    /// Queued work is cancelled; live streams are closed. Also runs on drop.
    pub fn shutdown(&self) {
        let handle = self.reactor.lock().take();
        drop(handle);
    }

    fn mailbox(&self) -> Option<Mailbox<TcpMsg>> {
        self.reactor.lock().as_ref().map(ReactorHandle::mailbox)
    }

    fn ensure_reactor(&self) -> Result<Mailbox<TcpMsg>> {
        let mut guard = self.reactor.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.mailbox());
        }
        let driver = TcpDriver {
            registry: self.registry.clone(),
            events: self.events.clone(),
            entities: HashMap::new(),
        };
        let handle = reactor::spawn("sockbridge-tcp", driver)?;
        let mailbox = handle.mailbox();
        *guard = Some(handle);
        Ok(mailbox)
    }
}

impl Default for TcpSockets {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptSink for TcpSockets {
    fn adopt(&self, stream: TcpStream) -> Result<SocketId> {
        let id = self.registry.allocate();
        let shared = Arc::new(SocketShared::new_paused(id, &SocketConfig::default()));
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        shared.set_status(|s| {
            s.connected = true;
            s.local_addr = local;
            s.peer_addr = peer;
        });
        self.registry.insert(shared);
        self.ensure_reactor()?.push(TcpMsg::Adopt { id, stream })?;
        trace!("[TcpSockets] adopted accepted connection as socket {id}");
        Ok(id)
    }

    fn abandon(&self, id: SocketId) {
        match self.mailbox() {
            Some(mailbox) => {
                let _ = mailbox.push(TcpMsg::Close { id, done: None });
            }
            None => {
                self.registry.remove(id);
            }
        }
    }
}

/// Connection progress of a reactor-managed stream.
#[derive(Debug)]
enum Phase {
    /// Waiting for the non-blocking connect to finish.
    Connecting { done: Option<Completion<()>> },
    /// Fully established.
    Connected,
}

#[derive(Debug)]
struct SendOp {
    data: Bytes,
    written: usize,
    done: Completion<usize>,
}

/// Reactor-owned half of one stream socket.
#[derive(Debug)]
struct Entity {
    shared: Arc<SocketShared>,
    stream: TcpStream,
    phase: Phase,
    pending: VecDeque<SendOp>,
    interest: Option<Interest>,
}

struct TcpDriver {
    registry: SocketRegistry,
    events: EventBinding<TcpEvent>,
    entities: HashMap<SocketId, Entity>,
}

impl Drive for TcpDriver {
    type Msg = TcpMsg;

    fn ready(&mut self, registry: &mio::Registry, event: &mio::event::Event) {
        let id = event.token().0 as SocketId;
        let connecting = match self.entities.get(&id) {
            Some(entity) => matches!(entity.phase, Phase::Connecting { .. }),
            // Stale readiness for a socket torn down earlier in this pass.
            None => return,
        };

        if connecting {
            if event.is_writable() || event.is_error() {
                self.finish_connect(registry, id);
            }
            return;
        }

        if event.is_readable() {
            self.read_ready(registry, id);
        }
        if event.is_writable() {
            self.write_ready(registry, id);
        }
        self.sync_interest(registry, id);
    }

    fn apply(&mut self, registry: &mio::Registry, msg: TcpMsg) {
        match msg {
            TcpMsg::Connect { id, stream, done } => self.apply_connect(registry, id, stream, done),
            TcpMsg::Adopt { id, stream } => self.apply_adopt(registry, id, stream),
            TcpMsg::Send { id, data, done } => self.apply_send(registry, id, data, done),
            TcpMsg::SetPaused { id } => self.sync_interest(registry, id),
            TcpMsg::Disconnect { id, done } => {
                self.teardown_entity(registry, id);
                done.resolve(());
            }
            TcpMsg::Close { id, done } => {
                self.teardown_entity(registry, id);
                self.registry.remove(id);
                if let Some(done) = done {
                    done.resolve(());
                }
            }
        }
    }

    fn shutdown(&mut self, registry: &mio::Registry) {
        let ids: Vec<SocketId> = self.entities.keys().copied().collect();
        for id in ids {
            self.teardown_entity(registry, id);
        }
    }
}

impl TcpDriver {
    fn apply_connect(
        &mut self,
        registry: &mio::Registry,
        id: SocketId,
        mut stream: TcpStream,
        done: Completion<()>,
    ) {
        let Some(shared) = self.registry.lookup(id) else {
            // Closed between dispatch and hand-off.
            done.reject(BridgeError::unknown_socket(id));
            return;
        };
        if self.entities.contains_key(&id) {
            done.reject(BridgeError::operation_failed(
                "socket is already connecting or connected",
            ));
            return;
        }
        if let Err(err) = registry.register(&mut stream, Token(id as usize), Interest::WRITABLE) {
            done.reject(err.into());
            return;
        }
        trace!("[TcpReactor] watching connect for socket {id}");
        self.entities.insert(
            id,
            Entity {
                shared,
                stream,
                phase: Phase::Connecting { done: Some(done) },
                pending: VecDeque::new(),
                interest: Some(Interest::WRITABLE),
            },
        );
    }

    fn apply_adopt(&mut self, registry: &mio::Registry, id: SocketId, stream: TcpStream) {
        let Some(shared) = self.registry.lookup(id) else {
            // Abandoned before the reactor saw it; closing the stream is all
            // that is left to do.
            return;
        };
        self.entities.insert(
            id,
            Entity {
                shared,
                stream,
                phase: Phase::Connected,
                pending: VecDeque::new(),
                interest: None,
            },
        );
        // Accepted sockets start paused, which leaves the interest set empty
        // until the embedder resumes them.
        self.sync_interest(registry, id);
    }

    fn apply_send(
        &mut self,
        registry: &mio::Registry,
        id: SocketId,
        data: Bytes,
        done: Completion<usize>,
    ) {
        let Some(entity) = self.entities.get_mut(&id) else {
            let err = if self.registry.contains(id) {
                BridgeError::NotConnected
            } else {
                BridgeError::unknown_socket(id)
            };
            done.reject(err);
            return;
        };
        if matches!(entity.phase, Phase::Connecting { .. }) {
            done.reject(BridgeError::NotConnected);
            return;
        }

        if entity.pending.is_empty() {
            // First write attempt happens inline; only the remainder waits for
            // a writable edge.
            let mut written = 0;
            loop {
                match entity.stream.write(&data[written..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        written += n;
                        if written == data.len() {
                            trace!("[TcpReactor] socket {id} wrote {written} bytes inline");
                            done.resolve(written);
                            return;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        done.reject(err.into());
                        self.destroy(registry, id);
                        return;
                    }
                }
            }
            entity.pending.push_back(SendOp {
                data,
                written,
                done,
            });
        } else {
            entity.pending.push_back(SendOp {
                data,
                written: 0,
                done,
            });
        }
        self.sync_interest(registry, id);
    }

    fn finish_connect(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };

        let outcome = match entity.stream.take_error() {
            Ok(Some(err)) => Err(err),
            Ok(None) => match entity.stream.peer_addr() {
                Ok(peer) => Ok(peer),
                // Spurious writable edge; the connect is still in flight.
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(peer) => {
                let local = entity.stream.local_addr().ok();
                let _ = entity.stream.set_nodelay(true);
                entity.shared.set_status(|s| {
                    s.connected = true;
                    s.local_addr = local;
                    s.peer_addr = Some(peer);
                });
                let done = match &mut entity.phase {
                    Phase::Connecting { done } => done.take(),
                    Phase::Connected => None,
                };
                entity.phase = Phase::Connected;
                debug!("[TcpReactor] socket {id} connected to {peer}");
                if let Some(done) = done {
                    done.resolve(());
                }
                self.sync_interest(registry, id);
            }
            Err(err) => {
                debug!("[TcpReactor] socket {id} connect failed: {err}");
                // The registry entry stays until an explicit close; only the
                // dead stream goes away.
                let Some(mut entity) = self.entities.remove(&id) else {
                    return;
                };
                let _ = registry.deregister(&mut entity.stream);
                entity.shared.set_status(|s| *s = SocketStatus::default());
                if let Phase::Connecting { done } = &mut entity.phase {
                    if let Some(done) = done.take() {
                        done.reject(err.into());
                    }
                }
                for op in entity.pending.drain(..) {
                    op.done.reject(BridgeError::Cancelled);
                }
            }
        }
    }

    fn read_ready(&mut self, registry: &mio::Registry, id: SocketId) {
        loop {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            if entity.shared.is_paused() {
                return;
            }
            let size = entity.shared.buffer_size().max(1);
            let mut buf = vec![0u8; size];
            match entity.stream.read(&mut buf) {
                Ok(0) => {
                    self.events.emit(TcpEvent::ReceiveError {
                        socket_id: id,
                        result_code: codes::CONNECTION_CLOSED,
                    });
                    self.destroy(registry, id);
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    trace!("[TcpReactor] socket {id} received {n} bytes");
                    self.events.emit(TcpEvent::Receive {
                        socket_id: id,
                        data: Bytes::from(buf),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("[TcpReactor] socket {id} read failed: {err}");
                    self.events.emit(TcpEvent::ReceiveError {
                        socket_id: id,
                        result_code: io_result_code(&err),
                    });
                    self.destroy(registry, id);
                    return;
                }
            }
        }
    }

    fn write_ready(&mut self, registry: &mio::Registry, id: SocketId) {
        loop {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            let Some(op) = entity.pending.front_mut() else {
                return;
            };
            match entity.stream.write(&op.data[op.written..]) {
                Ok(0) => return,
                Ok(n) => {
                    op.written += n;
                    if op.written == op.data.len() {
                        if let Some(op) = entity.pending.pop_front() {
                            trace!("[TcpReactor] socket {id} drained {} bytes", op.data.len());
                            op.done.resolve(op.data.len());
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("[TcpReactor] socket {id} write failed: {err}");
                    if let Some(op) = entity.pending.pop_front() {
                        op.done.reject(err.into());
                    }
                    self.destroy(registry, id);
                    return;
                }
            }
        }
    }

    /// Remove the entity, close the stream, cancel queued work. The registry
    /// entry is untouched (used by disconnect and by shutdown).
    fn teardown_entity(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(mut entity) = self.entities.remove(&id) else {
            return;
        };
        if entity.interest.is_some() {
            let _ = registry.deregister(&mut entity.stream);
        }
        if let Phase::Connecting { done } = &mut entity.phase {
            if let Some(done) = done.take() {
                done.reject(BridgeError::Cancelled);
            }
        }
        for op in entity.pending.drain(..) {
            op.done.reject(BridgeError::Cancelled);
        }
        entity.shared.set_status(|s| *s = SocketStatus::default());
        trace!("[TcpReactor] socket {id} torn down");
    }

    /// Fatal-error teardown: also removes the registry entry and announces
    /// the removal on the event channel.
    fn destroy(&mut self, registry: &mio::Registry, id: SocketId) {
        self.teardown_entity(registry, id);
        self.registry.remove(id);
        self.events.emit(TcpEvent::Closed { socket_id: id });
    }

    fn sync_interest(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        let want = desired_interest(entity);
        if want == entity.interest {
            return;
        }
        let result = match (entity.interest, want) {
            (None, Some(interest)) => {
                registry.register(&mut entity.stream, Token(id as usize), interest)
            }
            (Some(_), Some(interest)) => {
                registry.reregister(&mut entity.stream, Token(id as usize), interest)
            }
            (Some(_), None) => registry.deregister(&mut entity.stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => entity.interest = want,
            Err(err) => warn!("[TcpReactor] socket {id} interest update failed: {err}"),
        }
    }
}

/// Minimal interest required by the entity's phase, paused flag, and
/// pending-send occupancy.
fn desired_interest(entity: &Entity) -> Option<Interest> {
    match entity.phase {
        Phase::Connecting { .. } => Some(Interest::WRITABLE),
        Phase::Connected => {
            let mut want = None;
            if !entity.shared.is_paused() {
                want = Some(Interest::READABLE);
            }
            if !entity.pending.is_empty() {
                want = Some(match want {
                    Some(interest) => interest | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }
            want
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_monotonic_ids() {
        let sockets = TcpSockets::new();
        let a = sockets.create(SocketConfig::default());
        let b = sockets.create(SocketConfig::default());
        assert!(b > a);
    }

    #[test]
    fn test_unknown_id_is_invalid_argument() {
        let sockets = TcpSockets::new();
        assert!(matches!(
            sockets.get_info(99),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            sockets.send(99, Bytes::from_static(b"x")),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_send_before_connect_is_not_connected() {
        let sockets = TcpSockets::new();
        let id = sockets.create(SocketConfig::default());
        assert!(matches!(
            sockets.send(id, Bytes::from_static(b"x")),
            Err(BridgeError::NotConnected)
        ));
    }

    #[test]
    fn test_close_without_reactor_removes_entry() {
        let sockets = TcpSockets::new();
        let id = sockets.create(SocketConfig::default());
        let handle = sockets.close(id).unwrap();
        assert!(handle.recv().unwrap().is_ok());
        assert!(sockets.get_info(id).is_err());
    }

    #[test]
    fn test_update_changes_info() {
        let sockets = TcpSockets::new();
        let id = sockets.create(SocketConfig::default());
        sockets
            .update(id, &SocketConfig::new().with_name("renamed").with_buffer_size(512))
            .unwrap();
        let info = sockets.get_info(id).unwrap();
        assert_eq!(info.name, "renamed");
        assert_eq!(info.buffer_size, 512);
    }
}
