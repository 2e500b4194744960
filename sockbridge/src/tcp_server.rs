//! Stream-server socket family.
//!
//! The server family is self-accepting: when a listener becomes acceptable
//! the reactor drains the OS backlog and hands every accepted stream to an
//! [`AcceptSink`] (normally the stream-client family), which adopts it as a
//! paused client socket. Delivery and acceptance are gated separately by the
//! server's paused flag:
//!
//! - while paused, acceptor interest is removed and connections stay queued
//!   in the OS backlog
//! - connections that were already accepted when the pause landed wait in an
//!   in-order queue and are announced when the server is resumed

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use sockbridge_core::completion::{completion, Completion, CompletionHandle};
use sockbridge_core::config::{SocketConfig, SocketInfo};
use sockbridge_core::error::{codes, io_result_code, BridgeError, Result};
use sockbridge_core::events::EventBinding;
use sockbridge_core::mailbox::Mailbox;
use sockbridge_core::reactor::{self, Drive, ReactorHandle};
use sockbridge_core::registry::{IdAllocator, SocketId, SocketRegistry, SocketShared, SocketStatus};

use crate::addr::resolve;

/// Listen backlog used when the caller does not specify one.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Receiver of accepted connections.
///
/// The stream-client family implements this; the seam exists so the server
/// driver can be exercised without a full client family behind it.
pub trait AcceptSink: Send + Sync + 'static {
    /// Take ownership of a freshly accepted stream and return the id of the
    /// client socket now wrapping it. Adopted sockets start paused.
    fn adopt(&self, stream: TcpStream) -> Result<SocketId>;

    /// Tear down an adopted socket whose accept event was never delivered.
    fn abandon(&self, id: SocketId);
}

/// Asynchronous events emitted by the stream-server family.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted and adopted as `client_socket_id`.
    Accept {
        socket_id: SocketId,
        client_socket_id: SocketId,
    },
    /// Accepting failed, or a queued-but-undelivered connection was cancelled
    /// by a close (`result_code` is the aborted code in that case).
    AcceptError {
        socket_id: SocketId,
        result_code: i32,
    },
}

/// Mutation requests handled by the family's reactor.
#[derive(Debug)]
pub(crate) enum ServerMsg {
    /// Hand off a bound-and-listening socket.
    Listen { id: SocketId, listener: TcpListener },
    /// The paused flag changed; drain queued accepts on resume.
    SetPaused { id: SocketId },
    /// Stop listening but keep the socket (a later `listen` may rebind).
    Disconnect { id: SocketId, done: Completion<()> },
    /// Destroy the socket.
    Close { id: SocketId, done: Completion<()> },
}

/// Stream-server dispatch surface.
pub struct TcpServerSockets {
    registry: SocketRegistry,
    events: EventBinding<ServerEvent>,
    sink: Arc<dyn AcceptSink>,
    reactor: Mutex<Option<ReactorHandle<ServerMsg>>>,
}

impl TcpServerSockets {
    /// Create a standalone family instance with its own id space.
    pub fn new(sink: Arc<dyn AcceptSink>) -> Self {
        Self::with_allocator(Arc::new(IdAllocator::new()), sink)
    }

    /// Create a family instance drawing ids from a shared allocator.
    pub(crate) fn with_allocator(ids: Arc<IdAllocator>, sink: Arc<dyn AcceptSink>) -> Self {
        Self {
            registry: SocketRegistry::new(ids),
            events: EventBinding::new(),
            sink,
            reactor: Mutex::new(None),
        }
    }

    /// Allocate a socket id and insert its record. Never touches the reactor.
    pub fn create(&self, config: SocketConfig) -> SocketId {
        let id = self.registry.allocate();
        self.registry.insert(Arc::new(SocketShared::new(id, &config)));
        debug!("[TcpServerSockets] created socket {id}");
        id
    }

    /// Replace a socket's configuration in place.
    pub fn update(&self, id: SocketId, config: &SocketConfig) -> Result<()> {
        self.registry.get(id)?.apply_config(config);
        Ok(())
    }

    /// Pause or resume acceptance.
    ///
    /// Resuming first announces connections that were accepted while paused,
    /// in arrival order, then re-arms acceptor interest.
    pub fn set_paused(&self, id: SocketId, paused: bool) -> Result<()> {
        let shared = self.registry.get(id)?;
        shared.set_paused(paused);
        if let Some(mailbox) = self.mailbox() {
            let _ = mailbox.push(ServerMsg::SetPaused { id });
        }
        Ok(())
    }

    /// Bind `address:port` and start listening.
    ///
    /// Bind and listen run synchronously on the calling thread; only the
    /// accept loop lives on the reactor. Listening twice without an
    /// intervening `disconnect` is a state-precondition error.
    pub fn listen(
        &self,
        id: SocketId,
        address: &str,
        port: u16,
        backlog: Option<u32>,
    ) -> Result<()> {
        let shared = self.registry.get(id)?;
        if shared.status().local_addr.is_some() {
            return Err(BridgeError::operation_failed("socket is already listening"));
        }
        let addr = resolve(address, port)?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.unwrap_or(DEFAULT_BACKLOG) as i32)?;

        let listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr().ok();
        shared.set_status(|s| s.local_addr = local);
        debug!("[TcpServerSockets] socket {id} listening on {local:?}");

        self.ensure_reactor()?.push(ServerMsg::Listen { id, listener })?;
        Ok(())
    }

    /// Stop listening, cancelling queued-but-undelivered accepts.
    ///
    /// The socket survives and may `listen` again.
    pub fn disconnect(&self, id: SocketId) -> Result<CompletionHandle<()>> {
        let shared = self.registry.get(id)?;
        let (done, handle) = completion();
        match self.mailbox() {
            Some(mailbox) => mailbox.push(ServerMsg::Disconnect { id, done })?,
            None => {
                shared.set_status(|s| *s = SocketStatus::default());
                done.resolve(());
            }
        }
        Ok(handle)
    }

    /// Destroy the socket, cancelling queued-but-undelivered accepts.
    pub fn close(&self, id: SocketId) -> Result<CompletionHandle<()>> {
        self.registry.get(id)?;
        let (done, handle) = completion();
        match self.mailbox() {
            Some(mailbox) => mailbox.push(ServerMsg::Close { id, done })?,
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

    /// Bind the accept-event channel and start the reactor if needed.
    pub fn register_accept_events(&self) -> Result<flume::Receiver<ServerEvent>> {
        self.ensure_reactor()?;
        Ok(self.events.bind())
    }

    /// Stop the reactor thread deterministically. Also runs on drop.
    pub fn shutdown(&self) {
        let handle = self.reactor.lock().take();
        drop(handle);
    }

    fn mailbox(&self) -> Option<Mailbox<ServerMsg>> {
        self.reactor.lock().as_ref().map(ReactorHandle::mailbox)
    }

    fn ensure_reactor(&self) -> Result<Mailbox<ServerMsg>> {
        let mut guard = self.reactor.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.mailbox());
        }
        let driver = ServerDriver {
            registry: self.registry.clone(),
            events: self.events.clone(),
            sink: Arc::clone(&self.sink),
            entities: HashMap::new(),
        };
        let handle = reactor::spawn("sockbridge-tcp-server", driver)?;
        let mailbox = handle.mailbox();
        *guard = Some(handle);
        Ok(mailbox)
    }
}

/// Reactor-owned half of one listening socket.
struct ServerEntity {
    shared: Arc<SocketShared>,
    listener: TcpListener,
    /// Accepted while paused, not yet announced. Drained in arrival order.
    queued: VecDeque<SocketId>,
    interest: Option<Interest>,
}

struct ServerDriver {
    registry: SocketRegistry,
    events: EventBinding<ServerEvent>,
    sink: Arc<dyn AcceptSink>,
    entities: HashMap<SocketId, ServerEntity>,
}

impl Drive for ServerDriver {
    type Msg = ServerMsg;

    fn ready(&mut self, registry: &mio::Registry, event: &mio::event::Event) {
        let id = event.token().0 as SocketId;
        if event.is_readable() {
            self.accept_ready(registry, id);
        }
    }

    fn apply(&mut self, registry: &mio::Registry, msg: ServerMsg) {
        match msg {
            ServerMsg::Listen { id, listener } => self.apply_listen(registry, id, listener),
            ServerMsg::SetPaused { id } => self.apply_set_paused(registry, id),
            ServerMsg::Disconnect { id, done } => {
                self.teardown_entity(registry, id);
                if let Some(shared) = self.registry.lookup(id) {
                    shared.set_status(|s| *s = SocketStatus::default());
                }
                done.resolve(());
            }
            ServerMsg::Close { id, done } => {
                self.teardown_entity(registry, id);
                self.registry.remove(id);
                done.resolve(());
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

impl ServerDriver {
    fn apply_listen(&mut self, registry: &mio::Registry, id: SocketId, listener: TcpListener) {
        let Some(shared) = self.registry.lookup(id) else {
            // Closed between dispatch and hand-off; the listener just drops.
            return;
        };
        self.entities.insert(
            id,
            ServerEntity {
                shared,
                listener,
                queued: VecDeque::new(),
                interest: None,
            },
        );
        self.sync_interest(registry, id);
    }

    fn apply_set_paused(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        if !entity.shared.is_paused() {
            // Announce connections accepted while paused before taking new
            // ones off the backlog.
            while let Some(client_id) = entity.queued.pop_front() {
                self.events.emit(ServerEvent::Accept {
                    socket_id: id,
                    client_socket_id: client_id,
                });
            }
        }
        self.sync_interest(registry, id);
    }

    fn accept_ready(&mut self, registry: &mio::Registry, id: SocketId) {
        loop {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            if entity.shared.is_paused() {
                // Leave further connections in the OS backlog; sync below
                // drops acceptor interest.
                break;
            }
            match entity.listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    match self.sink.adopt(stream) {
                        Ok(client_id) => {
                            trace!(
                                "[TcpServerReactor] socket {id} accepted {peer} as client {client_id}"
                            );
                            if entity.shared.is_paused() {
                                entity.queued.push_back(client_id);
                            } else {
                                self.events.emit(ServerEvent::Accept {
                                    socket_id: id,
                                    client_socket_id: client_id,
                                });
                            }
                        }
                        Err(err) => {
                            warn!("[TcpServerReactor] socket {id} failed to adopt {peer}: {err}");
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // The connection died between backlog and accept; not a
                // listener problem.
                Err(err)
                    if err.kind() == io::ErrorKind::ConnectionAborted
                        || err.kind() == io::ErrorKind::ConnectionReset =>
                {
                    continue
                }
                Err(err) => {
                    warn!("[TcpServerReactor] socket {id} accept failed: {err}");
                    self.events.emit(ServerEvent::AcceptError {
                        socket_id: id,
                        result_code: io_result_code(&err),
                    });
                    self.teardown_entity(registry, id);
                    self.registry.remove(id);
                    return;
                }
            }
        }
        self.sync_interest(registry, id);
    }

    /// Remove the entity, close the listener, cancel undelivered accepts.
    fn teardown_entity(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(mut entity) = self.entities.remove(&id) else {
            return;
        };
        if entity.interest.is_some() {
            let _ = registry.deregister(&mut entity.listener);
        }
        for client_id in entity.queued.drain(..) {
            self.sink.abandon(client_id);
            self.events.emit(ServerEvent::AcceptError {
                socket_id: id,
                result_code: codes::ABORTED,
            });
        }
        trace!("[TcpServerReactor] socket {id} torn down");
    }

    fn sync_interest(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        let want = if entity.shared.is_paused() {
            None
        } else {
            Some(Interest::READABLE)
        };
        if want == entity.interest {
            return;
        }
        let result = match (entity.interest, want) {
            (None, Some(interest)) => {
                registry.register(&mut entity.listener, Token(id as usize), interest)
            }
            (Some(_), Some(interest)) => {
                registry.reregister(&mut entity.listener, Token(id as usize), interest)
            }
            (Some(_), None) => registry.deregister(&mut entity.listener),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => entity.interest = want,
            Err(err) => warn!("[TcpServerReactor] socket {id} interest update failed: {err}"),
        }
    }
}
