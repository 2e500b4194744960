//! Datagram socket family.
//!
//! A datagram socket becomes reactor-managed at `bind` (or at a `connect`
//! from the unbound state, which auto-binds an ephemeral local address).
//! `connect` after `bind` only fixes the default destination for `send`
//! without an explicit address; bound and connected are not mutually
//! exclusive. Sends are whole-datagram: a send either goes out in one
//! syscall or waits intact for a writable edge.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use sockbridge_core::completion::{completion, Completion, CompletionHandle};
use sockbridge_core::config::{SocketConfig, SocketInfo};
use sockbridge_core::error::{io_result_code, BridgeError, Result};
use sockbridge_core::events::EventBinding;
use sockbridge_core::mailbox::Mailbox;
use sockbridge_core::reactor::{self, Drive, ReactorHandle};
use sockbridge_core::registry::{IdAllocator, SocketId, SocketRegistry, SocketShared, SocketStatus};

use crate::addr::resolve;

/// Asynchronous events emitted by the datagram family.
#[derive(Debug, Clone)]
pub enum UdpEvent {
    /// A datagram arrived on a connected socket.
    Receive { socket_id: SocketId, data: Bytes },
    /// A datagram arrived on a bound, unconnected socket.
    ReceiveFrom {
        socket_id: SocketId,
        data: Bytes,
        remote_addr: SocketAddr,
    },
    /// A receive failed; the socket is torn down after this event.
    ReceiveError {
        socket_id: SocketId,
        result_code: i32,
    },
    /// The socket was destroyed after a fatal I/O error.
    Closed { socket_id: SocketId },
}

/// Mutation requests handled by the family's reactor.
#[derive(Debug)]
pub(crate) enum UdpMsg {
    /// Hand off a bound (and possibly connected) socket.
    Bind { id: SocketId, socket: UdpSocket },
    /// Fix the default destination of an already-managed socket.
    Connect {
        id: SocketId,
        addr: SocketAddr,
        done: Completion<()>,
    },
    /// Queue (or immediately attempt) an outbound datagram.
    Send {
        id: SocketId,
        data: Bytes,
        to: Option<SocketAddr>,
        done: Completion<usize>,
    },
    /// The paused flag changed; recompute interest.
    SetPaused { id: SocketId },
    /// Drop the handle but keep the socket (a later `bind` may rebind).
    Disconnect { id: SocketId, done: Completion<()> },
    /// Destroy the socket.
    Close { id: SocketId, done: Completion<()> },
}

/// Datagram dispatch surface.
pub struct UdpSockets {
    registry: SocketRegistry,
    events: EventBinding<UdpEvent>,
    reactor: Mutex<Option<ReactorHandle<UdpMsg>>>,
}

impl UdpSockets {
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
        debug!("[UdpSockets] created socket {id}");
        id
    }

    /// Replace a socket's configuration in place.
    pub fn update(&self, id: SocketId, config: &SocketConfig) -> Result<()> {
        self.registry.get(id)?.apply_config(config);
        Ok(())
    }

    /// Pause or resume delivery of receive events.
    pub fn set_paused(&self, id: SocketId, paused: bool) -> Result<()> {
        let shared = self.registry.get(id)?;
        shared.set_paused(paused);
        if let Some(mailbox) = self.mailbox() {
            let _ = mailbox.push(UdpMsg::SetPaused { id });
        }
        Ok(())
    }

    /// Bind the socket to a local address.
    pub fn bind(&self, id: SocketId, address: &str, port: u16) -> Result<()> {
        let shared = self.registry.get(id)?;
        if shared.status().local_addr.is_some() {
            return Err(BridgeError::operation_failed("socket is already bound"));
        }
        let addr = resolve(address, port)?;
        let socket = new_udp_socket(addr)?;
        let local = socket.local_addr().ok();
        shared.set_status(|s| s.local_addr = local);
        debug!("[UdpSockets] socket {id} bound to {local:?}");
        self.ensure_reactor()?.push(UdpMsg::Bind { id, socket })?;
        Ok(())
    }

    /// Fix the default destination for `send`.
    ///
    /// From the unbound state this auto-binds an ephemeral local address in
    /// the destination's family first; connect-after-bind is also permitted.
    pub fn connect(&self, id: SocketId, address: &str, port: u16) -> Result<CompletionHandle<()>> {
        let shared = self.registry.get(id)?;
        let addr = resolve(address, port)?;
        let (done, handle) = completion();

        if shared.status().local_addr.is_some() {
            // Handle already owned by the reactor.
            self.ensure_reactor()?.push(UdpMsg::Connect { id, addr, done })?;
        } else {
            let local: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().map_err(|_| BridgeError::operation_failed("bad wildcard"))?
            } else {
                "[::]:0".parse().map_err(|_| BridgeError::operation_failed("bad wildcard"))?
            };
            let socket = new_udp_socket(local)?;
            // Still owned by this call; connect before hand-off.
            socket.connect(addr)?;
            shared.set_status(|s| {
                s.connected = true;
                s.local_addr = socket.local_addr().ok();
                s.peer_addr = Some(addr);
            });
            self.ensure_reactor()?.push(UdpMsg::Bind { id, socket })?;
            done.resolve(());
        }
        Ok(handle)
    }

    /// Send a datagram to the connected default destination.
    pub fn send(&self, id: SocketId, data: impl Into<Bytes>) -> Result<CompletionHandle<usize>> {
        let shared = self.registry.get(id)?;
        if !shared.status().connected {
            return Err(BridgeError::NotConnected);
        }
        self.queue_send(id, data.into(), None)
    }

    /// Send a datagram to an explicit destination.
    pub fn send_to(
        &self,
        id: SocketId,
        data: impl Into<Bytes>,
        address: &str,
        port: u16,
    ) -> Result<CompletionHandle<usize>> {
        let shared = self.registry.get(id)?;
        if shared.status().local_addr.is_none() {
            return Err(BridgeError::NotConnected);
        }
        let to = resolve(address, port)?;
        self.queue_send(id, data.into(), Some(to))
    }

    /// Drop the handle, cancelling queued sends and returning the socket to
    /// the unbound state. A later `bind` or `connect` may reuse the id.
    pub fn disconnect(&self, id: SocketId) -> Result<CompletionHandle<()>> {
        let shared = self.registry.get(id)?;
        let (done, handle) = completion();
        match self.mailbox() {
            Some(mailbox) => mailbox.push(UdpMsg::Disconnect { id, done })?,
            None => {
                shared.set_status(|s| *s = SocketStatus::default());
                done.resolve(());
            }
        }
        Ok(handle)
    }

    /// Destroy the socket, cancelling queued sends.
    pub fn close(&self, id: SocketId) -> Result<CompletionHandle<()>> {
        self.registry.get(id)?;
        let (done, handle) = completion();
        match self.mailbox() {
            Some(mailbox) => mailbox.push(UdpMsg::Close { id, done })?,
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
    pub fn register_receive_events(&self) -> Result<flume::Receiver<UdpEvent>> {
        self.ensure_reactor()?;
        Ok(self.events.bind())
    }

    /// Stop the reactor thread deterministically. Also runs on drop.
    pub fn shutdown(&self) {
        let handle = self.reactor.lock().take();
        drop(handle);
    }

    fn queue_send(
        &self,
        id: SocketId,
        data: Bytes,
        to: Option<SocketAddr>,
    ) -> Result<CompletionHandle<usize>> {
        let (done, handle) = completion();
        self.ensure_reactor()?.push(UdpMsg::Send { id, data, to, done })?;
        Ok(handle)
    }

    fn mailbox(&self) -> Option<Mailbox<UdpMsg>> {
        self.reactor.lock().as_ref().map(ReactorHandle::mailbox)
    }

    fn ensure_reactor(&self) -> Result<Mailbox<UdpMsg>> {
        let mut guard = self.reactor.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.mailbox());
        }
        let driver = UdpDriver {
            registry: self.registry.clone(),
            events: self.events.clone(),
            entities: HashMap::new(),
        };
        let handle = reactor::spawn("sockbridge-udp", driver)?;
        let mailbox = handle.mailbox();
        *guard = Some(handle);
        Ok(mailbox)
    }
}

impl Default for UdpSockets {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a non-blocking UDP socket bound to `addr`.
fn new_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

#[derive(Debug)]
struct UdpSendOp {
    data: Bytes,
    to: Option<SocketAddr>,
    done: Completion<usize>,
}

/// Reactor-owned half of one datagram socket.
#[derive(Debug)]
struct UdpEntity {
    shared: Arc<SocketShared>,
    socket: UdpSocket,
    pending: VecDeque<UdpSendOp>,
    interest: Option<Interest>,
}

struct UdpDriver {
    registry: SocketRegistry,
    events: EventBinding<UdpEvent>,
    entities: HashMap<SocketId, UdpEntity>,
}

impl Drive for UdpDriver {
    type Msg = UdpMsg;

    fn ready(&mut self, registry: &mio::Registry, event: &mio::event::Event) {
        let id = event.token().0 as SocketId;
        if !self.entities.contains_key(&id) {
            return;
        }
        if event.is_readable() {
            self.read_ready(registry, id);
        }
        if event.is_writable() {
            self.write_ready(id);
        }
        self.sync_interest(registry, id);
    }

    fn apply(&mut self, registry: &mio::Registry, msg: UdpMsg) {
        match msg {
            UdpMsg::Bind { id, socket } => self.apply_bind(registry, id, socket),
            UdpMsg::Connect { id, addr, done } => self.apply_connect(id, addr, done),
            UdpMsg::Send { id, data, to, done } => self.apply_send(registry, id, data, to, done),
            UdpMsg::SetPaused { id } => self.sync_interest(registry, id),
            UdpMsg::Disconnect { id, done } => {
                self.teardown_entity(registry, id);
                done.resolve(());
            }
            UdpMsg::Close { id, done } => {
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

impl UdpDriver {
    fn apply_bind(&mut self, registry: &mio::Registry, id: SocketId, socket: UdpSocket) {
        let Some(shared) = self.registry.lookup(id) else {
            // Closed between dispatch and hand-off.
            return;
        };
        self.entities.insert(
            id,
            UdpEntity {
                shared,
                socket,
                pending: VecDeque::new(),
                interest: None,
            },
        );
        self.sync_interest(registry, id);
    }

    fn apply_connect(&mut self, id: SocketId, addr: SocketAddr, done: Completion<()>) {
        let Some(entity) = self.entities.get_mut(&id) else {
            let err = if self.registry.contains(id) {
                BridgeError::NotConnected
            } else {
                BridgeError::unknown_socket(id)
            };
            done.reject(err);
            return;
        };
        match entity.socket.connect(addr) {
            Ok(()) => {
                entity.shared.set_status(|s| {
                    s.connected = true;
                    s.peer_addr = Some(addr);
                });
                debug!("[UdpReactor] socket {id} connected to {addr}");
                done.resolve(());
            }
            Err(err) => done.reject(err.into()),
        }
    }

    fn apply_send(
        &mut self,
        registry: &mio::Registry,
        id: SocketId,
        data: Bytes,
        to: Option<SocketAddr>,
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

        if entity.pending.is_empty() {
            let result = match to {
                Some(addr) => entity.socket.send_to(&data, addr),
                None => entity.socket.send(&data),
            };
            match result {
                Ok(n) => {
                    trace!("[UdpReactor] socket {id} sent {n} bytes inline");
                    done.resolve(n);
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    // A failed datagram send is not fatal to the socket.
                    done.reject(err.into());
                    return;
                }
            }
        }
        entity.pending.push_back(UdpSendOp { data, to, done });
        self.sync_interest(registry, id);
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
            match entity.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    buf.truncate(n);
                    let data = Bytes::from(buf);
                    trace!("[UdpReactor] socket {id} received {n} bytes from {from}");
                    if entity.shared.status().connected {
                        self.events.emit(UdpEvent::Receive {
                            socket_id: id,
                            data,
                        });
                    } else {
                        self.events.emit(UdpEvent::ReceiveFrom {
                            socket_id: id,
                            data,
                            remote_addr: from,
                        });
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("[UdpReactor] socket {id} receive failed: {err}");
                    self.events.emit(UdpEvent::ReceiveError {
                        socket_id: id,
                        result_code: io_result_code(&err),
                    });
                    self.teardown_entity(registry, id);
                    self.registry.remove(id);
                    self.events.emit(UdpEvent::Closed { socket_id: id });
                    return;
                }
            }
        }
    }

    fn write_ready(&mut self, id: SocketId) {
        loop {
            let Some(entity) = self.entities.get_mut(&id) else {
                return;
            };
            let Some(op) = entity.pending.front() else {
                return;
            };
            let result = match op.to {
                Some(addr) => entity.socket.send_to(&op.data, addr),
                None => entity.socket.send(&op.data),
            };
            match result {
                Ok(n) => {
                    if let Some(op) = entity.pending.pop_front() {
                        trace!("[UdpReactor] socket {id} drained a {n}-byte datagram");
                        op.done.resolve(n);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if let Some(op) = entity.pending.pop_front() {
                        op.done.reject(err.into());
                    }
                }
            }
        }
    }

    /// Remove the entity, close the socket, cancel queued sends.
    fn teardown_entity(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(mut entity) = self.entities.remove(&id) else {
            return;
        };
        if entity.interest.is_some() {
            let _ = registry.deregister(&mut entity.socket);
        }
        for op in entity.pending.drain(..) {
            op.done.reject(BridgeError::Cancelled);
        }
        entity.shared.set_status(|s| *s = SocketStatus::default());
        trace!("[UdpReactor] socket {id} torn down");
    }

    fn sync_interest(&mut self, registry: &mio::Registry, id: SocketId) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
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
        if want == entity.interest {
            return;
        }
        let result = match (entity.interest, want) {
            (None, Some(interest)) => {
                registry.register(&mut entity.socket, Token(id as usize), interest)
            }
            (Some(_), Some(interest)) => {
                registry.reregister(&mut entity.socket, Token(id as usize), interest)
            }
            (Some(_), None) => registry.deregister(&mut entity.socket),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => entity.interest = want,
            Err(err) => warn!("[UdpReactor] socket {id} interest update failed: {err}"),
        }
    }
}
