//! Socket registry: id allocation and the dispatch-visible socket records.
//!
//! The registry is the only socket state shared across threads. It maps
//! integer socket ids to [`SocketShared`] records; the native handles live in
//! the reactor thread's own table (arena + index pattern: the registry is the
//! arena, ids are the indices). Dispatch threads insert and look up; the
//! reactor thread removes entries when it tears a socket down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{SocketConfig, SocketInfo};
use crate::error::{BridgeError, Result};

/// Socket identifier, unique for the lifetime of the allocator.
pub type SocketId = u32;

/// Monotonic id source shared by every family of one bridge instance.
///
/// Ids start at 1 and are never reused, so a queued reactor message can never
/// observe a recycled id.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    /// Create an allocator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Take the next id.
    pub fn allocate(&self) -> SocketId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection status snapshot, updated by the reactor and read by `get_info`.
#[derive(Debug, Clone, Default)]
pub struct SocketStatus {
    /// Connected (stream) / has a fixed default peer (datagram).
    pub connected: bool,
    /// Local address once bound, connected, or listening.
    pub local_addr: Option<SocketAddr>,
    /// Peer address once connected.
    pub peer_addr: Option<SocketAddr>,
}

/// Dispatch-visible half of a socket entity.
///
/// Configuration fields are latest-wins: dispatch threads store, the reactor
/// loads on its next pass. No field here is required for the reactor's
/// correctness mid-operation, so plain atomics and a small mutex suffice.
#[derive(Debug)]
pub struct SocketShared {
    id: SocketId,
    persistent: AtomicBool,
    paused: AtomicBool,
    buffer_size: AtomicUsize,
    name: Mutex<String>,
    status: Mutex<SocketStatus>,
}

impl SocketShared {
    /// Create the shared record for a freshly allocated id.
    pub fn new(id: SocketId, config: &SocketConfig) -> Self {
        Self {
            id,
            persistent: AtomicBool::new(config.persistent),
            paused: AtomicBool::new(false),
            buffer_size: AtomicUsize::new(config.buffer_size),
            name: Mutex::new(config.name.clone()),
            status: Mutex::new(SocketStatus::default()),
        }
    }

    /// Create a record for a server-accepted socket, which starts paused.
    pub fn new_paused(id: SocketId, config: &SocketConfig) -> Self {
        let shared = Self::new(id, config);
        shared.paused.store(true, Ordering::Relaxed);
        shared
    }

    /// The socket id.
    #[inline]
    pub const fn id(&self) -> SocketId {
        self.id
    }

    /// Current paused flag.
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Store the paused flag (latest wins).
    #[inline]
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Read buffer size used for the next bounded read.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    /// Replace the configuration in place.
    pub fn apply_config(&self, config: &SocketConfig) {
        self.persistent.store(config.persistent, Ordering::Relaxed);
        self.buffer_size.store(config.buffer_size, Ordering::Relaxed);
        *self.name.lock() = config.name.clone();
    }

    /// Update the status snapshot.
    pub fn set_status(&self, update: impl FnOnce(&mut SocketStatus)) {
        update(&mut self.status.lock());
    }

    /// Clone the current status snapshot.
    pub fn status(&self) -> SocketStatus {
        self.status.lock().clone()
    }

    /// Build the `get_info` snapshot for this socket.
    pub fn info(&self) -> SocketInfo {
        let status = self.status();
        SocketInfo {
            socket_id: self.id,
            persistent: self.persistent.load(Ordering::Relaxed),
            name: self.name.lock().clone(),
            buffer_size: self.buffer_size(),
            paused: self.is_paused(),
            connected: status.connected,
            local_addr: status.local_addr,
            peer_addr: status.peer_addr,
        }
    }
}

/// Concurrent id → socket-record map for one family.
///
/// Cloning shares the underlying map; the reactor driver and the dispatch
/// surface each hold a clone.
#[derive(Debug, Clone)]
pub struct SocketRegistry {
    ids: Arc<IdAllocator>,
    slots: Arc<DashMap<SocketId, Arc<SocketShared>>>,
}

impl SocketRegistry {
    /// Create a registry drawing ids from the given allocator.
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Allocate a fresh id (registry insertion is a separate step).
    pub fn allocate(&self) -> SocketId {
        self.ids.allocate()
    }

    /// Insert a record under its id.
    pub fn insert(&self, shared: Arc<SocketShared>) {
        self.slots.insert(shared.id(), shared);
    }

    /// Look up a record, failing with `InvalidArgument` for unknown ids.
    pub fn get(&self, id: SocketId) -> Result<Arc<SocketShared>> {
        self.slots
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::unknown_socket(id))
    }

    /// Look up a record without surfacing an error.
    pub fn lookup(&self, id: SocketId) -> Option<Arc<SocketShared>> {
        self.slots.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a record; returns it if it was present.
    pub fn remove(&self, id: SocketId) -> Option<Arc<SocketShared>> {
        self.slots.remove(&id).map(|(_, shared)| shared)
    }

    /// Whether an id is currently registered.
    pub fn contains(&self, id: SocketId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Snapshot every live socket, ascending by id.
    pub fn infos(&self) -> Vec<SocketInfo> {
        let mut infos: Vec<SocketInfo> =
            self.slots.iter().map(|entry| entry.value().info()).collect();
        infos.sort_by_key(|info| info.socket_id);
        infos
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SocketRegistry {
        SocketRegistry::new(Arc::new(IdAllocator::new()))
    }

    #[test]
    fn test_ids_monotonic_from_one() {
        let reg = registry();
        let first = reg.allocate();
        let second = reg.allocate();
        let third = reg.allocate();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 3);
    }

    #[test]
    fn test_shared_allocator_spans_registries() {
        let ids = Arc::new(IdAllocator::new());
        let a = SocketRegistry::new(Arc::clone(&ids));
        let b = SocketRegistry::new(ids);
        assert_eq!(a.allocate(), 1);
        assert_eq!(b.allocate(), 2);
        assert_eq!(a.allocate(), 3);
    }

    #[test]
    fn test_insert_get_remove() {
        let reg = registry();
        let id = reg.allocate();
        reg.insert(Arc::new(SocketShared::new(id, &SocketConfig::default())));

        assert!(reg.get(id).is_ok());
        assert!(reg.contains(id));

        reg.remove(id);
        assert!(matches!(
            reg.get(id),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ids_never_reused_after_remove() {
        let reg = registry();
        let id = reg.allocate();
        reg.insert(Arc::new(SocketShared::new(id, &SocketConfig::default())));
        reg.remove(id);

        let next = reg.allocate();
        assert!(next > id);
    }

    #[test]
    fn test_infos_sorted_by_id() {
        let reg = registry();
        for _ in 0..3 {
            let id = reg.allocate();
            reg.insert(Arc::new(SocketShared::new(id, &SocketConfig::default())));
        }
        let infos = reg.infos();
        let ids: Vec<u32> = infos.iter().map(|i| i.socket_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_config_update_latest_wins() {
        let shared = SocketShared::new(1, &SocketConfig::default());
        shared.apply_config(&SocketConfig::new().with_name("updated").with_buffer_size(512));
        let info = shared.info();
        assert_eq!(info.name, "updated");
        assert_eq!(info.buffer_size, 512);
    }

    #[test]
    fn test_accepted_socket_starts_paused() {
        let shared = SocketShared::new_paused(9, &SocketConfig::default());
        assert!(shared.is_paused());
    }
}
