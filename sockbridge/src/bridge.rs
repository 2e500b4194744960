//! Process-wide bridge instance.
//!
//! One `Bridge` owns the three socket families and the id allocator they
//! share, replacing the per-plugin static singletons of older bridge layers
//! with explicit state that is constructed once and torn down
//! deterministically.

use std::sync::Arc;

use sockbridge_core::registry::IdAllocator;

use crate::tcp::TcpSockets;
use crate::tcp_server::{AcceptSink, TcpServerSockets};
use crate::udp::UdpSockets;

/// Owned socket-bridge instance: stream-client, stream-server, and datagram
/// families wired together.
///
/// Socket ids are unique across all three families. Accepted server
/// connections are adopted by the stream-client family as paused sockets.
///
/// Dropping the bridge stops every reactor thread; the server family is torn
/// down first so no accept can race the client family's shutdown.
pub struct Bridge {
    tcp_server: TcpServerSockets,
    udp: UdpSockets,
    tcp: Arc<TcpSockets>,
}

impl Bridge {
    /// Create a bridge with freshly wired families.
    pub fn new() -> Self {
        let ids = Arc::new(IdAllocator::new());
        let tcp = Arc::new(TcpSockets::with_allocator(Arc::clone(&ids)));
        let sink: Arc<dyn AcceptSink> = Arc::clone(&tcp) as Arc<dyn AcceptSink>;
        let tcp_server = TcpServerSockets::with_allocator(Arc::clone(&ids), sink);
        let udp = UdpSockets::with_allocator(ids);
        Self {
            tcp_server,
            udp,
            tcp,
        }
    }

    /// The stream-client family.
    pub fn tcp(&self) -> &TcpSockets {
        &self.tcp
    }

    /// The stream-server family.
    pub fn tcp_server(&self) -> &TcpServerSockets {
        &self.tcp_server
    }

    /// The datagram family.
    pub fn udp(&self) -> &UdpSockets {
        &self.udp
    }

    /// Stop every reactor thread now instead of waiting for drop.
    pub fn shutdown(&self) {
        self.tcp_server.shutdown();
        self.udp.shutdown();
        self.tcp.shutdown();
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}
