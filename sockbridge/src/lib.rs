//! # Sockbridge
//!
//! A browser-style socket bridge: stream-client, stream-server, and datagram
//! socket families with integer socket ids, exposed to an embedding
//! environment and backed by readiness-based non-blocking I/O.
//!
//! ## Architecture
//!
//! - **`sockbridge-core`**: family-agnostic engine: registry, mutation
//!   queue, completions, event binding, and the reactor thread harness
//! - **`sockbridge`**: the three family surfaces (this crate)
//!
//! Each family runs one reactor thread that owns every native handle of the
//! family. Dispatch calls are thin and synchronous: they validate arguments,
//! then either finish immediately or push a message into the family's
//! mutation queue and hand back a completion. Asynchronous results arrive on
//! the family's bound event channel.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sockbridge::{Bridge, SocketConfig};
//!
//! # fn example() -> sockbridge::Result<()> {
//! let bridge = Bridge::new();
//!
//! // Server side: listen and watch for accepted connections.
//! let accepts = bridge.tcp_server().register_accept_events()?;
//! let server = bridge.tcp_server().create(SocketConfig::default());
//! bridge.tcp_server().listen(server, "127.0.0.1", 9000, None)?;
//!
//! // Client side: connect and send.
//! let client = bridge.tcp().create(SocketConfig::default());
//! bridge.tcp().connect(client, "127.0.0.1", 9000)?.recv().unwrap()?;
//! bridge.tcp().send(client, &b"hello"[..])?;
//!
//! // Accepted sockets surface as paused stream-client sockets.
//! if let Ok(event) = accepts.recv() {
//!     println!("accepted: {event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Ownership model
//!
//! Once a handle is handed to a reactor it is moved, not shared: dispatch
//! threads keep only the integer id and talk to the reactor through the
//! mutation queue. That single-writer discipline is what makes the bridge
//! safe to call from any thread without per-socket locks.

mod addr;
pub mod bridge;
pub mod dev_tracing;
pub mod tcp;
pub mod tcp_server;
pub mod udp;

pub use bridge::Bridge;
pub use sockbridge_core::completion::CompletionHandle;
pub use sockbridge_core::config::{SocketConfig, SocketInfo, DEFAULT_BUFFER_SIZE};
pub use sockbridge_core::error::{codes, BridgeError, Result};
pub use sockbridge_core::registry::SocketId;
pub use tcp::{TcpEvent, TcpSockets};
pub use tcp_server::{AcceptSink, ServerEvent, TcpServerSockets, DEFAULT_BACKLOG};
pub use udp::{UdpEvent, UdpSockets};

// Optional: a small prelude to make embedder code ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::bridge::Bridge;
    pub use crate::tcp::{TcpEvent, TcpSockets};
    pub use crate::tcp_server::{ServerEvent, TcpServerSockets};
    pub use crate::udp::{UdpEvent, UdpSockets};
    pub use sockbridge_core::config::{SocketConfig, SocketInfo};
    pub use sockbridge_core::error::{codes, BridgeError, Result};
    pub use sockbridge_core::registry::SocketId;
}
