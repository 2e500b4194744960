//! Socket configuration and introspection snapshots.
//!
//! Every socket family shares the same small configuration surface: a
//! `persistent` flag, an application-chosen `name`, and the read buffer size.
//! All fields can be changed after creation with the family's `update` call.

use std::net::SocketAddr;

/// Default read buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Per-socket configuration.
///
/// # Examples
///
/// ```
/// use sockbridge_core::config::SocketConfig;
///
/// let config = SocketConfig::new()
///     .with_name("telemetry")
///     .with_buffer_size(16384);
/// assert_eq!(config.buffer_size, 16384);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Keep the socket alive across embedder page reloads.
    ///
    /// The flag is bookkeeping for the hosting layer; the engine only stores
    /// and reports it.
    pub persistent: bool,

    /// Application-chosen label, reported back by `get_info`.
    pub name: String,

    /// Size of the buffer used for each bounded read.
    ///
    /// Changing it via `update` takes effect on the next read.
    pub buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            name: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl SocketConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the socket persistent.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the socket name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the read buffer size.
    ///
    /// # Examples
    ///
    /// ```
    /// use sockbridge_core::config::SocketConfig;
    ///
    /// // Small buffers for low latency
    /// let config = SocketConfig::new().with_buffer_size(1024);
    /// assert_eq!(config.buffer_size, 1024);
    /// ```
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Point-in-time snapshot of one socket, as reported by `get_info`.
///
/// The snapshot may lag the reactor by one event; it never runs ahead of the
/// last event delivered for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    /// The socket id the snapshot describes.
    pub socket_id: u32,
    /// Configured persistence flag.
    pub persistent: bool,
    /// Configured name.
    pub name: String,
    /// Configured read buffer size.
    pub buffer_size: usize,
    /// Whether read/accept readiness is currently ignored.
    pub paused: bool,
    /// Whether the socket is connected (stream) or has a fixed peer (datagram).
    pub connected: bool,
    /// Local address, once bound/connected/listening.
    pub local_addr: Option<SocketAddr>,
    /// Peer address, once connected.
    pub peer_addr: Option<SocketAddr>,
}

impl SocketInfo {
    /// Local address rendered as a string, if known.
    #[must_use]
    pub fn local_address(&self) -> Option<String> {
        self.local_addr.map(|a| a.ip().to_string())
    }

    /// Local port, if known.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|a| a.port())
    }

    /// Peer address rendered as a string, if connected.
    #[must_use]
    pub fn peer_address(&self) -> Option<String> {
        self.peer_addr.map(|a| a.ip().to_string())
    }

    /// Peer port, if connected.
    #[must_use]
    pub fn peer_port(&self) -> Option<u16> {
        self.peer_addr.map(|a| a.port())
    }
}
