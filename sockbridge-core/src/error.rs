//! Sockbridge error types.
//!
//! One taxonomy for every call on the dispatch surface:
//! - `InvalidArgument` / `NotConnected` / `OperationFailed` are returned
//!   synchronously and never retried
//! - `Io` surfaces asynchronously through the matching completion or event
//! - `Cancelled` completes queued work dropped by a socket close

use std::io;
use thiserror::Error;

/// Main error type for sockbridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Unknown socket id, or an id of the wrong socket kind
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O attempted on a socket not in a state that permits it
    #[error("socket is not connected")]
    NotConnected,

    /// State precondition violated (double listen, connect while connected, ...)
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// Queued operation dropped because the socket was closed
    #[error("operation cancelled by socket close")]
    Cancelled,

    /// The reactor thread has stopped and can no longer take requests
    #[error("reactor is shut down")]
    Shutdown,

    /// IO error during a socket operation
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for sockbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create an invalid-argument error with a message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Invalid-argument error for a socket id that is not in the registry.
    pub fn unknown_socket(id: u32) -> Self {
        Self::InvalidArgument(format!("unknown socket id {id}"))
    }

    /// Create an operation-failed error with a message.
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Check if this error is reported synchronously by the dispatch surface.
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::NotConnected | Self::OperationFailed(_)
        )
    }

    /// Check if this error means the target socket no longer exists.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Numeric result code delivered on the event channel.
    ///
    /// The taxonomy is a stable external contract: small negative integers
    /// mirroring OS error classes (see [`codes`]).
    #[must_use]
    pub fn result_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Self::NotConnected => codes::NOT_CONNECTED,
            Self::OperationFailed(_) => codes::FAILED,
            Self::Cancelled => codes::ABORTED,
            Self::Shutdown => codes::FAILED,
            Self::Io(err) => io_result_code(err),
        }
    }
}

/// Map an OS-level I/O error to its wire result code.
#[must_use]
pub fn io_result_code(err: &io::Error) -> i32 {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::WouldBlock => codes::IO_PENDING,
        ErrorKind::InvalidInput => codes::INVALID_ARGUMENT,
        ErrorKind::TimedOut => codes::TIMED_OUT,
        ErrorKind::PermissionDenied => codes::ACCESS_DENIED,
        ErrorKind::NotConnected => codes::NOT_CONNECTED,
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => codes::CONNECTION_CLOSED,
        ErrorKind::ConnectionReset => codes::CONNECTION_RESET,
        ErrorKind::ConnectionRefused => codes::CONNECTION_REFUSED,
        ErrorKind::ConnectionAborted => codes::CONNECTION_ABORTED,
        ErrorKind::AddrNotAvailable => codes::ADDRESS_INVALID,
        ErrorKind::AddrInUse => codes::ADDRESS_IN_USE,
        _ => codes::FAILED,
    }
}

/// Wire result codes delivered to event-channel consumers.
///
/// Values mirror the negative-integer taxonomy the original callers expect;
/// they must stay stable across releases.
pub mod codes {
    /// Operation is still in flight (non-blocking would-block).
    pub const IO_PENDING: i32 = -1;
    /// Generic failure.
    pub const FAILED: i32 = -2;
    /// Operation aborted (socket closed underneath it).
    pub const ABORTED: i32 = -3;
    /// Invalid argument.
    pub const INVALID_ARGUMENT: i32 = -4;
    /// Invalid handle.
    pub const INVALID_HANDLE: i32 = -5;
    /// Operation timed out.
    pub const TIMED_OUT: i32 = -7;
    /// Permission denied by the OS.
    pub const ACCESS_DENIED: i32 = -10;
    /// Socket is not connected.
    pub const NOT_CONNECTED: i32 = -15;
    /// Connection closed by the peer (graceful EOF).
    pub const CONNECTION_CLOSED: i32 = -100;
    /// Connection reset by the peer.
    pub const CONNECTION_RESET: i32 = -101;
    /// Connection refused by the remote host.
    pub const CONNECTION_REFUSED: i32 = -102;
    /// Connection aborted locally.
    pub const CONNECTION_ABORTED: i32 = -103;
    /// Address is invalid or not available on this host.
    pub const ADDRESS_INVALID: i32 = -108;
    /// Address unreachable.
    pub const ADDRESS_UNREACHABLE: i32 = -109;
    /// Address already in use.
    pub const ADDRESS_IN_USE: i32 = -147;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synchronous_classification() {
        assert!(BridgeError::unknown_socket(7).is_synchronous());
        assert!(BridgeError::NotConnected.is_synchronous());
        assert!(BridgeError::operation_failed("double listen").is_synchronous());
        assert!(!BridgeError::Cancelled.is_synchronous());
        assert!(!BridgeError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_synchronous());
    }

    #[test]
    fn test_result_codes_stable() {
        assert_eq!(BridgeError::unknown_socket(1).result_code(), -4);
        assert_eq!(BridgeError::NotConnected.result_code(), -15);
        assert_eq!(BridgeError::Cancelled.result_code(), -3);
        assert_eq!(BridgeError::operation_failed("x").result_code(), -2);
    }

    #[test]
    fn test_io_result_code_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(io_result_code(&refused), codes::CONNECTION_REFUSED);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(io_result_code(&reset), codes::CONNECTION_RESET);

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(io_result_code(&eof), codes::CONNECTION_CLOSED);

        // Unclassified kinds collapse to the generic failure code
        let other = io::Error::other("weird");
        assert_eq!(io_result_code(&other), codes::FAILED);
    }

    #[test]
    fn test_from_io_error() {
        let err: BridgeError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.result_code(), codes::CONNECTION_CLOSED);
    }
}
