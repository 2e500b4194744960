//! Address resolution for the dispatch surfaces.

use std::net::{SocketAddr, ToSocketAddrs};

use sockbridge_core::error::{BridgeError, Result};

/// Resolve an `address:port` pair to a socket address.
///
/// Resolution happens on the calling thread (it may block on DNS); the
/// reactor never resolves names. The first resolved address wins.
pub(crate) fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (address, port)
        .to_socket_addrs()
        .map_err(|err| BridgeError::invalid_argument(format!("cannot resolve {address}: {err}")))?;
    addrs
        .next()
        .ok_or_else(|| BridgeError::invalid_argument(format!("no addresses for {address}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_ipv4() {
        let addr = resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_resolve_literal_ipv6() {
        let addr = resolve("::1", 9000).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn test_resolve_garbage_is_invalid_argument() {
        assert!(matches!(
            resolve("not an address", 1),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
