//! Local address discovery.  Network association is handled by the OS; the
//! node only needs to know which address it reaches the broker from.

use std::io;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

/// Placeholder reported when no address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Address of the interface that routes towards `host:port`.  A connected
/// UDP socket selects the route without sending anything.
pub fn route_ip(host: &str, port: u16) -> io::Result<IpAddr> {
    let target = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

/// The IP to publish: the configured one, else the broker route, else
/// [`UNKNOWN_IP`].
pub fn device_ip(fixed: Option<&str>, host: &str, port: u16) -> String {
    if let Some(ip) = fixed {
        return ip.to_string();
    }
    match route_ip(host, port) {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            tracing::warn!(host, "could not determine local ip: {e}");
            UNKNOWN_IP.to_string()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ip_wins() {
        assert_eq!(device_ip(Some("10.1.2.3"), "127.0.0.1", 1883), "10.1.2.3");
    }

    #[test]
    fn loopback_route_is_loopback() {
        let ip = route_ip("127.0.0.1", 1883).unwrap();
        assert!(ip.is_loopback(), "got {ip}");
    }

    #[test]
    fn unresolvable_host_is_unknown() {
        assert_eq!(device_ip(None, "", 1883), UNKNOWN_IP);
    }
}
