//! A small wrapper around `std::net::SocketAddr` supplying the string
//! conversions and construction helpers the runtime's other modules need,
//! without reinventing what `std::net` already gets right.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::sys::socket::{self, Socket};

/// An endpoint address: either a listening wildcard/loopback address or a
/// resolved peer address.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HostAddress(SocketAddr);

impl HostAddress {
    /// A listening endpoint on `port`. `loopback_only` binds to the
    /// loopback address instead of the wildcard; `ipv6` picks the address
    /// family.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> HostAddress {
        let ip = match (ipv6, loopback_only) {
            (false, false) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (false, true) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (true, false) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            (true, true) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        HostAddress(SocketAddr::new(ip, port))
    }

    /// An address built from a literal IP string and a port, e.g.
    /// `HostAddress::with_ip_port("127.0.0.1", 9000)`.
    pub fn with_ip_port(ip: &str, port: u16) -> io::Result<HostAddress> {
        socket::from_ip_port(&format!("{}:{}", ip, port)).map(HostAddress)
    }

    pub fn from_socket_addr(addr: SocketAddr) -> HostAddress {
        HostAddress(addr)
    }

    pub fn local_address(sock: &Socket) -> io::Result<HostAddress> {
        sock.local_addr().map(HostAddress)
    }

    pub fn peer_address(sock: &Socket) -> io::Result<HostAddress> {
        sock.peer_addr().map(HostAddress)
    }

    /// Resolves `hostname` to its first address, not touching `port` or the
    /// address family of the caller's choosing. Thread-safe: this goes
    /// through the system resolver via `ToSocketAddrs`, not a thread-local
    /// scratch buffer.
    pub fn resolve(hostname: &str, port: u16) -> io::Result<HostAddress> {
        (hostname, port)
            .to_socket_addrs()?
            .next()
            .map(HostAddress)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("could not resolve {}", hostname),
                )
            })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.0, SocketAddr::V6(_))
    }

    pub fn to_ip(&self) -> String {
        socket::to_ip(&self.0)
    }

    pub fn to_ip_port(&self) -> String {
        socket::to_ip_port(&self.0)
    }
}

impl From<SocketAddr> for HostAddress {
    fn from(addr: SocketAddr) -> HostAddress {
        HostAddress(addr)
    }
}

impl From<HostAddress> for SocketAddr {
    fn from(addr: HostAddress) -> SocketAddr {
        addr.0
    }
}

impl std::fmt::Display for HostAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_listening_address() {
        let addr = HostAddress::new(8080, false, false);
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(!addr.is_ipv6());
    }

    #[test]
    fn loopback_ipv6_listening_address() {
        let addr = HostAddress::new(0, true, true);
        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(addr.is_ipv6());
    }

    #[test]
    fn with_ip_port_roundtrips_string_form() {
        let addr = HostAddress::with_ip_port("127.0.0.1", 9000).unwrap();
        assert_eq!(addr.to_ip_port(), "127.0.0.1:9000");
        assert_eq!(addr.to_ip(), "127.0.0.1");
    }

    #[test]
    fn resolve_localhost() {
        let addr = HostAddress::resolve("localhost", 80).unwrap();
        assert_eq!(addr.port(), 80);
    }
}
