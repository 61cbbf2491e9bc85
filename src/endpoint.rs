//! IPv4/IPv6 socket address value (spec.md §3 "Endpoint").

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// Tagged variant over IPv4/IPv6 with a host-byte-order port.
///
/// Thin wrapper over `std::net::SocketAddr` — the standard library already
/// gives us the IPv4/IPv6 tagged representation and text/numeric conversions
/// spec.md asks for; this type exists so the rest of the crate has a single,
/// stable name to spell (matching muduo's `InetAddress`, which plays the same
/// role over `sockaddr_in`/`sockaddr_in6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl Endpoint {
    pub fn new(ip: std::net::IpAddr, port: u16) -> Endpoint {
        match ip {
            std::net::IpAddr::V4(addr) => Endpoint::V4(SocketAddrV4::new(addr, port)),
            std::net::IpAddr::V6(addr) => Endpoint::V6(SocketAddrV6::new(addr, port, 0, 0)),
        }
    }

    /// `0.0.0.0:port`, the muduo default when no explicit bind address is given.
    pub fn any_v4(port: u16) -> Endpoint {
        Endpoint::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    pub fn loopback_v4(port: u16) -> Endpoint {
        Endpoint::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    pub fn is_ipv4(self) -> bool {
        matches!(self, Endpoint::V4(_))
    }

    pub fn is_ipv6(self) -> bool {
        matches!(self, Endpoint::V6(_))
    }

    pub fn port(self) -> u16 {
        match self {
            Endpoint::V4(addr) => addr.port(),
            Endpoint::V6(addr) => addr.port(),
        }
    }

    pub fn ip(self) -> std::net::IpAddr {
        match self {
            Endpoint::V4(addr) => std::net::IpAddr::V4(*addr.ip()),
            Endpoint::V6(addr) => std::net::IpAddr::V6(*addr.ip()),
        }
    }

    /// `ip:port` text form, matching muduo's `InetAddress::toIpPort()` (used
    /// verbatim to build connection names, see `TcpServer::newConnection`).
    pub fn to_ip_port(self) -> String {
        match self {
            Endpoint::V4(addr) => format!("{}:{}", addr.ip(), addr.port()),
            Endpoint::V6(addr) => format!("[{}]:{}", addr.ip(), addr.port()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(v4),
            SocketAddr::V6(v6) => Endpoint::V6(v6),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> SocketAddr {
        match endpoint {
            Endpoint::V4(addr) => SocketAddr::V4(addr),
            Endpoint::V6(addr) => SocketAddr::V6(addr),
        }
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Endpoint, Self::Err> {
        s.parse::<SocketAddr>().map(Endpoint::from)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ip_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip_text() {
        let ep: Endpoint = "127.0.0.1:8080".parse().unwrap();
        assert!(ep.is_ipv4());
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_ip_port(), "127.0.0.1:8080");
    }

    #[test]
    fn v6_round_trip_text() {
        let ep: Endpoint = "[::1]:9090".parse().unwrap();
        assert!(ep.is_ipv6());
        assert_eq!(ep.port(), 9090);
        assert_eq!(ep.to_ip_port(), "[::1]:9090");
    }

    #[test]
    fn any_and_loopback() {
        let any = Endpoint::any_v4(0);
        assert_eq!(any.ip(), std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let lo = Endpoint::loopback_v4(7);
        assert_eq!(lo.to_ip_port(), "127.0.0.1:7");
    }
}
