//! Network endpoints.
//!
//! An [`Endpoint`] is where frames go: the address half of a channel.
//! Channel URIs parse into one, multicast channels derive their control
//! endpoint from the data endpoint by bumping the port, and the sender
//! and receiver key their socket tables by it. Storing the address and
//! port as separate fields keeps those derivations trivial; conversion
//! to [`SocketAddr`] happens only at the socket boundary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// An IP address plus UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    /// An endpoint at `ip`:`port`.
    #[must_use]
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// An IPv4 endpoint from dotted-quad octets.
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    /// The wildcard address on `port`, for sockets that bind before a
    /// peer is known (the sender's feedback socket, multicast joins).
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Loopback on `port`.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// The address half.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The port half.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The same address on another port. Multicast channels use this to
    /// place control traffic one port above the data group.
    #[must_use]
    pub const fn with_port(&self, port: u16) -> Self {
        Self::new(self.ip, port)
    }

    /// Whether the address names a multicast group, which decides a
    /// channel's delivery mode.
    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        match self.ip {
            IpAddr::V4(ip) => ip.is_multicast(),
            IpAddr::V6(ip) => ip.is_multicast(),
        }
    }

    /// Converts for the socket layer.
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.as_socket_addr()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SocketAddr's formatting brackets IPv6 addresses correctly.
        self.as_socket_addr().fmt(f)
    }
}
